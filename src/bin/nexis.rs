//! Nexis CLI - Command-line interface for Nexis Flux
//!
//! Commands:
//! - process: Run NDJSON readings through the pipeline
//! - simulate: Collect from a simulated wearable
//! - validate: Check readings without processing them
//! - config: Print or check pipeline configuration
//! - doctor: Diagnose pipeline health and configuration

use clap::{Parser, Subcommand, ValueEnum};
use log::{info, warn};
use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;

use nexis_flux::collector::{run_collection, CollectionOptions, CollectionSummary};
use nexis_flux::validator::ReadingValidator;
use nexis_flux::{
    BiometricPipeline, PipelineConfig, PipelineError, ProcessOutcome, Reading, SimulatedDevice,
    FLUX_VERSION, PRODUCER_NAME,
};

/// Nexis - Real-time biometric processing for cognitive-state-aware generation
#[derive(Parser)]
#[command(name = "nexis")]
#[command(author = "Nexis Labs")]
#[command(version = FLUX_VERSION)]
#[command(about = "Turn biometric readings into cognitive states", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run readings through the pipeline (one JSON reading per line)
    Process {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output file path (use - for stdout)
        #[arg(short, long, default_value = "-")]
        output: PathBuf,

        /// Pipeline configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output format
        #[arg(long, default_value = "ndjson")]
        output_format: OutputFormat,

        /// Stop at the first rejected reading
        #[arg(long)]
        fail_fast: bool,
    },

    /// Collect from a simulated wearable
    Simulate {
        /// Subject identifier
        #[arg(long, default_value = "sim-subject")]
        subject: String,

        /// Number of samples to collect
        #[arg(long, default_value = "30")]
        samples: usize,

        /// Sample rate in Hz
        #[arg(long, default_value = "1.0")]
        rate: f64,

        /// RNG seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,

        /// Emit wrist-only readings without EEG bands
        #[arg(long)]
        no_brainwaves: bool,

        /// Pipeline configuration file (JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate readings without processing them
    Validate {
        /// Input file path (use - for stdin)
        #[arg(short, long, default_value = "-")]
        input: PathBuf,

        /// Output validation report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the default configuration or check a configuration file
    Config {
        /// Configuration file to check
        #[arg(long)]
        check: Option<PathBuf>,
    },

    /// Diagnose pipeline health and configuration
    Doctor {
        /// Configuration file to check
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    /// Newline-delimited JSON (one outcome per line)
    Ndjson,
    /// JSON array of outcomes
    Json,
    /// Pretty-printed JSON
    JsonPretty,
}

fn main() -> ExitCode {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(NexisCliError::from)
        .and_then(|runtime| runtime.block_on(run(cli)));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!(
                "{}",
                serde_json::to_string(&CliError::from(e))
                    .unwrap_or_else(|_| "Unknown error".to_string())
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), NexisCliError> {
    match cli.command {
        Commands::Process {
            input,
            output,
            config,
            output_format,
            fail_fast,
        } => cmd_process(&input, &output, config.as_deref(), output_format, fail_fast).await,

        Commands::Simulate {
            subject,
            samples,
            rate,
            seed,
            no_brainwaves,
            config,
        } => cmd_simulate(&subject, samples, rate, seed, no_brainwaves, config.as_deref()).await,

        Commands::Validate { input, json } => cmd_validate(&input, json),

        Commands::Config { check } => cmd_config(check.as_deref()),

        Commands::Doctor { config, json } => cmd_doctor(config.as_deref(), json).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<PipelineConfig, NexisCliError> {
    match path {
        Some(path) => Ok(PipelineConfig::load_from_file(path)?),
        None => Ok(PipelineConfig::default()),
    }
}

fn open_input(input: &Path) -> Result<Box<dyn BufRead>, NexisCliError> {
    if input.to_string_lossy() == "-" {
        Ok(Box::new(BufReader::new(io::stdin())))
    } else {
        Ok(Box::new(BufReader::new(fs::File::open(input)?)))
    }
}

fn open_output(output: &Path) -> Result<Box<dyn Write>, NexisCliError> {
    if output.to_string_lossy() == "-" {
        Ok(Box::new(io::stdout()))
    } else {
        Ok(Box::new(fs::File::create(output)?))
    }
}

fn parse_reading(line: &str, line_no: usize) -> Result<Reading, NexisCliError> {
    serde_json::from_str(line).map_err(|e| {
        NexisCliError::ParseError(format!("line {line_no}: failed to parse reading: {e}"))
    })
}

async fn cmd_process(
    input: &Path,
    output: &Path,
    config: Option<&Path>,
    output_format: OutputFormat,
    fail_fast: bool,
) -> Result<(), NexisCliError> {
    let pipeline = BiometricPipeline::new(load_config(config)?)?;
    let cancel = CancellationToken::new();
    let maintenance = pipeline.spawn_maintenance(cancel.clone());

    let reader = open_input(input)?;
    let mut writer = open_output(output)?;
    let mut collected: Vec<ProcessOutcome> = Vec::new();
    let mut total = 0usize;
    let mut rejected = 0usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        total += 1;

        let reading = parse_reading(trimmed, index + 1)?;
        let outcome = match pipeline.process_reading(reading).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_validation() && !fail_fast => {
                rejected += 1;
                warn!("line {}: {e}", index + 1);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match output_format {
            OutputFormat::Ndjson => {
                writeln!(writer, "{}", serde_json::to_string(&outcome)?)?;
                writer.flush()?;
            }
            OutputFormat::Json | OutputFormat::JsonPretty => collected.push(outcome),
        }
    }

    cancel.cancel();
    if let Err(e) = maintenance.await {
        warn!("maintenance task ended abnormally: {e}");
    }
    pipeline.shutdown().await;

    match output_format {
        OutputFormat::Ndjson => {}
        OutputFormat::Json => writeln!(writer, "{}", serde_json::to_string(&collected)?)?,
        OutputFormat::JsonPretty => {
            writeln!(writer, "{}", serde_json::to_string_pretty(&collected)?)?
        }
    }
    writer.flush()?;

    if total == 0 {
        return Err(NexisCliError::NoReadings);
    }
    let metrics = pipeline.metrics();
    info!(
        "{} readings: {} processed, {} rejected, {} alerts",
        total, metrics.processed, rejected, metrics.alerts
    );
    Ok(())
}

#[derive(serde::Serialize)]
struct SimulationReport {
    producer: String,
    subject_id: String,
    collection: CollectionSummary,
    model_context: Option<nexis_flux::ModelContext>,
    metrics: nexis_flux::metrics::MetricsSnapshot,
}

async fn cmd_simulate(
    subject: &str,
    samples: usize,
    rate: f64,
    seed: Option<u64>,
    no_brainwaves: bool,
    config: Option<&Path>,
) -> Result<(), NexisCliError> {
    let pipeline = BiometricPipeline::new(load_config(config)?)?;
    let cancel = CancellationToken::new();
    let maintenance = pipeline.spawn_maintenance(cancel.clone());

    let mut device = SimulatedDevice::new(subject, seed)?.with_session(uuid_session());
    if no_brainwaves {
        device = device.without_brainwaves();
    }

    let options = CollectionOptions {
        sample_rate_hz: rate,
        max_samples: Some(samples),
    };

    let collection = tokio::select! {
        result = run_collection(&mut device, &pipeline, &options, cancel.clone()) => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, stopping collection");
            CollectionSummary::default()
        }
    };

    cancel.cancel();
    if let Err(e) = maintenance.await {
        warn!("maintenance task ended abnormally: {e}");
    }
    pipeline.shutdown().await;

    let report = SimulationReport {
        producer: PRODUCER_NAME.to_string(),
        subject_id: subject.to_string(),
        collection,
        model_context: pipeline.model_context(subject),
        metrics: pipeline.metrics(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn uuid_session() -> String {
    format!("sim-{}", uuid::Uuid::new_v4())
}

fn cmd_validate(input: &Path, json: bool) -> Result<(), NexisCliError> {
    let mut data = String::new();
    open_input(input)?.read_to_string(&mut data)?;

    let validator = ReadingValidator;
    let mut report = ValidationSummary::default();

    for (index, line) in data.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        report.total_readings += 1;

        let result = parse_reading(trimmed, index + 1).map(|r| validator.validate(&r));
        match result {
            Ok(outcome) if outcome.valid => {
                report.valid_readings += 1;
                report.warnings += outcome.warnings.len();
            }
            Ok(outcome) => report.errors.push(ValidationErrorDetail {
                line: index + 1,
                error: outcome.reason.unwrap_or_default(),
            }),
            Err(e) => report.errors.push(ValidationErrorDetail {
                line: index + 1,
                error: CliError::from(e).message,
            }),
        }
    }
    report.invalid_readings = report.errors.len();

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Validation Report");
        println!("=================");
        println!("Total readings:   {}", report.total_readings);
        println!("Valid readings:   {}", report.valid_readings);
        println!("Invalid readings: {}", report.invalid_readings);
        println!("Warnings:         {}", report.warnings);

        if !report.errors.is_empty() {
            println!("\nErrors:");
            for err in &report.errors {
                println!("  - line {}: {}", err.line, err.error);
            }
        }
    }

    if report.total_readings == 0 {
        Err(NexisCliError::NoReadings)
    } else if report.invalid_readings > 0 {
        Err(NexisCliError::ValidationFailed(report.invalid_readings))
    } else {
        Ok(())
    }
}

fn cmd_config(check: Option<&Path>) -> Result<(), NexisCliError> {
    match check {
        Some(path) => {
            let config = PipelineConfig::load_from_file(path)?;
            println!(
                "Configuration valid (max load {}, window {}s, cache {})",
                config.max_processing_load, config.window.horizon_secs, config.cache.max_size
            );
        }
        None => println!("{}", PipelineConfig::default().to_json_pretty()?),
    }
    Ok(())
}

async fn cmd_doctor(config: Option<&Path>, json: bool) -> Result<(), NexisCliError> {
    let mut checks: Vec<DoctorCheck> = Vec::new();

    checks.push(DoctorCheck {
        name: "flux_version".to_string(),
        status: CheckStatus::Ok,
        message: format!("Flux version {}", FLUX_VERSION),
    });

    let pipeline_config = match config {
        Some(path) if !path.exists() => {
            checks.push(DoctorCheck {
                name: "config".to_string(),
                status: CheckStatus::Warning,
                message: "Configuration file does not exist, using defaults".to_string(),
            });
            Some(PipelineConfig::default())
        }
        Some(path) => match PipelineConfig::load_from_file(path) {
            Ok(config) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Ok,
                    message: "Configuration file valid".to_string(),
                });
                Some(config)
            }
            Err(e) => {
                checks.push(DoctorCheck {
                    name: "config".to_string(),
                    status: CheckStatus::Error,
                    message: e.to_string(),
                });
                None
            }
        },
        None => Some(PipelineConfig::default()),
    };

    if let Some(pipeline_config) = pipeline_config {
        checks.push(smoke_test(pipeline_config).await);
    }

    let stdin_check = if atty::is(atty::Stream::Stdin) {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a TTY (interactive mode)".to_string(),
        }
    } else {
        DoctorCheck {
            name: "stdin".to_string(),
            status: CheckStatus::Ok,
            message: "stdin is a pipe (streaming mode ready)".to_string(),
        }
    };
    checks.push(stdin_check);

    let report = DoctorReport {
        producer: PRODUCER_NAME.to_string(),
        version: FLUX_VERSION.to_string(),
        checks,
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("Nexis Doctor Report");
        println!("===================");
        println!("Producer: {}", report.producer);
        println!("Version:  {}", report.version);
        println!("\nChecks:");

        for check in &report.checks {
            let status_icon = match check.status {
                CheckStatus::Ok => "[OK]",
                CheckStatus::Warning => "[WARN]",
                CheckStatus::Error => "[ERR]",
            };
            println!("  {} {}: {}", status_icon, check.name, check.message);
        }
    }

    let has_errors = report.checks.iter().any(|c| matches!(c.status, CheckStatus::Error));
    if has_errors {
        Err(NexisCliError::DoctorFailed)
    } else {
        Ok(())
    }
}

/// Push a few simulated readings through a throwaway pipeline
async fn smoke_test(config: PipelineConfig) -> DoctorCheck {
    match run_smoke_test(config).await {
        Ok(accepted) if accepted == 5 => DoctorCheck {
            name: "pipeline".to_string(),
            status: CheckStatus::Ok,
            message: "Simulated readings processed end to end".to_string(),
        },
        Ok(accepted) => DoctorCheck {
            name: "pipeline".to_string(),
            status: CheckStatus::Warning,
            message: format!("Only {accepted} of 5 simulated readings accepted"),
        },
        Err(e) => DoctorCheck {
            name: "pipeline".to_string(),
            status: CheckStatus::Error,
            message: e.to_string(),
        },
    }
}

async fn run_smoke_test(config: PipelineConfig) -> Result<usize, PipelineError> {
    let pipeline = BiometricPipeline::new(config)?;
    let mut device = SimulatedDevice::new("doctor", Some(0))?;
    let options = CollectionOptions {
        sample_rate_hz: 50.0,
        max_samples: Some(5),
    };
    let summary =
        run_collection(&mut device, &pipeline, &options, CancellationToken::new()).await?;
    pipeline.shutdown().await;
    Ok(summary.processed + summary.queued)
}

// Error types

#[derive(Debug)]
enum NexisCliError {
    Io(io::Error),
    Pipeline(PipelineError),
    Json(serde_json::Error),
    NoReadings,
    ValidationFailed(usize),
    DoctorFailed,
    ParseError(String),
}

impl From<io::Error> for NexisCliError {
    fn from(e: io::Error) -> Self {
        NexisCliError::Io(e)
    }
}

impl From<PipelineError> for NexisCliError {
    fn from(e: PipelineError) -> Self {
        NexisCliError::Pipeline(e)
    }
}

impl From<serde_json::Error> for NexisCliError {
    fn from(e: serde_json::Error) -> Self {
        NexisCliError::Json(e)
    }
}

#[derive(serde::Serialize)]
struct CliError {
    code: String,
    message: String,
    hint: Option<String>,
}

impl From<NexisCliError> for CliError {
    fn from(e: NexisCliError) -> Self {
        match e {
            NexisCliError::Io(e) => CliError {
                code: "IO_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check file paths and permissions".to_string()),
            },
            NexisCliError::Pipeline(e) if e.is_validation() => CliError {
                code: "VALIDATION_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Run 'nexis validate' for details".to_string()),
            },
            NexisCliError::Pipeline(PipelineError::Configuration(msg)) => CliError {
                code: "CONFIG_ERROR".to_string(),
                message: msg,
                hint: Some("Run 'nexis config' to see the defaults".to_string()),
            },
            NexisCliError::Pipeline(e) => CliError {
                code: "PIPELINE_ERROR".to_string(),
                message: e.to_string(),
                hint: None,
            },
            NexisCliError::Json(e) => CliError {
                code: "JSON_ERROR".to_string(),
                message: e.to_string(),
                hint: Some("Check JSON syntax".to_string()),
            },
            NexisCliError::NoReadings => CliError {
                code: "NO_READINGS".to_string(),
                message: "No readings found in input".to_string(),
                hint: Some("Ensure input is not empty".to_string()),
            },
            NexisCliError::ValidationFailed(count) => CliError {
                code: "VALIDATION_FAILED".to_string(),
                message: format!("{} readings failed validation", count),
                hint: Some("Fix validation errors and retry".to_string()),
            },
            NexisCliError::DoctorFailed => CliError {
                code: "DOCTOR_FAILED".to_string(),
                message: "One or more health checks failed".to_string(),
                hint: Some("Review the doctor report for details".to_string()),
            },
            NexisCliError::ParseError(msg) => CliError {
                code: "PARSE_ERROR".to_string(),
                message: msg,
                hint: Some("Each line must be one JSON reading with subject_id and timestamp".to_string()),
            },
        }
    }
}

// Report types

#[derive(Default, serde::Serialize)]
struct ValidationSummary {
    total_readings: usize,
    valid_readings: usize,
    invalid_readings: usize,
    warnings: usize,
    errors: Vec<ValidationErrorDetail>,
}

#[derive(serde::Serialize)]
struct ValidationErrorDetail {
    line: usize,
    error: String,
}

#[derive(serde::Serialize)]
struct DoctorReport {
    producer: String,
    version: String,
    checks: Vec<DoctorCheck>,
}

#[derive(serde::Serialize)]
struct DoctorCheck {
    name: String,
    status: CheckStatus,
    message: String,
}

#[derive(serde::Serialize)]
enum CheckStatus {
    Ok,
    Warning,
    Error,
}
