//! Reading validation and sanitization
//!
//! This module range-checks incoming readings before anything else sees them.
//! - Hard violations (impossible physiology, missing identifiers) reject the reading
//! - Missing optional data produces warnings that never block processing
//! - `sanitize` clamps soft out-of-range values and fills defaults

use crate::types::Reading;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MIN_HEART_RATE: f64 = 30.0;
pub const MAX_HEART_RATE: f64 = 250.0;
pub const MIN_RESPIRATORY_RATE: f64 = 4.0;
pub const MAX_RESPIRATORY_RATE: f64 = 60.0;
pub const DEFAULT_SOURCE: &str = "unknown";

/// Allowed clock skew before a timestamp is flagged as in the future
const FUTURE_SKEW_MINUTES: i64 = 5;

/// Non-fatal issue found during validation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationWarning {
    MissingSessionId,
    MissingSource,
    MissingBrainwaves,
    MissingSkinConductance,
    MissingEnvironment,
    MissingSoundLevel,
    MissingLightLevel,
    MissingAmbientTemperature,
    MissingHumidity,
    FutureTimestamp,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ValidationWarning::MissingSessionId => "missing session id",
            ValidationWarning::MissingSource => "missing source tag",
            ValidationWarning::MissingBrainwaves => "missing brainwave data",
            ValidationWarning::MissingSkinConductance => "missing skin conductance",
            ValidationWarning::MissingEnvironment => "missing environmental context",
            ValidationWarning::MissingSoundLevel => "missing ambient sound level",
            ValidationWarning::MissingLightLevel => "missing ambient light level",
            ValidationWarning::MissingAmbientTemperature => "missing ambient temperature",
            ValidationWarning::MissingHumidity => "missing humidity",
            ValidationWarning::FutureTimestamp => "timestamp is in the future",
        };
        f.write_str(text)
    }
}

/// Outcome of validating one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: bool,
    pub warnings: Vec<ValidationWarning>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ValidationReport {
    fn rejected(reason: String, warnings: Vec<ValidationWarning>) -> Self {
        Self {
            valid: false,
            warnings,
            reason: Some(reason),
        }
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(|w| w.to_string()).collect()
    }
}

/// Validator for raw readings
#[derive(Debug, Clone, Copy, Default)]
pub struct ReadingValidator;

impl ReadingValidator {
    /// Validate a reading against the current wall clock
    pub fn validate(&self, reading: &Reading) -> ValidationReport {
        self.validate_at(reading, Utc::now())
    }

    /// Validate a reading against an explicit reference time
    pub fn validate_at(&self, reading: &Reading, now: DateTime<Utc>) -> ValidationReport {
        let warnings = collect_warnings(reading, now);

        match find_violation(reading) {
            Some(reason) => ValidationReport::rejected(reason, warnings),
            None => ValidationReport {
                valid: true,
                warnings,
                reason: None,
            },
        }
    }

    /// Return a sanitized copy of the reading
    pub fn sanitize(&self, reading: &Reading) -> Reading {
        let mut clean = reading.clone();

        clean.subject_id = clean.subject_id.trim().to_string();
        if clean.source.as_deref().map_or(true, |s| s.trim().is_empty()) {
            clean.source = Some(DEFAULT_SOURCE.to_string());
        }

        clean.skin_conductance_us = clean.skin_conductance_us.map(non_negative);
        clean.respiratory_rate = clean
            .respiratory_rate
            .map(|r| r.clamp(MIN_RESPIRATORY_RATE, MAX_RESPIRATORY_RATE));

        if let Some(bands) = clean.brainwaves.as_mut() {
            bands.alpha = non_negative(bands.alpha);
            bands.beta = non_negative(bands.beta);
            bands.theta = non_negative(bands.theta);
            bands.gamma = non_negative(bands.gamma);
        }

        if let Some(env) = clean.environment.as_mut() {
            env.sound_db = env.sound_db.map(non_negative);
            env.light_lux = env.light_lux.map(non_negative);
        }

        if let Some(reported) = clean.reported.as_mut() {
            reported.attention = reported.attention.map(normalize_score);
            reported.cognitive_load = reported.cognitive_load.map(normalize_score);
            reported.stress = reported.stress.map(normalize_score);
        }

        clean
    }
}

fn non_negative(value: f64) -> f64 {
    value.max(0.0)
}

/// Scores above 1.0 are percentages
fn normalize_score(value: f64) -> f64 {
    if value > 1.0 {
        (value / 100.0).clamp(0.0, 1.0)
    } else {
        value.clamp(0.0, 1.0)
    }
}

fn find_violation(reading: &Reading) -> Option<String> {
    if reading.subject_id.trim().is_empty() {
        return Some("subject_id is required".to_string());
    }

    if let Some(field) = first_non_finite(reading) {
        return Some(format!("{field} is not a finite number"));
    }

    if !reading.has_physiological_data() {
        return Some("at least one physiological metric is required".to_string());
    }

    if let Some(hr) = reading.heart_rate {
        if !(MIN_HEART_RATE..=MAX_HEART_RATE).contains(&hr) {
            return Some(format!(
                "heart_rate {hr} outside [{MIN_HEART_RATE}, {MAX_HEART_RATE}]"
            ));
        }
    }

    if let Some(hrv) = reading.hrv_rmssd_ms {
        if hrv < 0.0 {
            return Some(format!("hrv_rmssd_ms {hrv} is negative"));
        }
    }

    let percentages = [
        ("spo2_percentage", reading.spo2_percentage),
        (
            "humidity_pct",
            reading.environment.as_ref().and_then(|e| e.humidity_pct),
        ),
        (
            "reported.attention",
            reading.reported.as_ref().and_then(|r| r.attention),
        ),
        (
            "reported.cognitive_load",
            reading.reported.as_ref().and_then(|r| r.cognitive_load),
        ),
        (
            "reported.stress",
            reading.reported.as_ref().and_then(|r| r.stress),
        ),
    ];
    for (field, value) in percentages {
        if let Some(v) = value {
            if !(0.0..=100.0).contains(&v) {
                return Some(format!("{field} {v} outside [0, 100]"));
            }
        }
    }

    None
}

fn first_non_finite(reading: &Reading) -> Option<&'static str> {
    let env = reading.environment.clone().unwrap_or_default();
    let reported = reading.reported.clone().unwrap_or_default();
    let bands = reading.brainwaves;

    let fields = [
        ("heart_rate", reading.heart_rate),
        ("hrv_rmssd_ms", reading.hrv_rmssd_ms),
        ("skin_conductance_us", reading.skin_conductance_us),
        ("skin_temperature_c", reading.skin_temperature_c),
        ("respiratory_rate", reading.respiratory_rate),
        ("spo2_percentage", reading.spo2_percentage),
        ("brainwaves.alpha", bands.map(|b| b.alpha)),
        ("brainwaves.beta", bands.map(|b| b.beta)),
        ("brainwaves.theta", bands.map(|b| b.theta)),
        ("brainwaves.gamma", bands.map(|b| b.gamma)),
        ("environment.sound_db", env.sound_db),
        ("environment.light_lux", env.light_lux),
        ("environment.temperature_c", env.temperature_c),
        ("environment.humidity_pct", env.humidity_pct),
        ("reported.attention", reported.attention),
        ("reported.cognitive_load", reported.cognitive_load),
        ("reported.stress", reported.stress),
    ];

    fields
        .iter()
        .find(|(_, value)| value.map_or(false, |v| !v.is_finite()))
        .map(|(name, _)| *name)
}

fn collect_warnings(reading: &Reading, now: DateTime<Utc>) -> Vec<ValidationWarning> {
    let mut warnings = Vec::new();

    if reading.session_id.is_none() {
        warnings.push(ValidationWarning::MissingSessionId);
    }
    if reading.source.is_none() {
        warnings.push(ValidationWarning::MissingSource);
    }
    if reading.brainwaves.is_none() {
        warnings.push(ValidationWarning::MissingBrainwaves);
    }
    if reading.skin_conductance_us.is_none() {
        warnings.push(ValidationWarning::MissingSkinConductance);
    }

    match &reading.environment {
        None => warnings.push(ValidationWarning::MissingEnvironment),
        Some(env) => {
            if env.sound_db.is_none() {
                warnings.push(ValidationWarning::MissingSoundLevel);
            }
            if env.light_lux.is_none() {
                warnings.push(ValidationWarning::MissingLightLevel);
            }
            if env.temperature_c.is_none() {
                warnings.push(ValidationWarning::MissingAmbientTemperature);
            }
            if env.humidity_pct.is_none() {
                warnings.push(ValidationWarning::MissingHumidity);
            }
        }
    }

    if reading.timestamp > now + Duration::minutes(FUTURE_SKEW_MINUTES) {
        warnings.push(ValidationWarning::FutureTimestamp);
    }

    warnings
}
