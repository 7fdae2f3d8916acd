//! Nexis Flux - Real-time biometric processing for cognitive-state-aware generation
//!
//! Flux turns a stream of per-subject sensor readings into cognitive states and
//! model-call parameters through a pipeline: validation → privacy protection →
//! sliding window → analytics → cognitive mapping → alerts, with pattern
//! analysis and batched storage running off the critical path.
//!
//! ## Modules
//!
//! - **Pipeline**: `BiometricPipeline` orchestrates every stage with backpressure
//! - **Collection**: `SensorDevice` implementations feed `run_collection`

pub mod alerts;
pub mod analytics;
pub mod batch;
pub mod cache;
pub mod cognitive;
pub mod collector;
pub mod config;
pub mod embedding;
pub mod error;
pub mod events;
pub mod metrics;
pub mod patterns;
pub mod pipeline;
pub mod privacy;
pub mod sensor;
pub mod storage;
pub mod types;
pub mod validator;
pub mod window;

pub use config::PipelineConfig;
pub use error::PipelineError;
pub use events::PipelineEvent;
pub use pipeline::{BiometricPipeline, DrainSummary, PipelineBuilder};
pub use types::{CognitiveState, GenerationParameters, ModelContext, ProcessOutcome, Reading};

// Collaborator seams
pub use patterns::{EpisodeAnalyzer, PatternAnalyzer};
pub use sensor::{SensorDevice, SimulatedDevice};
pub use storage::{BiometricStore, MemoryStore};

/// Flux version reported by the CLI
pub const FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name attached to stored batches and CLI output
pub const PRODUCER_NAME: &str = "nexis-flux";
