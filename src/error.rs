//! Error types for Nexis Flux

use thiserror::Error;

/// Errors that can occur while configuring or running the pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Reading rejected: {reason}")]
    Validation { reason: String },

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage handoff failed: {0}")]
    Storage(String),

    #[error("Sensor error: {0}")]
    Sensor(String),

    #[error("Pattern analysis failed: {0}")]
    Analysis(String),
}

impl PipelineError {
    /// Shorthand for a validation rejection
    pub fn rejected(reason: impl Into<String>) -> Self {
        PipelineError::Validation {
            reason: reason.into(),
        }
    }

    /// Whether this error is a reading rejection rather than a fault
    pub fn is_validation(&self) -> bool {
        matches!(self, PipelineError::Validation { .. })
    }
}
