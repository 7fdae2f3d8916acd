//! Observer events
//!
//! Delivered over a `tokio::sync::broadcast` channel. Sending never blocks
//! processing: with no receivers the event is dropped, and slow receivers see
//! `RecvError::Lagged` instead of holding up the sender.

use crate::types::{Alert, AnalyticsSnapshot, CognitiveState, PatternTag, Reading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// A run of consecutive readings sharing a pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternEpisode {
    /// `None` for flow episodes
    pub tag: Option<PatternTag>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub samples: usize,
}

impl PatternEpisode {
    pub fn is_flow(&self) -> bool {
        self.tag.is_none()
    }
}

/// Output of the asynchronous pattern branch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternReport {
    pub subject_id: String,
    /// Timestamp of the newest analyzed reading
    pub as_of: DateTime<Utc>,
    /// Tags flagged on the newest reading
    pub active_tags: BTreeSet<PatternTag>,
    /// Pattern and flow episodes, oldest first
    pub episodes: Vec<PatternEpisode>,
    pub analyzed_samples: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    DataProcessed {
        subject_id: String,
        timestamp: DateTime<Utc>,
        /// The reading as processed, after sanitizing and privacy noise
        reading: Reading,
        state: CognitiveState,
        snapshot: Arc<AnalyticsSnapshot>,
        alerts: Vec<Alert>,
        processing_ms: f64,
    },
    ReadingQueued {
        subject_id: String,
        timestamp: DateTime<Utc>,
        queue_depth: usize,
    },
    StaleReadingDropped {
        subject_id: String,
        timestamp: DateTime<Utc>,
        queued_ms: u64,
    },
    PatternsDetected(PatternReport),
    AnalysisFailed {
        subject_id: String,
        reason: String,
    },
    AlertRaised(Alert),
    CriticalAlert {
        reason: String,
        batch_id: Option<Uuid>,
        records: usize,
    },
    PerformanceWarning {
        subject_id: String,
        processing_ms: f64,
        threshold_ms: u64,
    },
    BatchFlushed {
        batch_id: Uuid,
        records: usize,
        attempt: u8,
    },
}

impl PipelineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::DataProcessed { .. } => "data_processed",
            PipelineEvent::ReadingQueued { .. } => "reading_queued",
            PipelineEvent::StaleReadingDropped { .. } => "stale_reading_dropped",
            PipelineEvent::PatternsDetected(_) => "patterns_detected",
            PipelineEvent::AnalysisFailed { .. } => "analysis_failed",
            PipelineEvent::AlertRaised(_) => "alert_raised",
            PipelineEvent::CriticalAlert { .. } => "critical_alert",
            PipelineEvent::PerformanceWarning { .. } => "performance_warning",
            PipelineEvent::BatchFlushed { .. } => "batch_flushed",
        }
    }
}
