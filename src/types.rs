//! Core types for the Nexis Flux pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: raw readings, analytics snapshots, cognitive states, generation
//! parameters, alerts and processing outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// EEG band powers (relative power, any consistent unit)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BrainwaveBands {
    pub alpha: f64,
    pub beta: f64,
    pub theta: f64,
    pub gamma: f64,
}

impl BrainwaveBands {
    /// Sum of all four band powers
    pub fn total(&self) -> f64 {
        self.alpha + self.beta + self.theta + self.gamma
    }

    /// Share of each band in the total power, or `None` when there is no power
    pub fn shares(&self) -> Option<BrainwaveBands> {
        let total = self.total();
        if total <= 0.0 {
            return None;
        }
        Some(BrainwaveBands {
            alpha: self.alpha / total,
            beta: self.beta / total,
            theta: self.theta / total,
            gamma: self.gamma / total,
        })
    }

    fn values(&self) -> [f64; 4] {
        [self.alpha, self.beta, self.theta, self.gamma]
    }

    /// Normalized Shannon evenness of the band distribution (0 = one band, 1 = flat)
    pub fn balance(&self) -> Option<f64> {
        let shares = self.shares()?;
        let entropy: f64 = shares
            .values()
            .iter()
            .filter(|p| **p > 0.0)
            .map(|p| -p * p.ln())
            .sum();
        Some((entropy / 4f64.ln()).clamp(0.0, 1.0))
    }
}

/// Ambient conditions captured alongside a reading
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentalContext {
    /// Ambient sound level (dB)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sound_db: Option<f64>,
    /// Ambient light level (lux)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_lux: Option<f64>,
    /// Ambient temperature (celsius)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature_c: Option<f64>,
    /// Relative humidity (percentage, 0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
}

/// Scores reported by the device itself, either on a 0-1 or a 0-100 scale
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportedScores {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attention: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cognitive_load: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stress: Option<f64>,
}

/// One timestamped sensor sample for a subject
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// Subject identifier (required)
    pub subject_id: String,
    /// Session identifier used to correlate readings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Capture time (UTC)
    pub timestamp: DateTime<Utc>,
    /// Device or source tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Heart rate (bpm)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heart_rate: Option<f64>,
    /// Heart rate variability (ms, RMSSD)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hrv_rmssd_ms: Option<f64>,
    /// Skin conductance (microsiemens)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skin_conductance_us: Option<f64>,
    /// Skin temperature (celsius)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skin_temperature_c: Option<f64>,
    /// Respiratory rate (breaths per minute)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respiratory_rate: Option<f64>,
    /// Blood oxygen saturation (percentage, 0-100)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2_percentage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub brainwaves: Option<BrainwaveBands>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentalContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported: Option<ReportedScores>,
}

impl Reading {
    /// Create an empty reading for a subject at a point in time
    pub fn new(subject_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            session_id: None,
            timestamp,
            source: None,
            heart_rate: None,
            hrv_rmssd_ms: None,
            skin_conductance_us: None,
            skin_temperature_c: None,
            respiratory_rate: None,
            spo2_percentage: None,
            brainwaves: None,
            environment: None,
            reported: None,
        }
    }

    /// Whether at least one physiological metric is present
    pub fn has_physiological_data(&self) -> bool {
        self.heart_rate.is_some()
            || self.hrv_rmssd_ms.is_some()
            || self.skin_conductance_us.is_some()
            || self.skin_temperature_c.is_some()
            || self.respiratory_rate.is_some()
            || self.spo2_percentage.is_some()
            || self.brainwaves.is_some()
    }

    /// Raw value of a sensor metric. Score metrics are derived and return `None`.
    pub fn metric(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::HeartRate => self.heart_rate,
            MetricKind::Hrv => self.hrv_rmssd_ms,
            MetricKind::SkinConductance => self.skin_conductance_us,
            MetricKind::SkinTemperature => self.skin_temperature_c,
            MetricKind::RespiratoryRate => self.respiratory_rate,
            MetricKind::OxygenSaturation => self.spo2_percentage,
            MetricKind::Alpha => self.brainwaves.map(|b| b.alpha),
            MetricKind::Beta => self.brainwaves.map(|b| b.beta),
            MetricKind::Theta => self.brainwaves.map(|b| b.theta),
            MetricKind::Gamma => self.brainwaves.map(|b| b.gamma),
            MetricKind::CognitiveLoad | MetricKind::Attention | MetricKind::Stress => None,
        }
    }
}

/// Metrics tracked by analytics, alerts and correlations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    HeartRate,
    Hrv,
    SkinConductance,
    SkinTemperature,
    RespiratoryRate,
    OxygenSaturation,
    Alpha,
    Beta,
    Theta,
    Gamma,
    CognitiveLoad,
    Attention,
    Stress,
}

impl MetricKind {
    /// Metrics read directly from a reading
    pub const SENSOR: [MetricKind; 10] = [
        MetricKind::HeartRate,
        MetricKind::Hrv,
        MetricKind::SkinConductance,
        MetricKind::SkinTemperature,
        MetricKind::RespiratoryRate,
        MetricKind::OxygenSaturation,
        MetricKind::Alpha,
        MetricKind::Beta,
        MetricKind::Theta,
        MetricKind::Gamma,
    ];

    /// Metrics derived by point scoring
    pub const SCORES: [MetricKind; 3] = [
        MetricKind::CognitiveLoad,
        MetricKind::Attention,
        MetricKind::Stress,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::HeartRate => "heart_rate",
            MetricKind::Hrv => "hrv",
            MetricKind::SkinConductance => "skin_conductance",
            MetricKind::SkinTemperature => "skin_temperature",
            MetricKind::RespiratoryRate => "respiratory_rate",
            MetricKind::OxygenSaturation => "oxygen_saturation",
            MetricKind::Alpha => "alpha",
            MetricKind::Beta => "beta",
            MetricKind::Theta => "theta",
            MetricKind::Gamma => "gamma",
            MetricKind::CognitiveLoad => "cognitive_load",
            MetricKind::Attention => "attention",
            MetricKind::Stress => "stress",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a metric over the window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// Pearson correlation between two metric series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Correlation {
    pub first: MetricKind,
    pub second: MetricKind,
    /// Coefficient in [-1, 1]
    pub coefficient: f64,
    /// Number of paired samples used
    pub samples: usize,
}

/// Point scores derived from a single reading (all in [0, 1])
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PointScores {
    pub cognitive_load: f64,
    pub attention: f64,
    pub stress: f64,
    pub flow_score: f64,
}

impl PointScores {
    pub fn get(&self, kind: MetricKind) -> Option<f64> {
        match kind {
            MetricKind::CognitiveLoad => Some(self.cognitive_load),
            MetricKind::Attention => Some(self.attention),
            MetricKind::Stress => Some(self.stress),
            _ => None,
        }
    }
}

/// Derived statistics for one subject's window. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsSnapshot {
    pub subject_id: String,
    /// Timestamp of the newest reading in the window
    pub as_of: Option<DateTime<Utc>>,
    pub sample_count: usize,
    /// Raw metric values of the newest reading
    pub current: BTreeMap<MetricKind, f64>,
    /// Point scores of the newest reading
    pub scores: PointScores,
    /// Arithmetic mean per metric
    pub averages: BTreeMap<MetricKind, f64>,
    /// Population standard deviation per metric
    pub variability: BTreeMap<MetricKind, f64>,
    pub trends: BTreeMap<MetricKind, Trend>,
    pub correlations: Vec<Correlation>,
}

impl AnalyticsSnapshot {
    /// Current value for a metric, looking at point scores for derived metrics
    pub fn value(&self, kind: MetricKind) -> Option<f64> {
        self.scores.get(kind).or_else(|| self.current.get(&kind).copied())
    }

    /// Trend for a metric, `Stable` when unknown
    pub fn trend(&self, kind: MetricKind) -> Trend {
        self.trends.get(&kind).copied().unwrap_or(Trend::Stable)
    }

    /// Coefficient of variation (std dev / mean) for a metric
    pub fn coefficient_of_variation(&self, kind: MetricKind) -> Option<f64> {
        let mean = *self.averages.get(&kind)?;
        let std_dev = *self.variability.get(&kind)?;
        if mean.abs() < f64::EPSILON {
            return None;
        }
        Some(std_dev / mean.abs())
    }

    /// Correlation for an unordered metric pair
    pub fn correlation(&self, a: MetricKind, b: MetricKind) -> Option<f64> {
        self.correlations
            .iter()
            .find(|c| (c.first == a && c.second == b) || (c.first == b && c.second == a))
            .map(|c| c.coefficient)
    }
}

/// Pattern tags evaluated per reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternTag {
    /// High beta share with highly variable HRV
    AttentionalHyperfocus,
    /// High gamma share with low skin conductance
    PatternRecognitionBurst,
    /// Elevated theta/beta ratio
    ThetaBetaElevation,
    /// Falling attention with a large theta share
    AttentionDrift,
}

impl PatternTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternTag::AttentionalHyperfocus => "attentional_hyperfocus",
            PatternTag::PatternRecognitionBurst => "pattern_recognition_burst",
            PatternTag::ThetaBetaElevation => "theta_beta_elevation",
            PatternTag::AttentionDrift => "attention_drift",
        }
    }
}

/// Classified cognitive state for one reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CognitiveState {
    pub cognitive_load: f64,
    pub attention_level: f64,
    pub stress_level: f64,
    pub flow_state: bool,
    pub flow_score: f64,
    pub active_patterns: BTreeSet<PatternTag>,
}

/// Regime selected for the downstream model call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationRegime {
    Focused,
    Engaging,
    Balanced,
}

/// Tuning values handed to the model-call collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub temperature: f64,
    pub token_budget: u32,
    pub regime: GenerationRegime,
}

/// Cognitive state paired with its generation parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelContext {
    pub subject_id: String,
    pub as_of: DateTime<Utc>,
    pub state: CognitiveState,
    pub parameters: GenerationParameters,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Threshold crossing for one metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub severity: AlertSeverity,
    pub metric: MetricKind,
    pub value: f64,
    pub threshold: f64,
    pub subject_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of a reading that went all the way through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedReading {
    /// Sanitized (and protected, when enabled) reading
    pub reading: Reading,
    pub snapshot: Arc<AnalyticsSnapshot>,
    pub state: CognitiveState,
    pub parameters: GenerationParameters,
    pub alerts: Vec<Alert>,
    pub warnings: Vec<String>,
    pub processing_ms: f64,
}

/// Outcome of `process_reading`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ProcessOutcome {
    /// Fully processed on the calling task
    Processed(Box<ProcessedReading>),
    /// Accepted but deferred by backpressure
    Queued {
        subject_id: String,
        timestamp: DateTime<Utc>,
        queue_depth: usize,
    },
}

impl ProcessOutcome {
    pub fn is_queued(&self) -> bool {
        matches!(self, ProcessOutcome::Queued { .. })
    }

    pub fn processed(&self) -> Option<&ProcessedReading> {
        match self {
            ProcessOutcome::Processed(p) => Some(p),
            ProcessOutcome::Queued { .. } => None,
        }
    }
}
