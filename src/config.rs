//! Pipeline configuration
//!
//! Every option has a default, so a partial JSON document (or none at all) is
//! enough to build a pipeline. `validate` catches settings that would make a
//! component unusable before anything is constructed.

use crate::error::PipelineError;
use crate::types::MetricKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Cache sizing and expiry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub default_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            default_ttl_ms: 5_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_millis(self.default_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

/// Sliding window bounds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Time horizon of a subject window (seconds)
    pub horizon_secs: u64,
    /// Hard cap on samples per window
    pub max_samples: usize,
    /// Wall-clock idle time after which a whole window is reclaimed (seconds)
    pub idle_reclaim_secs: u64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            horizon_secs: 300,
            max_samples: 300,
            idle_reclaim_secs: 1_800,
        }
    }
}

impl WindowConfig {
    pub fn horizon(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.horizon_secs as i64)
    }

    pub fn idle_reclaim(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_reclaim_secs as i64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    /// Relative change between oldest and newest thirds that counts as a trend
    pub trend_epsilon: f64,
    /// Fewer paired samples than this and a correlation is omitted
    pub min_correlation_samples: usize,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            trend_epsilon: 0.02,
            min_correlation_samples: 3,
        }
    }
}

/// Scoring and classification cutoffs. All of these are tunable defaults,
/// not validated physiological thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub resting_heart_rate: f64,
    /// Heart-rate distance from rest that maps to full deviation
    pub heart_rate_deviation_scale: f64,
    /// HRV at or above which there is no suppression (ms)
    pub hrv_reference_ms: f64,
    /// Skin conductance that maps to 1.0 (microsiemens)
    pub skin_conductance_scale: f64,
    /// Beta/alpha ratio that maps to 1.0
    pub beta_alpha_scale: f64,
    pub flow_threshold: f64,
    pub high_load_threshold: f64,
    pub low_attention_threshold: f64,
    pub detect_patterns: bool,
    pub hyperfocus_beta_share: f64,
    pub hyperfocus_hrv_cv: f64,
    pub burst_gamma_share: f64,
    pub burst_max_conductance: f64,
    pub theta_beta_ratio: f64,
    pub drift_theta_share: f64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            resting_heart_rate: 70.0,
            heart_rate_deviation_scale: 50.0,
            hrv_reference_ms: 100.0,
            skin_conductance_scale: 10.0,
            beta_alpha_scale: 2.0,
            flow_threshold: 0.75,
            high_load_threshold: 0.7,
            low_attention_threshold: 0.3,
            detect_patterns: true,
            hyperfocus_beta_share: 0.35,
            hyperfocus_hrv_cv: 0.15,
            burst_gamma_share: 0.20,
            burst_max_conductance: 0.30,
            theta_beta_ratio: 2.5,
            drift_theta_share: 0.30,
        }
    }
}

/// Which side of the threshold is alarming
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdDirection {
    Above,
    Below,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertThreshold {
    pub warn: f64,
    pub critical: f64,
    pub direction: ThresholdDirection,
}

impl AlertThreshold {
    pub fn above(warn: f64, critical: f64) -> Self {
        Self {
            warn,
            critical,
            direction: ThresholdDirection::Above,
        }
    }

    pub fn below(warn: f64, critical: f64) -> Self {
        Self {
            warn,
            critical,
            direction: ThresholdDirection::Below,
        }
    }

    fn is_ordered(&self) -> bool {
        match self.direction {
            ThresholdDirection::Above => self.critical >= self.warn,
            ThresholdDirection::Below => self.critical <= self.warn,
        }
    }
}

pub fn default_alert_thresholds() -> BTreeMap<MetricKind, AlertThreshold> {
    BTreeMap::from([
        (MetricKind::HeartRate, AlertThreshold::above(120.0, 160.0)),
        (MetricKind::Hrv, AlertThreshold::below(20.0, 10.0)),
        (MetricKind::OxygenSaturation, AlertThreshold::below(94.0, 90.0)),
        (MetricKind::RespiratoryRate, AlertThreshold::above(25.0, 30.0)),
        (MetricKind::Stress, AlertThreshold::above(0.7, 0.9)),
        (MetricKind::CognitiveLoad, AlertThreshold::above(0.8, 0.95)),
    ])
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    pub flush_interval_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 50,
            flush_interval_ms: 10_000,
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Deferred readings older than this are dropped instead of processed
    pub max_queue_age_ms: u64,
    /// How often the maintenance task drains the deferred queue
    pub drain_interval_ms: u64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            max_queue_age_ms: 30_000,
            drain_interval_ms: 500,
        }
    }
}

impl BackpressureConfig {
    pub fn max_queue_age(&self) -> Duration {
        Duration::from_millis(self.max_queue_age_ms)
    }

    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

/// Noise scales for the privacy guard
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Fixed RNG seed; entropy-seeded when absent
    pub seed: Option<u64>,
    pub heart_rate_bpm: f64,
    pub hrv_ms: f64,
    pub skin_conductance_us: f64,
    pub skin_temperature_c: f64,
    pub respiratory_rate: f64,
    pub spo2_percentage: f64,
    /// Relative noise applied to each band power
    pub brainwave_relative: f64,
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            seed: None,
            heart_rate_bpm: 2.0,
            hrv_ms: 5.0,
            skin_conductance_us: 0.05,
            skin_temperature_c: 0.1,
            respiratory_rate: 0.5,
            spo2_percentage: 0.5,
            brainwave_relative: 0.02,
        }
    }
}

/// Top-level pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub enable_privacy_protection: bool,
    pub enable_neurodivergent_analysis: bool,
    /// In-flight plus queued readings at which new readings are deferred
    pub max_processing_load: usize,
    pub batch_storage_enabled: bool,
    pub realtime_analytics_enabled: bool,
    pub cache: CacheConfig,
    pub window: WindowConfig,
    pub analytics: AnalyticsConfig,
    pub mapper: MapperConfig,
    pub alerts: BTreeMap<MetricKind, AlertThreshold>,
    pub batch: BatchConfig,
    pub backpressure: BackpressureConfig,
    pub privacy: PrivacyConfig,
    pub analysis_timeout_ms: u64,
    pub slow_processing_warn_ms: u64,
    /// Width of the stored cognitive embedding; 0 disables it
    pub embedding_dimensions: usize,
    /// Capacity of the observer broadcast channel
    pub event_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enable_privacy_protection: true,
            enable_neurodivergent_analysis: true,
            max_processing_load: 100,
            batch_storage_enabled: true,
            realtime_analytics_enabled: true,
            cache: CacheConfig::default(),
            window: WindowConfig::default(),
            analytics: AnalyticsConfig::default(),
            mapper: MapperConfig::default(),
            alerts: default_alert_thresholds(),
            batch: BatchConfig::default(),
            backpressure: BackpressureConfig::default(),
            privacy: PrivacyConfig::default(),
            analysis_timeout_ms: 2_000,
            slow_processing_warn_ms: 100,
            embedding_dimensions: 768,
            event_capacity: 256,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, PipelineError> {
        let contents = fs::read_to_string(&path)?;
        Self::from_json(&contents)
    }

    /// Parse and validate configuration from JSON
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn analysis_timeout(&self) -> Duration {
        Duration::from_millis(self.analysis_timeout_ms)
    }

    pub fn slow_processing_threshold(&self) -> Duration {
        Duration::from_millis(self.slow_processing_warn_ms)
    }

    /// Reject settings that would leave a component unusable
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.cache.max_size == 0 {
            return Err(PipelineError::Configuration(
                "cache.max_size must be at least 1".to_string(),
            ));
        }
        if self.cache.cleanup_interval_ms == 0 {
            return Err(PipelineError::Configuration(
                "cache.cleanup_interval_ms must be positive".to_string(),
            ));
        }
        if self.window.horizon_secs == 0 || self.window.max_samples == 0 {
            return Err(PipelineError::Configuration(
                "window horizon and max_samples must be positive".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 || self.batch.flush_interval_ms == 0 {
            return Err(PipelineError::Configuration(
                "batch size and flush interval must be positive".to_string(),
            ));
        }
        if self.max_processing_load == 0 {
            return Err(PipelineError::Configuration(
                "max_processing_load must be at least 1".to_string(),
            ));
        }
        if self.backpressure.drain_interval_ms == 0 {
            return Err(PipelineError::Configuration(
                "backpressure.drain_interval_ms must be positive".to_string(),
            ));
        }
        if self.event_capacity == 0 {
            return Err(PipelineError::Configuration(
                "event_capacity must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.mapper.flow_threshold) {
            return Err(PipelineError::Configuration(format!(
                "mapper.flow_threshold {} is outside [0, 1]",
                self.mapper.flow_threshold
            )));
        }
        if self.analytics.trend_epsilon < 0.0 {
            return Err(PipelineError::Configuration(
                "analytics.trend_epsilon must not be negative".to_string(),
            ));
        }
        for (metric, threshold) in &self.alerts {
            if !threshold.is_ordered() {
                return Err(PipelineError::Configuration(format!(
                    "alert threshold for {metric} has critical on the wrong side of warn"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = PipelineConfig::from_json(
            r#"{"max_processing_load": 5, "cache": {"max_size": 2}}"#,
        )
        .unwrap();

        assert_eq!(config.max_processing_load, 5);
        assert_eq!(config.cache.max_size, 2);
        assert_eq!(config.cache.default_ttl_ms, 5_000);
        assert!(config.enable_privacy_protection);
        assert_eq!(config.alerts.len(), default_alert_thresholds().len());
    }

    #[test]
    fn test_round_trip() {
        let config = PipelineConfig::default();
        let json = config.to_json_pretty().unwrap();
        let loaded = PipelineConfig::from_json(&json).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_zero_cache_size_rejected() {
        let result = PipelineConfig::from_json(r#"{"cache": {"max_size": 0}}"#);
        assert!(matches!(result, Err(PipelineError::Configuration(_))));
    }

    #[test]
    fn test_inverted_alert_threshold_rejected() {
        let mut config = PipelineConfig::default();
        config
            .alerts
            .insert(MetricKind::HeartRate, AlertThreshold::above(150.0, 120.0));
        assert!(config.validate().is_err());
    }
}
