//! Fixed-width cognitive embedding
//!
//! Flattens a window into a vector for downstream training stores: 14 features
//! per reading, newest reading first, zero-padded or truncated to the
//! configured width. Missing metrics contribute 0.

use crate::cognitive::PointScorer;
use crate::config::MapperConfig;
use crate::types::Reading;
use chrono::{Datelike, Timelike};

/// Features emitted per reading
pub const FEATURES_PER_READING: usize = 14;

#[derive(Debug, Clone)]
pub struct CognitiveEmbedder {
    dimensions: usize,
    scorer: PointScorer,
}

impl CognitiveEmbedder {
    pub fn new(dimensions: usize, mapper: MapperConfig) -> Self {
        Self {
            dimensions,
            scorer: PointScorer::new(mapper),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Embed a window ordered oldest to newest. `None` when disabled.
    pub fn embed(&self, window: &[Reading]) -> Option<Vec<f32>> {
        if self.dimensions == 0 {
            return None;
        }

        let mut features: Vec<f32> = window
            .iter()
            .rev()
            .flat_map(|reading| self.reading_features(reading))
            .take(self.dimensions)
            .collect();
        features.resize(self.dimensions, 0.0);
        Some(features)
    }

    fn reading_features(&self, reading: &Reading) -> [f32; FEATURES_PER_READING] {
        let scores = self.scorer.score(reading);
        let env = reading.environment.clone().unwrap_or_default();
        let hour = reading.timestamp.hour() as f64 / 24.0;
        let weekday = reading.timestamp.weekday().num_days_from_monday() as f64 / 7.0;

        [
            reading.heart_rate.unwrap_or(0.0),
            reading.hrv_rmssd_ms.unwrap_or(0.0),
            reading.skin_conductance_us.unwrap_or(0.0),
            reading.skin_temperature_c.unwrap_or(0.0),
            reading.respiratory_rate.unwrap_or(0.0),
            scores.attention,
            scores.cognitive_load,
            scores.stress,
            scores.flow_score,
            hour,
            weekday,
            env.light_lux.unwrap_or(0.0),
            env.sound_db.unwrap_or(0.0),
            env.humidity_pct.unwrap_or(0.0),
        ]
        .map(|v| v as f32)
    }
}
