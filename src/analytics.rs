//! Window analytics
//!
//! Computes rolling statistics over a subject window: current values, means,
//! population standard deviation, thirds-based trends and Pearson correlations
//! for a fixed set of metric pairs. Pure function of the window contents.

use crate::config::{AnalyticsConfig, MapperConfig};
use crate::cognitive::PointScorer;
use crate::types::{AnalyticsSnapshot, Correlation, MetricKind, PointScores, Reading, Trend};
use std::collections::BTreeMap;

/// Metric pairs correlated over the window
pub const CORRELATION_PAIRS: [(MetricKind, MetricKind); 6] = [
    (MetricKind::Hrv, MetricKind::Stress),
    (MetricKind::HeartRate, MetricKind::Stress),
    (MetricKind::HeartRate, MetricKind::CognitiveLoad),
    (MetricKind::SkinConductance, MetricKind::Stress),
    (MetricKind::Beta, MetricKind::Attention),
    (MetricKind::Alpha, MetricKind::CognitiveLoad),
];

#[derive(Debug, Clone, Default)]
pub struct AnalyticsCalculator {
    config: AnalyticsConfig,
    scorer: PointScorer,
}

impl AnalyticsCalculator {
    pub fn new(config: AnalyticsConfig, mapper: MapperConfig) -> Self {
        Self {
            config,
            scorer: PointScorer::new(mapper),
        }
    }

    /// Build a snapshot from a window ordered oldest to newest
    pub fn calculate(&self, window: &[Reading]) -> AnalyticsSnapshot {
        let scores: Vec<PointScores> = window.iter().map(|r| self.scorer.score(r)).collect();
        let newest = window.last();

        let mut snapshot = AnalyticsSnapshot {
            subject_id: newest.map(|r| r.subject_id.clone()).unwrap_or_default(),
            as_of: newest.map(|r| r.timestamp),
            sample_count: window.len(),
            current: BTreeMap::new(),
            scores: scores.last().copied().unwrap_or_default(),
            averages: BTreeMap::new(),
            variability: BTreeMap::new(),
            trends: BTreeMap::new(),
            correlations: Vec::new(),
        };

        if let Some(newest) = newest {
            for kind in MetricKind::SENSOR {
                if let Some(value) = newest.metric(kind) {
                    snapshot.current.insert(kind, value);
                }
            }
        }

        if window.len() < 2 {
            return snapshot;
        }

        let kinds = MetricKind::SENSOR.into_iter().chain(MetricKind::SCORES);
        for kind in kinds {
            let series: Vec<f64> = window
                .iter()
                .zip(&scores)
                .filter_map(|(r, s)| value_of(r, s, kind))
                .collect();
            if series.is_empty() {
                continue;
            }

            let avg = mean(&series);
            snapshot.averages.insert(kind, avg);
            snapshot.variability.insert(kind, std_dev(&series, avg));
            snapshot.trends.insert(kind, self.trend(&series));
        }

        for (first, second) in CORRELATION_PAIRS {
            let (xs, ys): (Vec<f64>, Vec<f64>) = window
                .iter()
                .zip(&scores)
                .filter_map(|(r, s)| Some((value_of(r, s, first)?, value_of(r, s, second)?)))
                .unzip();

            if xs.len() < self.config.min_correlation_samples.max(2) {
                continue;
            }
            if let Some(coefficient) = pearson(&xs, &ys) {
                snapshot.correlations.push(Correlation {
                    first,
                    second,
                    coefficient,
                    samples: xs.len(),
                });
            }
        }

        snapshot
    }

    /// Compare the newest third against the oldest third
    fn trend(&self, series: &[f64]) -> Trend {
        if series.len() < 2 {
            return Trend::Stable;
        }
        let segment = (series.len() / 3).max(1);
        let oldest = mean(&series[..segment]);
        let newest = mean(&series[series.len() - segment..]);
        let tolerance = self.config.trend_epsilon * oldest.abs().max(1.0);
        let delta = newest - oldest;

        if delta > tolerance {
            Trend::Increasing
        } else if delta < -tolerance {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    }
}

fn value_of(reading: &Reading, scores: &PointScores, kind: MetricKind) -> Option<f64> {
    scores.get(kind).or_else(|| reading.metric(kind))
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

/// Pearson coefficient, `None` when either series has no variance
fn pearson(xs: &[f64], ys: &[f64]) -> Option<f64> {
    let mx = mean(xs);
    let my = mean(ys);
    let mut cov = 0.0;
    let mut vx = 0.0;
    let mut vy = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let dx = x - mx;
        let dy = y - my;
        cov += dx * dy;
        vx += dx * dx;
        vy += dy * dy;
    }
    let denom = (vx * vy).sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some((cov / denom).clamp(-1.0, 1.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};
    use pretty_assertions::assert_eq;

    fn base() -> DateTime<Utc> {
        "2024-01-15T14:00:00Z".parse().unwrap()
    }

    fn window_of(heart_rates: &[f64]) -> Vec<Reading> {
        heart_rates
            .iter()
            .enumerate()
            .map(|(i, hr)| Reading {
                heart_rate: Some(*hr),
                hrv_rmssd_ms: Some(60.0 - i as f64 * 4.0),
                ..Reading::new("subject-1", base() + Duration::seconds(i as i64 * 30))
            })
            .collect()
    }

    #[test]
    fn test_rising_heart_rate_is_increasing() {
        let calc = AnalyticsCalculator::default();
        let snapshot = calc.calculate(&window_of(&[70.0, 75.0, 80.0, 85.0, 90.0]));

        assert_eq!(snapshot.sample_count, 5);
        assert_eq!(snapshot.trend(MetricKind::HeartRate), Trend::Increasing);
        assert_eq!(snapshot.trend(MetricKind::Hrv), Trend::Decreasing);
        assert_eq!(snapshot.averages[&MetricKind::HeartRate], 80.0);
        assert_eq!(snapshot.current[&MetricKind::HeartRate], 90.0);
        assert_eq!(snapshot.as_of, Some(base() + Duration::seconds(120)));
    }

    #[test]
    fn test_flat_series_is_stable_with_zero_variability() {
        let calc = AnalyticsCalculator::default();
        let window: Vec<Reading> = (0..4)
            .map(|i| Reading {
                heart_rate: Some(72.0),
                ..Reading::new("subject-1", base() + Duration::seconds(i))
            })
            .collect();
        let snapshot = calc.calculate(&window);

        assert_eq!(snapshot.trend(MetricKind::HeartRate), Trend::Stable);
        assert_eq!(snapshot.variability[&MetricKind::HeartRate], 0.0);
        // Zero variance on both sides, so no correlation
        assert!(snapshot
            .correlation(MetricKind::HeartRate, MetricKind::Stress)
            .is_none());
    }

    #[test]
    fn test_calculation_is_deterministic() {
        let calc = AnalyticsCalculator::default();
        let window = window_of(&[70.0, 82.0, 76.0, 91.0, 88.0, 79.0]);
        assert_eq!(calc.calculate(&window), calc.calculate(&window));
    }

    #[test]
    fn test_correlations_need_enough_samples() {
        let calc = AnalyticsCalculator::default();

        let short = calc.calculate(&window_of(&[70.0, 90.0]));
        assert!(short.correlations.is_empty());

        let long = calc.calculate(&window_of(&[70.0, 80.0, 90.0, 100.0]));
        let coefficient = long
            .correlation(MetricKind::Stress, MetricKind::HeartRate)
            .unwrap();
        assert!(coefficient > 0.9);
        assert!(long.correlations.iter().all(|c| c.samples == 4));
    }

    #[test]
    fn test_empty_and_single_windows() {
        let calc = AnalyticsCalculator::default();

        let empty = calc.calculate(&[]);
        assert_eq!(empty.sample_count, 0);
        assert!(empty.current.is_empty());
        assert!(empty.as_of.is_none());

        let single = calc.calculate(&window_of(&[72.0]));
        assert_eq!(single.current[&MetricKind::HeartRate], 72.0);
        assert!(single.averages.is_empty());
        assert!(single.correlations.is_empty());
        assert_eq!(single.trend(MetricKind::HeartRate), Trend::Stable);
    }
}
