//! Threshold alerts
//!
//! Stateless: every reading is evaluated on its own. Raw metrics come from the
//! reading, score metrics from the snapshot's point scores.

use crate::config::{default_alert_thresholds, AlertThreshold, ThresholdDirection};
use crate::types::{Alert, AlertSeverity, AnalyticsSnapshot, MetricKind, Reading};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct AlertEvaluator {
    thresholds: BTreeMap<MetricKind, AlertThreshold>,
}

impl Default for AlertEvaluator {
    fn default() -> Self {
        Self::new(default_alert_thresholds())
    }
}

impl AlertEvaluator {
    pub fn new(thresholds: BTreeMap<MetricKind, AlertThreshold>) -> Self {
        Self { thresholds }
    }

    pub fn check_alerts(&self, reading: &Reading, snapshot: &AnalyticsSnapshot) -> Vec<Alert> {
        self.thresholds
            .iter()
            .filter_map(|(metric, threshold)| {
                let value = snapshot
                    .scores
                    .get(*metric)
                    .or_else(|| reading.metric(*metric))?;
                let (severity, limit) = classify(value, threshold)?;
                Some(Alert {
                    severity,
                    metric: *metric,
                    value,
                    threshold: limit,
                    subject_id: reading.subject_id.clone(),
                    timestamp: reading.timestamp,
                })
            })
            .collect()
    }
}

fn classify(value: f64, threshold: &AlertThreshold) -> Option<(AlertSeverity, f64)> {
    let crosses = |limit: f64| match threshold.direction {
        ThresholdDirection::Above => value >= limit,
        ThresholdDirection::Below => value <= limit,
    };

    if crosses(threshold.critical) {
        Some((AlertSeverity::Critical, threshold.critical))
    } else if crosses(threshold.warn) {
        Some((AlertSeverity::Warning, threshold.warn))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::AnalyticsCalculator;
    use chrono::Utc;

    fn evaluate(reading: &Reading) -> Vec<Alert> {
        let snapshot = AnalyticsCalculator::default().calculate(std::slice::from_ref(reading));
        AlertEvaluator::default().check_alerts(reading, &snapshot)
    }

    #[test]
    fn test_normal_reading_raises_nothing() {
        let reading = Reading {
            heart_rate: Some(72.0),
            hrv_rmssd_ms: Some(55.0),
            spo2_percentage: Some(98.0),
            ..Reading::new("subject-1", Utc::now())
        };
        assert!(evaluate(&reading).is_empty());
    }

    #[test]
    fn test_critical_takes_precedence() {
        let reading = Reading {
            heart_rate: Some(170.0),
            ..Reading::new("subject-1", Utc::now())
        };
        let alerts = evaluate(&reading);
        let hr = alerts
            .iter()
            .find(|a| a.metric == MetricKind::HeartRate)
            .unwrap();
        assert_eq!(hr.severity, AlertSeverity::Critical);
        assert_eq!(hr.threshold, 160.0);
        assert_eq!(
            alerts
                .iter()
                .filter(|a| a.metric == MetricKind::HeartRate)
                .count(),
            1
        );
    }

    #[test]
    fn test_below_direction_and_multiple_alerts() {
        let reading = Reading {
            hrv_rmssd_ms: Some(15.0),
            spo2_percentage: Some(89.0),
            ..Reading::new("subject-1", Utc::now())
        };
        let alerts = evaluate(&reading);

        let hrv = alerts.iter().find(|a| a.metric == MetricKind::Hrv).unwrap();
        assert_eq!(hrv.severity, AlertSeverity::Warning);
        let spo2 = alerts
            .iter()
            .find(|a| a.metric == MetricKind::OxygenSaturation)
            .unwrap();
        assert_eq!(spo2.severity, AlertSeverity::Critical);
    }

    #[test]
    fn test_score_metrics_come_from_snapshot() {
        let reading = Reading {
            heart_rate: Some(200.0),
            hrv_rmssd_ms: Some(5.0),
            skin_conductance_us: Some(12.0),
            ..Reading::new("subject-1", Utc::now())
        };
        let alerts = evaluate(&reading);
        let stress = alerts
            .iter()
            .find(|a| a.metric == MetricKind::Stress)
            .unwrap();
        assert_eq!(stress.severity, AlertSeverity::Critical);
    }
}
