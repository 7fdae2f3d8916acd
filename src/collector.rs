//! Continuous collection loop
//!
//! Samples a `SensorDevice` at a fixed rate and feeds each reading to the
//! pipeline until cancelled or until the sample limit is reached. Sensor and
//! validation errors are logged and counted; the loop keeps going.

use crate::error::PipelineError;
use crate::pipeline::BiometricPipeline;
use crate::sensor::SensorDevice;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Upper bound on a single device read
const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionOptions {
    pub sample_rate_hz: f64,
    /// Stop after this many successful reads; unbounded when `None`
    pub max_samples: Option<usize>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            sample_rate_hz: 1.0,
            max_samples: None,
        }
    }
}

impl CollectionOptions {
    fn period(&self) -> Result<Duration, PipelineError> {
        if !self.sample_rate_hz.is_finite() || self.sample_rate_hz <= 0.0 {
            return Err(PipelineError::Configuration(format!(
                "sample rate {} Hz must be positive",
                self.sample_rate_hz
            )));
        }
        Ok(Duration::from_secs_f64(1.0 / self.sample_rate_hz))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSummary {
    pub sampled: usize,
    pub processed: usize,
    pub queued: usize,
    pub rejected: usize,
    pub sensor_errors: usize,
}

/// Run the collection loop. Connection failures are returned; per-sample
/// failures are not.
pub async fn run_collection<D: SensorDevice + ?Sized>(
    device: &mut D,
    pipeline: &BiometricPipeline,
    options: &CollectionOptions,
    cancel: CancellationToken,
) -> Result<CollectionSummary, PipelineError> {
    let period = options.period()?;

    device.connect().await?;
    device.start_reading().await?;
    info!(
        "collecting from {} at {:.2} Hz",
        device.name(),
        options.sample_rate_hz
    );

    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut summary = CollectionSummary::default();

    loop {
        if options.max_samples.map_or(false, |max| summary.sampled >= max) {
            break;
        }

        tokio::select! {
            _ = ticker.tick() => {
                collect_once(device, pipeline, &mut summary).await;
            }
            _ = cancel.cancelled() => {
                info!("collection from {} cancelled", device.name());
                break;
            }
        }
    }

    if let Err(err) = device.disconnect().await {
        warn!("failed to disconnect {}: {err}", device.name());
    }
    debug!("collection summary: {summary:?}");
    Ok(summary)
}

async fn collect_once<D: SensorDevice + ?Sized>(
    device: &mut D,
    pipeline: &BiometricPipeline,
    summary: &mut CollectionSummary,
) {
    let result = tokio::time::timeout(READ_TIMEOUT, device.get_reading()).await;
    let reading = match result {
        Ok(Ok(reading)) => reading,
        Ok(Err(err)) => {
            summary.sensor_errors += 1;
            error!("sensor read from {} failed: {err}", device.name());
            return;
        }
        Err(_) => {
            summary.sensor_errors += 1;
            warn!(
                "sensor read from {} timed out (> {}s)",
                device.name(),
                READ_TIMEOUT.as_secs()
            );
            return;
        }
    };
    summary.sampled += 1;

    match pipeline.process_reading(reading).await {
        Ok(outcome) if outcome.is_queued() => summary.queued += 1,
        Ok(_) => summary.processed += 1,
        Err(err) => {
            summary.rejected += 1;
            warn!("collected reading rejected: {err}");
        }
    }
}
