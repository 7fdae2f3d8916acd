//! Sensor devices
//!
//! The collector depends only on `SensorDevice`; concrete hardware drivers
//! implement it alongside `SimulatedDevice`, which stands in for real sensors
//! during development and in the CLI `simulate` command.

use crate::error::PipelineError;
use crate::types::{BrainwaveBands, EnvironmentalContext, Reading, ReportedScores};
use async_trait::async_trait;
use chrono::Utc;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;

#[async_trait]
pub trait SensorDevice: Send {
    fn name(&self) -> &str;
    async fn connect(&mut self) -> Result<(), PipelineError>;
    async fn disconnect(&mut self) -> Result<(), PipelineError>;
    /// Begin streaming; `get_reading` fails until this succeeds
    async fn start_reading(&mut self) -> Result<(), PipelineError>;
    async fn get_reading(&mut self) -> Result<Reading, PipelineError>;
}

/// Gaussian noise around a centre value
#[derive(Debug, Clone, Copy)]
struct Signal {
    mean: f64,
    noise: Normal<f64>,
}

impl Signal {
    fn new(mean: f64, std_dev: f64) -> Result<Self, PipelineError> {
        let noise = Normal::new(0.0, std_dev)
            .map_err(|e| PipelineError::Sensor(format!("invalid noise profile: {e}")))?;
        Ok(Self { mean, noise })
    }

    fn sample(&self, rng: &mut StdRng) -> f64 {
        self.mean + rng.sample::<f64, _>(self.noise)
    }
}

/// Wearable simulator producing plausible resting-state readings
pub struct SimulatedDevice {
    name: String,
    subject_id: String,
    session_id: Option<String>,
    rng: StdRng,
    heart_rate: Signal,
    hrv: Signal,
    skin_temperature: Signal,
    respiratory_rate: Signal,
    with_brainwaves: bool,
    connected: bool,
    streaming: bool,
}

impl SimulatedDevice {
    pub fn new(subject_id: impl Into<String>, seed: Option<u64>) -> Result<Self, PipelineError> {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            name: "simulated-wearable".to_string(),
            subject_id: subject_id.into(),
            session_id: None,
            rng,
            heart_rate: Signal::new(70.0, 5.0)?,
            hrv: Signal::new(50.0, 10.0)?,
            skin_temperature: Signal::new(33.5, 0.3)?,
            respiratory_rate: Signal::new(16.0, 2.0)?,
            with_brainwaves: true,
            connected: false,
            streaming: false,
        })
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Emit readings without EEG bands, like a wrist-only wearable
    pub fn without_brainwaves(mut self) -> Self {
        self.with_brainwaves = false;
        self
    }

    fn sample(&mut self) -> Reading {
        let rng = &mut self.rng;
        let brainwaves = self.with_brainwaves.then(|| BrainwaveBands {
            alpha: rng.gen_range(8.0..12.0),
            beta: rng.gen_range(4.0..10.0),
            theta: rng.gen_range(3.0..8.0),
            gamma: rng.gen_range(0.5..3.0),
        });

        Reading {
            session_id: self.session_id.clone(),
            source: Some(self.name.clone()),
            heart_rate: Some(self.heart_rate.sample(rng)),
            hrv_rmssd_ms: Some(self.hrv.sample(rng).max(0.0)),
            skin_conductance_us: Some(rng.gen_range(0.1..2.0)),
            skin_temperature_c: Some(self.skin_temperature.sample(rng)),
            respiratory_rate: Some(self.respiratory_rate.sample(rng).max(0.0)),
            spo2_percentage: Some(rng.gen_range(96.0..=100.0)),
            brainwaves,
            environment: Some(EnvironmentalContext {
                sound_db: Some(rng.gen_range(30.0..70.0)),
                light_lux: Some(rng.gen_range(50.0..800.0)),
                temperature_c: Some(rng.gen_range(19.0..25.0)),
                humidity_pct: Some(rng.gen_range(30.0..60.0)),
            }),
            reported: Some(ReportedScores {
                attention: Some(rng.gen_range(0.0..=1.0)),
                cognitive_load: Some(rng.gen_range(0.0..=1.0)),
                stress: None,
            }),
            ..Reading::new(self.subject_id.clone(), Utc::now())
        }
    }
}

#[async_trait]
impl SensorDevice for SimulatedDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<(), PipelineError> {
        self.connected = true;
        info!("{} connected for subject {}", self.name, self.subject_id);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), PipelineError> {
        self.streaming = false;
        self.connected = false;
        debug!("{} disconnected", self.name);
        Ok(())
    }

    async fn start_reading(&mut self) -> Result<(), PipelineError> {
        if !self.connected {
            return Err(PipelineError::Sensor(format!(
                "{} is not connected",
                self.name
            )));
        }
        self.streaming = true;
        Ok(())
    }

    async fn get_reading(&mut self) -> Result<Reading, PipelineError> {
        if !self.streaming {
            return Err(PipelineError::Sensor(format!(
                "{} is not streaming",
                self.name
            )));
        }
        Ok(self.sample())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ReadingValidator;

    #[tokio::test]
    async fn test_lifecycle() {
        let mut device = SimulatedDevice::new("subject-1", Some(5)).unwrap();
        assert!(device.get_reading().await.is_err());
        assert!(device.start_reading().await.is_err());

        device.connect().await.unwrap();
        device.start_reading().await.unwrap();
        let reading = device.get_reading().await.unwrap();
        assert_eq!(reading.subject_id, "subject-1");
        assert_eq!(reading.source.as_deref(), Some("simulated-wearable"));

        device.disconnect().await.unwrap();
        assert!(device.get_reading().await.is_err());
    }

    #[tokio::test]
    async fn test_simulated_readings_validate() {
        let mut device = SimulatedDevice::new("subject-1", Some(9))
            .unwrap()
            .with_session("session-1");
        device.connect().await.unwrap();
        device.start_reading().await.unwrap();

        let validator = ReadingValidator;
        for _ in 0..100 {
            let reading = device.get_reading().await.unwrap();
            let report = validator.validate(&reading);
            assert!(report.valid, "{:?}", report.reason);
        }
    }

    #[tokio::test]
    async fn test_wrist_only_mode() {
        let mut device = SimulatedDevice::new("subject-1", Some(1))
            .unwrap()
            .without_brainwaves();
        device.connect().await.unwrap();
        device.start_reading().await.unwrap();
        assert!(device.get_reading().await.unwrap().brainwaves.is_none());
    }
}
