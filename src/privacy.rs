//! Privacy guard
//!
//! Adds bounded uniform noise to sensitive physiological fields before a
//! reading is windowed or stored. This is best-effort de-identification in the
//! spirit of differential privacy; it is not a security boundary and gives no
//! formal guarantee. Identifiers, timestamps, session linkage and environmental
//! context pass through untouched so readings can still be correlated.

use crate::config::PrivacyConfig;
use crate::types::Reading;
use crate::validator::{MAX_HEART_RATE, MIN_HEART_RATE};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Mutex;

pub struct PrivacyGuard {
    config: PrivacyConfig,
    rng: Mutex<StdRng>,
}

impl PrivacyGuard {
    pub fn new(config: PrivacyConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    /// Return a noised copy of the reading
    pub fn protect(&self, reading: &Reading) -> Reading {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let cfg = &self.config;
        let mut protected = reading.clone();

        protected.heart_rate = protected
            .heart_rate
            .map(|v| jitter(&mut *rng, v, cfg.heart_rate_bpm).clamp(MIN_HEART_RATE, MAX_HEART_RATE));
        protected.hrv_rmssd_ms = protected
            .hrv_rmssd_ms
            .map(|v| jitter(&mut *rng, v, cfg.hrv_ms).max(0.0));
        protected.skin_conductance_us = protected
            .skin_conductance_us
            .map(|v| jitter(&mut *rng, v, cfg.skin_conductance_us).max(0.0));
        protected.skin_temperature_c = protected
            .skin_temperature_c
            .map(|v| jitter(&mut *rng, v, cfg.skin_temperature_c));
        protected.respiratory_rate = protected
            .respiratory_rate
            .map(|v| jitter(&mut *rng, v, cfg.respiratory_rate).max(0.0));
        protected.spo2_percentage = protected
            .spo2_percentage
            .map(|v| jitter(&mut *rng, v, cfg.spo2_percentage).clamp(0.0, 100.0));

        if let Some(bands) = protected.brainwaves.as_mut() {
            let rel = cfg.brainwave_relative;
            bands.alpha = jitter(&mut *rng, bands.alpha, bands.alpha * rel).max(0.0);
            bands.beta = jitter(&mut *rng, bands.beta, bands.beta * rel).max(0.0);
            bands.theta = jitter(&mut *rng, bands.theta, bands.theta * rel).max(0.0);
            bands.gamma = jitter(&mut *rng, bands.gamma, bands.gamma * rel).max(0.0);
        }

        protected
    }
}

/// Uniform noise in [-scale, scale]
fn jitter<R: Rng>(rng: &mut R, value: f64, scale: f64) -> f64 {
    let scale = scale.abs();
    if scale == 0.0 {
        return value;
    }
    value + rng.gen_range(-scale..=scale)
}
