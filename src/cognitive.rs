//! Cognitive state mapping
//!
//! Turns a reading and its window snapshot into a `CognitiveState`, and a state
//! into `GenerationParameters` for the downstream model call.
//!
//! Point scores are computed from a single reading against the configured
//! resting values. A term whose inputs are missing is left out of the weighted
//! mean rather than counted as zero, so a heart-rate-only wearable is scored on
//! what it actually reports.

use crate::config::MapperConfig;
use crate::types::{
    AnalyticsSnapshot, CognitiveState, GenerationParameters, GenerationRegime, MetricKind,
    PatternTag, PointScores, Reading, Trend,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::sync::Mutex;

pub const MIN_TEMPERATURE: f64 = 0.1;
pub const MAX_TEMPERATURE: f64 = 1.0;
pub const MIN_TOKEN_BUDGET: u32 = 50;
pub const MAX_TOKEN_BUDGET: u32 = 2_000;

/// Score used when nothing in the reading informs a dimension
const NEUTRAL_SCORE: f64 = 0.5;

const AUTONOMIC_WEIGHT: f64 = 0.3;
const CONDUCTANCE_WEIGHT: f64 = 0.3;
const BAND_RATIO_WEIGHT: f64 = 0.4;

/// Per-reading scoring shared by analytics and the state mapper
#[derive(Debug, Clone, Default)]
pub struct PointScorer {
    config: MapperConfig,
}

impl PointScorer {
    pub fn new(config: MapperConfig) -> Self {
        Self { config }
    }

    pub fn score(&self, reading: &Reading) -> PointScores {
        let cognitive_load = self.cognitive_load(reading);
        let attention = self.attention(reading);
        let stress = self.stress(reading);
        let balance = reading
            .brainwaves
            .and_then(|b| b.balance())
            .unwrap_or(NEUTRAL_SCORE);
        let flow_score = (0.4 * attention
            + 0.3 * (1.0 - (cognitive_load - 0.5).abs())
            + 0.3 * balance)
            .clamp(0.0, 1.0);

        PointScores {
            cognitive_load,
            attention,
            stress,
            flow_score,
        }
    }

    /// Distance of heart rate from rest, either side
    fn heart_rate_deviation(&self, reading: &Reading) -> Option<f64> {
        let hr = reading.heart_rate?;
        Some(unit((hr - self.config.resting_heart_rate).abs() / self.scale()))
    }

    /// Heart rate above rest only
    fn heart_rate_elevation(&self, reading: &Reading) -> Option<f64> {
        let hr = reading.heart_rate?;
        Some(unit((hr - self.config.resting_heart_rate) / self.scale()))
    }

    fn hrv_suppression(&self, reading: &Reading) -> Option<f64> {
        let hrv = reading.hrv_rmssd_ms?;
        if self.config.hrv_reference_ms <= 0.0 {
            return None;
        }
        Some(unit(1.0 - hrv / self.config.hrv_reference_ms))
    }

    pub(crate) fn normalized_conductance(&self, reading: &Reading) -> Option<f64> {
        let gsr = reading.skin_conductance_us?;
        if self.config.skin_conductance_scale <= 0.0 {
            return None;
        }
        Some(unit(gsr / self.config.skin_conductance_scale))
    }

    fn band_ratio_stress(&self, reading: &Reading) -> Option<f64> {
        let bands = reading.brainwaves?;
        if bands.alpha > 0.0 {
            let scale = self.config.beta_alpha_scale.max(f64::EPSILON);
            Some(unit(bands.beta / bands.alpha / scale))
        } else if bands.beta > 0.0 {
            Some(1.0)
        } else {
            None
        }
    }

    fn scale(&self) -> f64 {
        self.config.heart_rate_deviation_scale.max(f64::EPSILON)
    }

    fn cognitive_load(&self, reading: &Reading) -> f64 {
        let autonomic = mean(
            [
                self.heart_rate_deviation(reading),
                self.hrv_suppression(reading),
            ]
            .into_iter()
            .flatten(),
        );

        let terms = [
            (autonomic, AUTONOMIC_WEIGHT),
            (self.normalized_conductance(reading), CONDUCTANCE_WEIGHT),
            (self.band_ratio_stress(reading), BAND_RATIO_WEIGHT),
        ];
        let (weighted, weights) = terms
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v * weight, *weight)))
            .fold((0.0, 0.0), |(sum, total), (v, w)| (sum + v, total + w));

        if weights > 0.0 {
            unit(weighted / weights)
        } else {
            reported_or_neutral(reading.reported.as_ref().and_then(|r| r.cognitive_load))
        }
    }

    fn attention(&self, reading: &Reading) -> f64 {
        let fallback = || reported_or_neutral(reading.reported.as_ref().and_then(|r| r.attention));
        let Some(bands) = reading.brainwaves else {
            return fallback();
        };

        let slow = bands.alpha + bands.theta;
        if slow > 0.0 {
            let engagement = (bands.beta / slow).min(1.0);
            let relaxed_focus = bands.alpha / slow;
            unit(0.6 * engagement + 0.4 * relaxed_focus)
        } else if bands.beta > 0.0 {
            0.6
        } else {
            fallback()
        }
    }

    fn stress(&self, reading: &Reading) -> f64 {
        let terms = [
            self.heart_rate_elevation(reading),
            self.hrv_suppression(reading),
            self.normalized_conductance(reading),
        ];
        match mean(terms.into_iter().flatten()) {
            Some(value) => unit(value),
            None => reported_or_neutral(reading.reported.as_ref().and_then(|r| r.stress)),
        }
    }
}

fn unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        NEUTRAL_SCORE
    }
}

fn reported_or_neutral(value: Option<f64>) -> f64 {
    value.map(unit).unwrap_or(NEUTRAL_SCORE)
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Maps readings to cognitive states and states to generation parameters
#[derive(Debug, Clone, Default)]
pub struct CognitiveStateMapper {
    config: MapperConfig,
    scorer: PointScorer,
}

impl CognitiveStateMapper {
    pub fn new(config: MapperConfig) -> Self {
        Self {
            scorer: PointScorer::new(config.clone()),
            config,
        }
    }

    pub fn scorer(&self) -> &PointScorer {
        &self.scorer
    }

    pub fn map_to_state(&self, reading: &Reading, snapshot: &AnalyticsSnapshot) -> CognitiveState {
        let scores = self.scorer.score(reading);
        let active_patterns = if self.config.detect_patterns {
            self.detect_patterns(reading, snapshot)
        } else {
            BTreeSet::new()
        };

        CognitiveState {
            cognitive_load: scores.cognitive_load,
            attention_level: scores.attention,
            stress_level: scores.stress,
            flow_state: scores.flow_score > self.config.flow_threshold,
            flow_score: scores.flow_score,
            active_patterns,
        }
    }

    /// Pattern tags for one reading; readings without brainwaves carry none
    pub fn detect_patterns(
        &self,
        reading: &Reading,
        snapshot: &AnalyticsSnapshot,
    ) -> BTreeSet<PatternTag> {
        let mut tags = BTreeSet::new();
        let Some(bands) = reading.brainwaves else {
            return tags;
        };
        let Some(shares) = bands.shares() else {
            return tags;
        };
        let cfg = &self.config;

        let hrv_cv = snapshot.coefficient_of_variation(MetricKind::Hrv);
        if shares.beta >= cfg.hyperfocus_beta_share
            && hrv_cv.map_or(false, |cv| cv >= cfg.hyperfocus_hrv_cv)
        {
            tags.insert(PatternTag::AttentionalHyperfocus);
        }

        if shares.gamma >= cfg.burst_gamma_share
            && self
                .scorer
                .normalized_conductance(reading)
                .map_or(false, |c| c <= cfg.burst_max_conductance)
        {
            tags.insert(PatternTag::PatternRecognitionBurst);
        }

        if bands.beta > 0.0 && bands.theta / bands.beta >= cfg.theta_beta_ratio {
            tags.insert(PatternTag::ThetaBetaElevation);
        }

        if snapshot.trend(MetricKind::Attention) == Trend::Decreasing
            && shares.theta >= cfg.drift_theta_share
        {
            tags.insert(PatternTag::AttentionDrift);
        }

        tags
    }

    pub fn regime(&self, state: &CognitiveState) -> GenerationRegime {
        if state.flow_state || state.cognitive_load >= self.config.high_load_threshold {
            GenerationRegime::Focused
        } else if state.attention_level < self.config.low_attention_threshold {
            GenerationRegime::Engaging
        } else {
            GenerationRegime::Balanced
        }
    }

    pub fn calculate_temperature(&self, state: &CognitiveState) -> f64 {
        let base = match self.regime(state) {
            GenerationRegime::Focused => 0.3,
            GenerationRegime::Engaging => 0.9,
            GenerationRegime::Balanced => 0.7 - 0.2 * state.stress_level,
        };
        let adjusted = base
            + state
                .active_patterns
                .iter()
                .map(|tag| tag_adjustment(*tag).0)
                .sum::<f64>();
        clamp_temperature(adjusted)
    }

    pub fn calculate_token_budget(&self, state: &CognitiveState) -> u32 {
        let base = match self.regime(state) {
            GenerationRegime::Focused => 300.0,
            GenerationRegime::Engaging => 500.0,
            GenerationRegime::Balanced => 600.0 + 800.0 * state.attention_level,
        };
        let adjusted = base
            + state
                .active_patterns
                .iter()
                .map(|tag| tag_adjustment(*tag).1)
                .sum::<f64>();
        clamp_budget(adjusted)
    }

    pub fn generation_parameters(&self, state: &CognitiveState) -> GenerationParameters {
        GenerationParameters {
            temperature: self.calculate_temperature(state),
            token_budget: self.calculate_token_budget(state),
            regime: self.regime(state),
        }
    }
}

/// (temperature delta, token budget delta) per tag
fn tag_adjustment(tag: PatternTag) -> (f64, f64) {
    match tag {
        PatternTag::AttentionalHyperfocus => (-0.05, 250.0),
        PatternTag::PatternRecognitionBurst => (0.10, 150.0),
        PatternTag::ThetaBetaElevation => (0.05, -200.0),
        PatternTag::AttentionDrift => (0.05, -150.0),
    }
}

fn clamp_temperature(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(MIN_TEMPERATURE, MAX_TEMPERATURE)
    } else {
        MIN_TEMPERATURE
    }
}

fn clamp_budget(value: f64) -> u32 {
    if !value.is_finite() {
        return MIN_TOKEN_BUDGET;
    }
    value
        .round()
        .clamp(MIN_TOKEN_BUDGET as f64, MAX_TOKEN_BUDGET as f64) as u32
}

/// Optional jitter on top of the deterministic parameters, for callers that
/// want some variety between otherwise identical generations.
pub struct GenerationVariety {
    rng: Mutex<StdRng>,
}

impl GenerationVariety {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Perturb temperature by up to 0.05 and the budget by up to 5 %
    pub fn apply(&self, params: GenerationParameters) -> GenerationParameters {
        let mut rng = match self.rng.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let temperature = params.temperature + rng.gen_range(-0.05..=0.05);
        let budget = params.token_budget as f64 * (1.0 + rng.gen_range(-0.05..=0.05));

        GenerationParameters {
            temperature: clamp_temperature(temperature),
            token_budget: clamp_budget(budget),
            regime: params.regime,
        }
    }
}
