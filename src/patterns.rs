//! Asynchronous pattern analysis
//!
//! Runs off the critical path. The pipeline hands over a copy of the window and
//! its snapshot, enforces a timeout, and reports failures as events only.

use crate::analytics::AnalyticsCalculator;
use crate::cognitive::CognitiveStateMapper;
use crate::config::{AnalyticsConfig, MapperConfig};
use crate::error::PipelineError;
use crate::events::{PatternEpisode, PatternReport};
use crate::types::{AnalyticsSnapshot, PatternTag, Reading};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub subject_id: String,
    /// Window ordered oldest to newest
    pub window: Vec<Reading>,
    pub snapshot: Arc<AnalyticsSnapshot>,
}

#[async_trait]
pub trait PatternAnalyzer: Send + Sync {
    async fn analyze(&self, request: AnalysisRequest) -> Result<PatternReport, PipelineError>;
}

/// Groups consecutive readings that share a pattern tag (or flow) into episodes.
///
/// Each reading is scored against a snapshot of the window up to and
/// including that reading, so window-level signals (attention trend, HRV
/// variability) reflect what was known at the time.
pub struct EpisodeAnalyzer {
    analytics: AnalyticsCalculator,
    mapper: CognitiveStateMapper,
}

impl Default for EpisodeAnalyzer {
    fn default() -> Self {
        Self::new(AnalyticsConfig::default(), MapperConfig::default())
    }
}

impl EpisodeAnalyzer {
    pub fn new(analytics: AnalyticsConfig, mapper: MapperConfig) -> Self {
        let mapper = MapperConfig {
            detect_patterns: true,
            ..mapper
        };
        Self {
            analytics: AnalyticsCalculator::new(analytics, mapper.clone()),
            mapper: CognitiveStateMapper::new(mapper),
        }
    }

    /// Episodes across the window plus the tags active at the newest reading
    fn episodes(
        &self,
        window: &[Reading],
        snapshot: &AnalyticsSnapshot,
    ) -> (Vec<PatternEpisode>, BTreeSet<PatternTag>) {
        let mut open: BTreeMap<Option<PatternTag>, PatternEpisode> = BTreeMap::new();
        let mut closed = Vec::new();
        let mut active_tags = BTreeSet::new();

        for (idx, reading) in window.iter().enumerate() {
            let prefix;
            let snapshot = if idx + 1 == window.len() {
                snapshot
            } else {
                prefix = self.analytics.calculate(&window[..=idx]);
                &prefix
            };

            let state = self.mapper.map_to_state(reading, snapshot);
            let mut flagged: BTreeSet<Option<PatternTag>> =
                state.active_patterns.iter().copied().map(Some).collect();
            active_tags = state.active_patterns;
            if state.flow_state {
                flagged.insert(None);
            }

            let ended: Vec<Option<PatternTag>> = open
                .keys()
                .filter(|key| !flagged.contains(key))
                .copied()
                .collect();
            for key in ended {
                if let Some(episode) = open.remove(&key) {
                    closed.push(episode);
                }
            }

            for key in flagged {
                open.entry(key)
                    .and_modify(|episode| {
                        episode.ended_at = reading.timestamp;
                        episode.samples += 1;
                    })
                    .or_insert(PatternEpisode {
                        tag: key,
                        started_at: reading.timestamp,
                        ended_at: reading.timestamp,
                        samples: 1,
                    });
            }
        }

        closed.extend(open.into_values());
        closed.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.tag.cmp(&b.tag)));
        (closed, active_tags)
    }
}

#[async_trait]
impl PatternAnalyzer for EpisodeAnalyzer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<PatternReport, PipelineError> {
        if request.window.is_empty() {
            return Err(PipelineError::Analysis(format!(
                "empty window for subject {}",
                request.subject_id
            )));
        }

        let (episodes, active_tags) = self.episodes(&request.window, &request.snapshot);
        let as_of = request
            .window
            .last()
            .map(|r| r.timestamp)
            .unwrap_or_default();
        Ok(PatternReport {
            subject_id: request.subject_id,
            as_of,
            active_tags,
            analyzed_samples: request.window.len(),
            episodes,
        })
    }
}
