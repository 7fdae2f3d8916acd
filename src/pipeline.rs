//! Pipeline orchestration
//!
//! `BiometricPipeline` is the public entry point. A reading goes through
//! validation, sanitizing, privacy protection and a backpressure check on the
//! caller's task; admitted readings then flow through the window, analytics,
//! cognitive mapping, alerts and batching. Pattern analysis and storage writes
//! are spawned so they never hold up the caller.
//!
//! Stages:
//! 1. ReadingValidator - reject unusable readings
//! 2. PrivacyGuard - bounded noise on sensitive fields
//! 3. Backpressure - defer when over capacity
//! 4. WindowManager + AnalyticsCalculator - snapshot of the subject window
//! 5. CognitiveStateMapper - state and generation parameters
//! 6. PatternAnalyzer (spawned) and BatchAccumulator -> BiometricStore
//! 7. AlertEvaluator and observer events

use crate::alerts::AlertEvaluator;
use crate::analytics::AnalyticsCalculator;
use crate::batch::{BatchAccumulator, StorageBatch, StorageRecord};
use crate::cache::{CacheStats, TtlLruCache};
use crate::cognitive::CognitiveStateMapper;
use crate::config::PipelineConfig;
use crate::embedding::CognitiveEmbedder;
use crate::error::PipelineError;
use crate::events::PipelineEvent;
use crate::metrics::{MetricsSnapshot, PipelineMetrics};
use crate::patterns::{AnalysisRequest, EpisodeAnalyzer, PatternAnalyzer};
use crate::privacy::PrivacyGuard;
use crate::storage::{BiometricStore, MemoryStore};
use crate::types::{
    AnalyticsSnapshot, ModelContext, ProcessOutcome, ProcessedReading, Reading,
};
use crate::validator::ReadingValidator;
use crate::window::WindowManager;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Result of one pass over the deferred queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainSummary {
    pub processed: usize,
    pub dropped: usize,
    pub remaining: usize,
}

struct DeferredReading {
    reading: Reading,
    warnings: Vec<String>,
    enqueued_at: Instant,
}

/// FIFO of readings deferred by backpressure, with per-subject counts
#[derive(Default)]
struct DeferredQueue {
    readings: VecDeque<DeferredReading>,
    per_subject: HashMap<String, usize>,
}

impl DeferredQueue {
    fn push(&mut self, item: DeferredReading) -> usize {
        *self
            .per_subject
            .entry(item.reading.subject_id.clone())
            .or_insert(0) += 1;
        self.readings.push_back(item);
        self.readings.len()
    }

    fn pop_front(&mut self) -> Option<DeferredReading> {
        let item = self.readings.pop_front()?;
        if let Some(count) = self.per_subject.get_mut(&item.reading.subject_id) {
            *count -= 1;
            if *count == 0 {
                self.per_subject.remove(&item.reading.subject_id);
            }
        }
        Some(item)
    }

    /// Pop readings from the front that have waited longer than `max_age`
    fn pop_stale(&mut self, max_age: Duration) -> Vec<DeferredReading> {
        let mut stale = Vec::new();
        while self
            .readings
            .front()
            .map_or(false, |item| item.enqueued_at.elapsed() > max_age)
        {
            if let Some(item) = self.pop_front() {
                stale.push(item);
            }
        }
        stale
    }

    fn has_subject(&self, subject_id: &str) -> bool {
        self.per_subject.contains_key(subject_id)
    }

    fn len(&self) -> usize {
        self.readings.len()
    }
}

/// Releases a processing slot when dropped
struct SlotGuard<'a>(&'a AtomicUsize);

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct PipelineInner {
    instance_id: Uuid,
    config: PipelineConfig,
    validator: ReadingValidator,
    privacy: Option<PrivacyGuard>,
    windows: WindowManager,
    analytics: AnalyticsCalculator,
    mapper: CognitiveStateMapper,
    alerts: AlertEvaluator,
    embedder: CognitiveEmbedder,
    snapshots: TtlLruCache<String, Arc<AnalyticsSnapshot>>,
    contexts: TtlLruCache<String, ModelContext>,
    batches: BatchAccumulator,
    store: Arc<dyn BiometricStore>,
    analyzer: Arc<dyn PatternAnalyzer>,
    deferred: Mutex<DeferredQueue>,
    in_flight: AtomicUsize,
    pending_writes: Mutex<Vec<JoinHandle<()>>>,
    events: broadcast::Sender<PipelineEvent>,
    metrics: PipelineMetrics,
}

impl PipelineInner {
    fn emit(&self, event: PipelineEvent) {
        // No receivers is not an error
        let _ = self.events.send(event);
    }

    fn deferred(&self) -> MutexGuard<'_, DeferredQueue> {
        lock(&self.deferred)
    }

    /// Reserve a processing slot unless in-flight plus queued work is at the ceiling
    fn try_reserve(&self, queued: usize) -> Option<SlotGuard<'_>> {
        let limit = self.config.max_processing_load;
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current + queued >= limit {
                return None;
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(SlotGuard(&self.in_flight)),
                Err(actual) => current = actual,
            }
        }
    }

    async fn deliver(&self, batch: StorageBatch) {
        let records = batch.len();
        match self.store.upsert_batch(&batch).await {
            Ok(()) => {
                self.metrics.add_batches_flushed(1);
                self.metrics.add_records_stored(records as u64);
                debug!(
                    "stored batch {} ({records} records, attempt {})",
                    batch.batch_id, batch.attempt
                );
                self.emit(PipelineEvent::BatchFlushed {
                    batch_id: batch.batch_id,
                    records,
                    attempt: batch.attempt,
                });
            }
            Err(err) if batch.attempt == 0 => {
                self.metrics.add_storage_failures(1);
                warn!(
                    "storage write for batch {} failed, will retry: {err}",
                    batch.batch_id
                );
                self.batches.requeue(batch);
            }
            Err(err) => {
                self.metrics.add_storage_failures(1);
                self.metrics.add_batches_lost(1);
                error!(
                    "storage retry for batch {} failed, {records} records not persisted: {err}",
                    batch.batch_id
                );
                self.emit(PipelineEvent::CriticalAlert {
                    reason: format!("storage retry failed: {err}"),
                    batch_id: Some(batch.batch_id),
                    records,
                });
            }
        }
    }

    fn report_stale(&self, stale: Vec<DeferredReading>) {
        for item in stale {
            let age = item.enqueued_at.elapsed();
            self.metrics.add_stale_dropped(1);
            warn!(
                "dropped stale deferred reading for subject {} after {}ms",
                item.reading.subject_id,
                age.as_millis()
            );
            self.emit(PipelineEvent::StaleReadingDropped {
                subject_id: item.reading.subject_id,
                timestamp: item.reading.timestamp,
                queued_ms: age.as_millis() as u64,
            });
        }
    }

    fn analysis_failed(&self, subject_id: String, reason: String) {
        self.metrics.add_analysis_failures(1);
        warn!("pattern analysis for subject {subject_id} failed: {reason}");
        self.emit(PipelineEvent::AnalysisFailed { subject_id, reason });
    }
}

/// Builder for [`BiometricPipeline`]
pub struct PipelineBuilder {
    config: PipelineConfig,
    store: Option<Arc<dyn BiometricStore>>,
    analyzer: Option<Arc<dyn PatternAnalyzer>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            store: None,
            analyzer: None,
        }
    }

    /// Storage collaborator; an in-memory store is used when none is given
    pub fn with_store(mut self, store: Arc<dyn BiometricStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Pattern analyzer; `EpisodeAnalyzer` is used when none is given
    pub fn with_analyzer(mut self, analyzer: Arc<dyn PatternAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    pub fn build(self) -> Result<BiometricPipeline, PipelineError> {
        let config = self.config;
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let privacy = config
            .enable_privacy_protection
            .then(|| PrivacyGuard::new(config.privacy.clone()));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()));
        let analyzer = self
            .analyzer
            .unwrap_or_else(|| {
                Arc::new(EpisodeAnalyzer::new(
                    config.analytics.clone(),
                    config.mapper.clone(),
                ))
            });

        let inner = PipelineInner {
            instance_id: Uuid::new_v4(),
            validator: ReadingValidator,
            privacy,
            windows: WindowManager::new(&config.window),
            analytics: AnalyticsCalculator::new(config.analytics.clone(), config.mapper.clone()),
            mapper: CognitiveStateMapper::new(config.mapper.clone()),
            alerts: AlertEvaluator::new(config.alerts.clone()),
            embedder: CognitiveEmbedder::new(config.embedding_dimensions, config.mapper.clone()),
            snapshots: TtlLruCache::new(&config.cache)?,
            contexts: TtlLruCache::new(&config.cache)?,
            batches: BatchAccumulator::new(&config.batch),
            store,
            analyzer,
            deferred: Mutex::new(DeferredQueue::default()),
            in_flight: AtomicUsize::new(0),
            pending_writes: Mutex::new(Vec::new()),
            events,
            metrics: PipelineMetrics::default(),
            config,
        };
        info!(
            "pipeline {} ready (privacy: {}, patterns: {}, storage: {})",
            inner.instance_id,
            inner.config.enable_privacy_protection,
            inner.config.enable_neurodivergent_analysis,
            inner.config.batch_storage_enabled
        );

        Ok(BiometricPipeline {
            inner: Arc::new(inner),
        })
    }
}

/// Real-time biometric processing pipeline. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BiometricPipeline {
    inner: Arc<PipelineInner>,
}

impl BiometricPipeline {
    /// Pipeline with the default in-memory store and episode analyzer
    pub fn new(config: PipelineConfig) -> Result<Self, PipelineError> {
        PipelineBuilder::new(config).build()
    }

    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn instance_id(&self) -> Uuid {
        self.inner.instance_id
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn snapshot_cache_stats(&self) -> CacheStats {
        self.inner.snapshots.stats()
    }

    pub fn queue_depth(&self) -> usize {
        self.inner.deferred().len()
    }

    pub fn window_len(&self, subject_id: &str) -> usize {
        self.inner.windows.window_len(subject_id)
    }

    /// Most recent snapshot for a subject, if still cached
    pub fn latest_snapshot(&self, subject_id: &str) -> Option<Arc<AnalyticsSnapshot>> {
        self.inner.snapshots.get(&subject_id.to_string())
    }

    /// Cached cognitive state and generation parameters for the model call
    pub fn model_context(&self, subject_id: &str) -> Option<ModelContext> {
        self.inner.contexts.get(&subject_id.to_string())
    }

    /// Process one reading.
    ///
    /// Returns `ProcessOutcome::Queued` when backpressure defers the reading.
    /// Queued readings are processed by `drain_deferred`, which the loop from
    /// `spawn_maintenance` calls on every drain tick. Readings older than the
    /// max queue age are also dropped here, before a new one is queued.
    pub async fn process_reading(&self, reading: Reading) -> Result<ProcessOutcome, PipelineError> {
        let inner = &self.inner;
        let started = Instant::now();

        let report = inner.validator.validate(&reading);
        if !report.valid {
            inner.metrics.add_rejected(1);
            let reason = report
                .reason
                .unwrap_or_else(|| "reading failed validation".to_string());
            debug!("rejected reading for subject {}: {reason}", reading.subject_id);
            return Err(PipelineError::rejected(reason));
        }
        let warnings = report.warning_messages();

        let clean = inner.validator.sanitize(&reading);
        let clean = match &inner.privacy {
            Some(guard) => guard.protect(&clean),
            None => clean,
        };

        let _slot = {
            let mut deferred = inner.deferred();
            let stale = deferred.pop_stale(inner.config.backpressure.max_queue_age());
            if !stale.is_empty() {
                inner.report_stale(stale);
            }
            let slot = if deferred.has_subject(&clean.subject_id) {
                None
            } else {
                inner.try_reserve(deferred.len())
            };

            match slot {
                Some(slot) => slot,
                None => {
                    let subject_id = clean.subject_id.clone();
                    let timestamp = clean.timestamp;
                    let queue_depth = deferred.push(DeferredReading {
                        reading: clean,
                        warnings,
                        enqueued_at: started,
                    });
                    drop(deferred);

                    inner.metrics.add_queued(1);
                    debug!("deferred reading for subject {subject_id} (queue depth {queue_depth})");
                    inner.emit(PipelineEvent::ReadingQueued {
                        subject_id: subject_id.clone(),
                        timestamp,
                        queue_depth,
                    });
                    return Ok(ProcessOutcome::Queued {
                        subject_id,
                        timestamp,
                        queue_depth,
                    });
                }
            }
        };

        let processed = self.process_admitted(clean, warnings, started);
        Ok(ProcessOutcome::Processed(Box::new(processed)))
    }

    fn process_admitted(
        &self,
        reading: Reading,
        warnings: Vec<String>,
        started: Instant,
    ) -> ProcessedReading {
        let inner = &self.inner;
        let config = &inner.config;
        let subject_id = reading.subject_id.clone();

        let window = if config.realtime_analytics_enabled {
            let window = inner.windows.add_to_window(&subject_id, reading.clone());
            let evicted = window
                .first()
                .map_or(true, |oldest| reading.timestamp < oldest.timestamp);
            if evicted {
                // Already past the horizon, so analyzed on its own
                debug!(
                    "reading for subject {subject_id} at {} is outside the window horizon",
                    reading.timestamp
                );
                vec![reading.clone()]
            } else {
                window
            }
        } else {
            vec![reading.clone()]
        };
        let snapshot = Arc::new(inner.analytics.calculate(&window));
        inner
            .snapshots
            .set(subject_id.clone(), Arc::clone(&snapshot), None);

        let state = inner.mapper.map_to_state(&reading, &snapshot);
        let parameters = inner.mapper.generation_parameters(&state);
        inner.contexts.set(
            subject_id.clone(),
            ModelContext {
                subject_id: subject_id.clone(),
                as_of: reading.timestamp,
                state: state.clone(),
                parameters,
            },
            None,
        );

        if config.batch_storage_enabled {
            let record = StorageRecord {
                subject_id: subject_id.clone(),
                session_id: reading.session_id.clone(),
                timestamp: reading.timestamp,
                reading: reading.clone(),
                state: state.clone(),
                snapshot: Arc::clone(&snapshot),
                embedding: inner.embedder.embed(&window),
            };
            if let Some(batch) = inner.batches.push(record) {
                self.spawn_delivery(batch);
            }
        }

        if config.enable_neurodivergent_analysis {
            self.spawn_analysis(AnalysisRequest {
                subject_id: subject_id.clone(),
                window,
                snapshot: Arc::clone(&snapshot),
            });
        }

        let alerts = inner.alerts.check_alerts(&reading, &snapshot);
        if !alerts.is_empty() {
            inner.metrics.add_alerts(alerts.len() as u64);
            for alert in &alerts {
                warn!(
                    "{:?} alert for subject {}: {} = {:.2} (threshold {:.2})",
                    alert.severity, alert.subject_id, alert.metric, alert.value, alert.threshold
                );
                inner.emit(PipelineEvent::AlertRaised(alert.clone()));
            }
        }

        let elapsed = started.elapsed();
        let processing_ms = elapsed.as_secs_f64() * 1_000.0;
        inner.metrics.add_processed(1);
        inner.emit(PipelineEvent::DataProcessed {
            subject_id: subject_id.clone(),
            timestamp: reading.timestamp,
            reading: reading.clone(),
            state: state.clone(),
            snapshot: Arc::clone(&snapshot),
            alerts: alerts.clone(),
            processing_ms,
        });

        if elapsed > config.slow_processing_threshold() {
            inner.metrics.add_slow_readings(1);
            warn!("slow processing for subject {subject_id}: {processing_ms:.1}ms");
            inner.emit(PipelineEvent::PerformanceWarning {
                subject_id,
                processing_ms,
                threshold_ms: config.slow_processing_warn_ms,
            });
        }

        ProcessedReading {
            reading,
            snapshot,
            state,
            parameters,
            alerts,
            warnings,
            processing_ms,
        }
    }

    fn spawn_delivery(&self, batch: StorageBatch) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.deliver(batch).await });

        let mut pending = lock(&self.inner.pending_writes);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    fn spawn_analysis(&self, request: AnalysisRequest) {
        let inner = Arc::clone(&self.inner);
        let analyzer = Arc::clone(&self.inner.analyzer);
        let timeout = self.inner.config.analysis_timeout();

        tokio::spawn(async move {
            let subject_id = request.subject_id.clone();
            match tokio::time::timeout(timeout, analyzer.analyze(request)).await {
                Ok(Ok(report)) => {
                    if !report.episodes.is_empty() {
                        debug!(
                            "{} pattern episodes for subject {subject_id}",
                            report.episodes.len()
                        );
                        inner.emit(PipelineEvent::PatternsDetected(report));
                    }
                }
                Ok(Err(err)) => inner.analysis_failed(subject_id, err.to_string()),
                Err(_) => inner.analysis_failed(
                    subject_id,
                    format!("timed out after {}ms", timeout.as_millis()),
                ),
            }
        });
    }

    /// Process deferred readings while capacity allows, dropping stale ones
    pub fn drain_deferred(&self) -> DrainSummary {
        let inner = &self.inner;
        let max_age = inner.config.backpressure.max_queue_age();
        let mut summary = DrainSummary::default();

        loop {
            let (item, _slot) = {
                let mut deferred = inner.deferred();
                let stale = deferred.pop_stale(max_age);
                if !stale.is_empty() {
                    drop(deferred);
                    summary.dropped += stale.len();
                    inner.report_stale(stale);
                    continue;
                }

                // Queued readings only gate new arrivals, not the drain itself
                let Some(slot) = inner.try_reserve(0) else {
                    break;
                };
                match deferred.pop_front() {
                    Some(item) => (item, slot),
                    None => break,
                }
            };

            self.process_admitted(item.reading, item.warnings, Instant::now());
            summary.processed += 1;
        }

        summary.remaining = inner.deferred().len();
        if summary.processed > 0 || summary.dropped > 0 {
            debug!(
                "drained deferred queue: {} processed, {} dropped, {} remaining",
                summary.processed, summary.dropped, summary.remaining
            );
        }
        summary
    }

    /// Write everything pending and wait for in-flight storage writes
    pub async fn flush(&self) {
        let inner = &self.inner;

        let pending = mem::take(&mut *lock(&inner.pending_writes));
        for handle in pending {
            if let Err(err) = handle.await {
                error!("storage task failed: {err}");
            }
        }

        if let Some(batch) = inner.batches.take_all() {
            inner.deliver(batch).await;
        }
        loop {
            let retries = inner.batches.take_retries();
            if retries.is_empty() {
                break;
            }
            for batch in retries {
                inner.deliver(batch).await;
            }
        }
    }

    fn flush_due(&self) {
        let interval = self.inner.config.batch.flush_interval();
        if let Some(batch) = self.inner.batches.take_due(interval) {
            self.spawn_delivery(batch);
        }
        for batch in self.inner.batches.take_retries() {
            self.spawn_delivery(batch);
        }
    }

    fn sweep(&self) {
        self.sweep_at(Utc::now());
    }

    /// Purge expired cache entries and reclaim windows idle as of `now`
    fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let inner = &self.inner;
        let expired = inner.snapshots.purge_expired() + inner.contexts.purge_expired();
        let reclaimed = inner.windows.reclaim_idle_at(now);
        if expired > 0 || reclaimed > 0 {
            debug!("sweep: {expired} cache entries expired, {reclaimed} windows reclaimed");
        }
        reclaimed
    }

    /// Background drain, time-based flush, cache sweeps and idle-window reclaim
    pub fn spawn_maintenance(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.maintenance_loop(cancel).await })
    }

    async fn maintenance_loop(&self, cancel: CancellationToken) {
        let config = &self.inner.config;
        let mut drain = tokio::time::interval(config.backpressure.drain_interval());
        drain.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut flush = tokio::time::interval(config.batch.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval(config.cache.cleanup_interval());
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = drain.tick() => {
                    self.drain_deferred();
                }
                _ = flush.tick() => {
                    self.flush_due();
                }
                _ = sweep.tick() => {
                    self.sweep();
                }
                _ = cancel.cancelled() => {
                    info!("pipeline {} maintenance shutting down", self.inner.instance_id);
                    break;
                }
            }
        }
    }

    /// Drain what capacity allows, then flush storage
    pub async fn shutdown(&self) {
        loop {
            let summary = self.drain_deferred();
            if summary.remaining == 0 || summary.processed + summary.dropped == 0 {
                if summary.remaining > 0 {
                    warn!(
                        "shutting down with {} deferred readings unprocessed",
                        summary.remaining
                    );
                }
                break;
            }
        }
        self.flush().await;
        let metrics = self.metrics();
        info!(
            "pipeline {} shut down: {} processed, {} rejected, {} records stored",
            self.inner.instance_id, metrics.processed, metrics.rejected, metrics.records_stored
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::PatternReport;
    use crate::types::{BrainwaveBands, MetricKind, Trend};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use crate::types::{AlertSeverity, PatternTag};
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;
    use std::time::Duration;

    /// Offsets used below stay well inside the default 300s window horizon
    fn base() -> DateTime<Utc> {
        Utc::now() - ChronoDuration::minutes(2)
    }

    fn reading(subject: &str, offset_secs: i64, hr: f64) -> Reading {
        Reading {
            session_id: Some("session-1".to_string()),
            source: Some("test".to_string()),
            heart_rate: Some(hr),
            hrv_rmssd_ms: Some(55.0),
            ..Reading::new(subject, base() + ChronoDuration::seconds(offset_secs))
        }
    }

    fn config() -> PipelineConfig {
        PipelineConfig {
            enable_privacy_protection: false,
            ..Default::default()
        }
    }

    fn drain_events(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    struct FailingStore;

    #[async_trait]
    impl BiometricStore for FailingStore {
        async fn upsert_batch(&self, _batch: &StorageBatch) -> Result<(), PipelineError> {
            Err(PipelineError::Storage("connection refused".to_string()))
        }
    }

    struct SlowAnalyzer;

    #[async_trait]
    impl PatternAnalyzer for SlowAnalyzer {
        async fn analyze(&self, request: AnalysisRequest) -> Result<PatternReport, PipelineError> {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(PatternReport {
                subject_id: request.subject_id,
                as_of: request.snapshot.as_of.unwrap_or_else(Utc::now),
                active_tags: BTreeSet::new(),
                episodes: Vec::new(),
                analyzed_samples: request.window.len(),
            })
        }
    }

    #[tokio::test]
    async fn test_processes_reading_end_to_end() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        let mut rx = pipeline.subscribe();

        let outcome = pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        let processed = outcome.processed().unwrap();

        assert_eq!(processed.snapshot.sample_count, 1);
        assert!(processed.alerts.is_empty());
        assert!(processed
            .warnings
            .iter()
            .any(|w| w.contains("brainwave")));
        assert!((0.1..=1.0).contains(&processed.parameters.temperature));

        let context = pipeline.model_context("subject-1").unwrap();
        assert_eq!(context.parameters, processed.parameters);
        assert_eq!(
            pipeline.latest_snapshot("subject-1").unwrap().sample_count,
            1
        );
        assert_eq!(pipeline.metrics().processed, 1);

        let events = drain_events(&mut rx);
        let Some(PipelineEvent::DataProcessed {
            reading: sent,
            alerts,
            snapshot,
            ..
        }) = events
            .into_iter()
            .find(|e| matches!(e, PipelineEvent::DataProcessed { .. }))
        else {
            panic!("no data_processed event");
        };
        assert_eq!(sent, processed.reading);
        assert!(alerts.is_empty());
        assert_eq!(snapshot.sample_count, 1);
    }

    #[tokio::test]
    async fn test_data_processed_event_carries_alerts() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        let mut rx = pipeline.subscribe();

        let outcome = pipeline
            .process_reading(reading("subject-1", 0, 170.0))
            .await
            .unwrap();
        let processed = outcome.processed().unwrap();
        assert!(!processed.alerts.is_empty());

        let alerts = drain_events(&mut rx)
            .into_iter()
            .find_map(|e| match e {
                PipelineEvent::DataProcessed { alerts, .. } => Some(alerts),
                _ => None,
            })
            .unwrap();
        assert_eq!(alerts, processed.alerts);
        assert!(alerts
            .iter()
            .any(|a| a.metric == MetricKind::HeartRate && a.severity == AlertSeverity::Critical));
    }

    #[tokio::test]
    async fn test_reading_past_horizon_is_analyzed_alone() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();

        let stale_at = Utc::now() - ChronoDuration::minutes(20);
        let stale = Reading {
            heart_rate: Some(80.0),
            ..Reading::new("subject-1", stale_at)
        };
        let outcome = pipeline.process_reading(stale).await.unwrap();

        let snapshot = &outcome.processed().unwrap().snapshot;
        assert_eq!(snapshot.sample_count, 1);
        assert_eq!(snapshot.as_of, Some(stale_at));
        assert_eq!(pipeline.window_len("subject-1"), 1);
        let horizon = ChronoDuration::seconds(pipeline.config().window.horizon_secs as i64);
        let now = Utc::now();
        assert!(pipeline
            .inner
            .windows
            .window("subject-1")
            .iter()
            .all(|r| now - r.timestamp <= horizon));
    }

    #[tokio::test]
    async fn test_window_builds_up_trend() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        let mut last = None;
        for (i, hr) in [70.0, 75.0, 80.0, 85.0, 90.0].into_iter().enumerate() {
            last = pipeline
                .process_reading(reading("subject-1", i as i64 * 30, hr))
                .await
                .unwrap()
                .processed()
                .map(|p| Arc::clone(&p.snapshot));
        }

        let snapshot = last.unwrap();
        assert_eq!(snapshot.sample_count, 5);
        assert_eq!(snapshot.trend(MetricKind::HeartRate), Trend::Increasing);
        assert_eq!(pipeline.window_len("subject-1"), 5);
    }

    #[tokio::test]
    async fn test_invalid_reading_is_rejected() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        let result = pipeline
            .process_reading(reading("subject-1", 0, 300.0))
            .await;

        assert!(matches!(result, Err(PipelineError::Validation { .. })));
        assert_eq!(pipeline.metrics().rejected, 1);
        assert_eq!(pipeline.window_len("subject-1"), 0);
    }

    #[tokio::test]
    async fn test_backpressure_queues_without_touching_window() {
        let pipeline = BiometricPipeline::new(PipelineConfig {
            max_processing_load: 2,
            ..config()
        })
        .unwrap();
        pipeline.inner.in_flight.store(2, Ordering::SeqCst);

        let outcome = pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        assert!(outcome.is_queued());
        assert_eq!(pipeline.window_len("subject-1"), 0);
        assert!(pipeline.model_context("subject-1").is_none());
        assert_eq!(pipeline.queue_depth(), 1);

        pipeline.inner.in_flight.store(0, Ordering::SeqCst);
        let summary = pipeline.drain_deferred();
        assert_eq!(
            summary,
            DrainSummary {
                processed: 1,
                dropped: 0,
                remaining: 0
            }
        );
        assert_eq!(pipeline.window_len("subject-1"), 1);
        assert_eq!(pipeline.inner.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_subject_with_queued_readings_keeps_arrival_order() {
        let pipeline = BiometricPipeline::new(PipelineConfig {
            max_processing_load: 2,
            ..config()
        })
        .unwrap();

        pipeline.inner.in_flight.store(2, Ordering::SeqCst);
        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        pipeline.inner.in_flight.store(0, Ordering::SeqCst);

        // Capacity is free, but subject-1 still has a queued reading
        let outcome = pipeline
            .process_reading(reading("subject-1", 1, 74.0))
            .await
            .unwrap();
        assert!(outcome.is_queued());

        // Two queued readings already fill the ceiling for everyone
        let other = pipeline
            .process_reading(reading("subject-2", 0, 70.0))
            .await;
        assert!(other.unwrap().is_queued());

        let summary = pipeline.drain_deferred();
        assert_eq!(summary.processed, 3);
        let window = pipeline.inner.windows.window("subject-1");
        let rates: Vec<f64> = window.iter().filter_map(|r| r.heart_rate).collect();
        assert_eq!(rates, vec![72.0, 74.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_deferred_readings_are_dropped() {
        let pipeline = BiometricPipeline::new(PipelineConfig {
            max_processing_load: 1,
            ..config()
        })
        .unwrap();
        let mut rx = pipeline.subscribe();

        pipeline.inner.in_flight.store(1, Ordering::SeqCst);
        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        pipeline.inner.in_flight.store(0, Ordering::SeqCst);

        tokio::time::advance(Duration::from_secs(31)).await;
        let summary = pipeline.drain_deferred();

        assert_eq!(summary.dropped, 1);
        assert_eq!(summary.processed, 0);
        assert_eq!(pipeline.metrics().stale_dropped, 1);
        assert_eq!(pipeline.window_len("subject-1"), 0);
        assert!(drain_events(&mut rx)
            .iter()
            .any(|e| matches!(e, PipelineEvent::StaleReadingDropped { .. })));
    }

    #[tokio::test]
    async fn test_storage_failure_retries_once_then_raises_critical() {
        let mut cfg = config();
        cfg.batch.max_batch_size = 1;
        cfg.enable_neurodivergent_analysis = false;
        let pipeline = BiometricPipeline::builder(cfg)
            .with_store(Arc::new(FailingStore))
            .build()
            .unwrap();
        let mut rx = pipeline.subscribe();

        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        pipeline.flush().await;

        let metrics = pipeline.metrics();
        assert_eq!(metrics.storage_failures, 2);
        assert_eq!(metrics.batches_lost, 1);
        assert_eq!(metrics.batches_flushed, 0);

        let critical: Vec<PipelineEvent> = drain_events(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, PipelineEvent::CriticalAlert { .. }))
            .collect();
        assert_eq!(critical.len(), 1);
        if let PipelineEvent::CriticalAlert { records, .. } = &critical[0] {
            assert_eq!(*records, 1);
        }
    }

    #[tokio::test]
    async fn test_flush_writes_to_store() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = BiometricPipeline::builder(config())
            .with_store(store.clone())
            .build()
            .unwrap();

        for i in 0..3 {
            pipeline
                .process_reading(reading("subject-1", i, 72.0))
                .await
                .unwrap();
        }
        assert!(store.is_empty());

        pipeline.flush().await;
        assert_eq!(store.len(), 3);
        let stored = store.records_for("subject-1");
        assert_eq!(stored[2].embedding.as_ref().map(Vec::len), Some(768));
        assert_eq!(pipeline.metrics().records_stored, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pattern_timeout_does_not_fail_processing() {
        let pipeline = BiometricPipeline::builder(PipelineConfig {
            analysis_timeout_ms: 50,
            ..config()
        })
        .with_analyzer(Arc::new(SlowAnalyzer))
        .build()
        .unwrap();
        let mut rx = pipeline.subscribe();

        let outcome = pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        assert!(!outcome.is_queued());

        let failure = tokio::time::timeout(Duration::from_secs(60), async {
            loop {
                match rx.recv().await {
                    Ok(PipelineEvent::AnalysisFailed { reason, .. }) => return reason,
                    Ok(_) => continue,
                    Err(err) => panic!("event channel closed: {err}"),
                }
            }
        })
        .await
        .unwrap();
        assert!(failure.contains("timed out"));
        assert_eq!(pipeline.metrics().analysis_failures, 1);
    }

    #[tokio::test]
    async fn test_patterns_reported_for_eeg_readings() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        let mut rx = pipeline.subscribe();

        let r = Reading {
            brainwaves: Some(BrainwaveBands {
                alpha: 2.0,
                beta: 2.0,
                theta: 6.0,
                gamma: 0.5,
            }),
            ..reading("subject-1", 0, 72.0)
        };
        let sent_at = r.timestamp;
        pipeline.process_reading(r).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Ok(PipelineEvent::PatternsDetected(report)) = rx.recv().await {
                    return report;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(report.subject_id, "subject-1");
        assert_eq!(report.as_of, sent_at);
        assert!(report.active_tags.contains(&PatternTag::ThetaBetaElevation));
        assert!(!report.episodes.is_empty());
    }

    #[tokio::test]
    async fn test_realtime_analytics_disabled_uses_single_reading() {
        let pipeline = BiometricPipeline::new(PipelineConfig {
            realtime_analytics_enabled: false,
            ..config()
        })
        .unwrap();
        for i in 0..3 {
            pipeline
                .process_reading(reading("subject-1", i, 72.0))
                .await
                .unwrap();
        }
        assert_eq!(pipeline.window_len("subject-1"), 0);
        assert_eq!(
            pipeline.latest_snapshot("subject-1").unwrap().sample_count,
            1
        );
    }

    #[tokio::test]
    async fn test_maintenance_stops_on_cancel() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        let cancel = CancellationToken::new();
        let handle = pipeline.spawn_maintenance(cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
    #[tokio::test(start_paused = true)]
    async fn test_stale_queue_is_purged_on_enqueue() {
        let pipeline = BiometricPipeline::new(PipelineConfig {
            max_processing_load: 1,
            ..config()
        })
        .unwrap();
        pipeline.inner.in_flight.store(1, Ordering::SeqCst);

        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(31)).await;

        // No drain has run; the next enqueue drops the expired reading
        let outcome = pipeline
            .process_reading(reading("subject-2", 1, 70.0))
            .await
            .unwrap();
        assert!(outcome.is_queued());
        assert_eq!(pipeline.queue_depth(), 1);
        assert_eq!(pipeline.metrics().stale_dropped, 1);

        // subject-1 no longer has anything queued ahead of it
        assert!(pipeline.inner.deferred().has_subject("subject-2"));
        assert!(!pipeline.inner.deferred().has_subject("subject-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_maintenance_flushes_batches_on_interval() {
        let store = Arc::new(MemoryStore::new());
        let mut cfg = config();
        cfg.enable_neurodivergent_analysis = false;
        cfg.batch.max_batch_size = 100;
        cfg.batch.flush_interval_ms = 1_000;
        let pipeline = BiometricPipeline::builder(cfg)
            .with_store(store.clone())
            .build()
            .unwrap();

        for i in 0..3 {
            pipeline
                .process_reading(reading("subject-1", i, 72.0))
                .await
                .unwrap();
        }
        let cancel = CancellationToken::new();
        let handle = pipeline.spawn_maintenance(cancel.clone());

        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert_eq!(store.len(), 3);
        assert_eq!(pipeline.metrics().records_stored, 3);
        assert_eq!(pipeline.metrics().batches_flushed, 1);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_is_retried_by_due_flush() {
        struct FailOnce(AtomicUsize, MemoryStore);

        #[async_trait]
        impl BiometricStore for FailOnce {
            async fn upsert_batch(&self, batch: &StorageBatch) -> Result<(), PipelineError> {
                if self.0.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(PipelineError::Storage("timeout".to_string()));
                }
                self.1.upsert_batch(batch).await
            }
        }

        let store = Arc::new(FailOnce(AtomicUsize::new(0), MemoryStore::new()));
        let mut cfg = config();
        cfg.enable_neurodivergent_analysis = false;
        cfg.batch.max_batch_size = 1;
        let pipeline = BiometricPipeline::builder(cfg)
            .with_store(store.clone())
            .build()
            .unwrap();

        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        // Let the size-triggered write fail and requeue
        let pending = mem::take(&mut *lock(&pipeline.inner.pending_writes));
        for handle in pending {
            handle.await.unwrap();
        }
        assert_eq!(pipeline.metrics().storage_failures, 1);

        pipeline.flush_due();
        let pending = mem::take(&mut *lock(&pipeline.inner.pending_writes));
        assert_eq!(pending.len(), 1);
        for handle in pending {
            handle.await.unwrap();
        }

        assert_eq!(store.1.len(), 1);
        assert_eq!(pipeline.metrics().batches_lost, 0);
        assert_eq!(pipeline.metrics().records_stored, 1);
    }

    #[tokio::test]
    async fn test_sweep_reclaims_idle_windows() {
        let pipeline = BiometricPipeline::new(config()).unwrap();
        pipeline
            .process_reading(reading("subject-1", 0, 72.0))
            .await
            .unwrap();
        assert_eq!(pipeline.window_len("subject-1"), 1);

        assert_eq!(pipeline.sweep_at(Utc::now()), 0);
        assert_eq!(pipeline.window_len("subject-1"), 1);

        let idle = pipeline.config().window.idle_reclaim_secs as i64 + 60;
        assert_eq!(pipeline.sweep_at(Utc::now() + ChronoDuration::seconds(idle)), 1);
        assert_eq!(pipeline.window_len("subject-1"), 0);
    }
}
