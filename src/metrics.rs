//! Pipeline counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMetrics {
    processed: AtomicU64,
    rejected: AtomicU64,
    queued: AtomicU64,
    stale_dropped: AtomicU64,
    alerts: AtomicU64,
    analysis_failures: AtomicU64,
    batches_flushed: AtomicU64,
    records_stored: AtomicU64,
    storage_failures: AtomicU64,
    batches_lost: AtomicU64,
    slow_readings: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub processed: u64,
    pub rejected: u64,
    pub queued: u64,
    pub stale_dropped: u64,
    pub alerts: u64,
    pub analysis_failures: u64,
    pub batches_flushed: u64,
    pub records_stored: u64,
    pub storage_failures: u64,
    /// Batches that failed their retry and were reported as critical
    pub batches_lost: u64,
    pub slow_readings: u64,
}

macro_rules! counter {
    ($($name:ident => $field:ident),* $(,)?) => {
        impl PipelineMetrics {
            $(
                pub(crate) fn $name(&self, n: u64) {
                    self.$field.fetch_add(n, Ordering::Relaxed);
                }
            )*
        }
    };
}

counter! {
    add_processed => processed,
    add_rejected => rejected,
    add_queued => queued,
    add_stale_dropped => stale_dropped,
    add_alerts => alerts,
    add_analysis_failures => analysis_failures,
    add_batches_flushed => batches_flushed,
    add_records_stored => records_stored,
    add_storage_failures => storage_failures,
    add_batches_lost => batches_lost,
    add_slow_readings => slow_readings,
}

impl PipelineMetrics {
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            processed: load(&self.processed),
            rejected: load(&self.rejected),
            queued: load(&self.queued),
            stale_dropped: load(&self.stale_dropped),
            alerts: load(&self.alerts),
            analysis_failures: load(&self.analysis_failures),
            batches_flushed: load(&self.batches_flushed),
            records_stored: load(&self.records_stored),
            storage_failures: load(&self.storage_failures),
            batches_lost: load(&self.batches_lost),
            slow_readings: load(&self.slow_readings),
        }
    }
}
