//! Storage batching
//!
//! Records accumulate in memory and leave as a `StorageBatch` when the buffer
//! reaches its size limit, when the flush interval has passed, or on explicit
//! flush. The buffer is swapped out under the lock so the caller never holds it
//! across storage I/O.

use crate::config::BatchConfig;
use crate::types::{AnalyticsSnapshot, CognitiveState, Reading};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// One processed reading destined for the store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRecord {
    pub subject_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub reading: Reading,
    pub state: CognitiveState,
    pub snapshot: Arc<AnalyticsSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl StorageRecord {
    /// Upsert key; storing the same key twice replaces the record
    pub fn key(&self) -> (String, DateTime<Utc>) {
        (self.subject_id.clone(), self.timestamp)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageBatch {
    pub batch_id: Uuid,
    /// 0 on first delivery, incremented on each retry
    pub attempt: u8,
    pub records: Vec<StorageRecord>,
}

impl StorageBatch {
    pub fn new(records: Vec<StorageRecord>) -> Self {
        Self {
            batch_id: Uuid::new_v4(),
            attempt: 0,
            records,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

struct BatchState {
    pending: Vec<StorageRecord>,
    retries: Vec<StorageBatch>,
    last_flush: Instant,
}

pub struct BatchAccumulator {
    max_batch_size: usize,
    state: Mutex<BatchState>,
}

impl BatchAccumulator {
    pub fn new(config: &BatchConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size.max(1),
            state: Mutex::new(BatchState {
                pending: Vec::new(),
                retries: Vec::new(),
                last_flush: Instant::now(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Add a record, returning a full batch when the size limit is reached
    pub fn push(&self, record: StorageRecord) -> Option<StorageBatch> {
        let mut state = self.state();
        state.pending.push(record);
        if state.pending.len() >= self.max_batch_size {
            Some(Self::swap_out(&mut state))
        } else {
            None
        }
    }

    /// Take the pending records if the interval has elapsed since the last flush
    pub fn take_due(&self, interval: Duration) -> Option<StorageBatch> {
        let mut state = self.state();
        if state.pending.is_empty() || state.last_flush.elapsed() < interval {
            return None;
        }
        Some(Self::swap_out(&mut state))
    }

    /// Take whatever is pending, regardless of size or age
    pub fn take_all(&self) -> Option<StorageBatch> {
        let mut state = self.state();
        if state.pending.is_empty() {
            return None;
        }
        Some(Self::swap_out(&mut state))
    }

    /// Hold a failed batch for one more delivery attempt
    pub fn requeue(&self, mut batch: StorageBatch) {
        batch.attempt = batch.attempt.saturating_add(1);
        self.state().retries.push(batch);
    }

    pub fn take_retries(&self) -> Vec<StorageBatch> {
        mem::take(&mut self.state().retries)
    }

    pub fn pending_len(&self) -> usize {
        self.state().pending.len()
    }

    fn swap_out(state: &mut BatchState) -> StorageBatch {
        state.last_flush = Instant::now();
        StorageBatch::new(mem::take(&mut state.pending))
    }
}
