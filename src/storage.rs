//! Storage collaborator
//!
//! The pipeline only talks to `BiometricStore`. Writes are upserts keyed on
//! (subject id, timestamp), so redelivering a batch after a failure never
//! duplicates records.

use crate::batch::{StorageBatch, StorageRecord};
use crate::error::PipelineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

#[async_trait]
pub trait BiometricStore: Send + Sync {
    /// Persist every record in the batch, replacing records with the same key
    async fn upsert_batch(&self, batch: &StorageBatch) -> Result<(), PipelineError>;
}

type RecordKey = (String, DateTime<Utc>);

/// In-process store used by the CLI and tests
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<RecordKey, StorageRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<RecordKey, StorageRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored records for one subject, oldest first
    pub fn records_for(&self, subject_id: &str) -> Vec<StorageRecord> {
        self.records()
            .values()
            .filter(|r| r.subject_id == subject_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl BiometricStore for MemoryStore {
    async fn upsert_batch(&self, batch: &StorageBatch) -> Result<(), PipelineError> {
        let mut records = self.records();
        for record in &batch.records {
            records.insert(record.key(), record.clone());
        }
        Ok(())
    }
}
