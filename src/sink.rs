//! Batch persistence of enriched records.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::model::WorkItem;

/// Idempotent batch upsert keyed by record id.
///
/// Writing the same id twice merges fields shallowly, last write wins. A
/// batch may contain the same id more than once (one copy per stage).
#[async_trait]
pub trait RecordSink: Send + Sync {
    async fn upsert_batch(&self, items: &[WorkItem]) -> Result<()>;
}

/// In-process sink, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryRecordSink {
    records: Mutex<BTreeMap<String, WorkItem>>,
    writes: Mutex<Vec<String>>,
    batches: Mutex<usize>,
}

impl MemoryRecordSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<WorkItem> {
        self.records.lock().get(id).cloned()
    }

    /// Distinct record ids stored, in id order.
    pub fn ids(&self) -> Vec<String> {
        self.records.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Every id written, in write order, repeats included.
    pub fn write_log(&self) -> Vec<String> {
        self.writes.lock().clone()
    }

    pub fn batches(&self) -> usize {
        *self.batches.lock()
    }
}

#[async_trait]
impl RecordSink for MemoryRecordSink {
    async fn upsert_batch(&self, items: &[WorkItem]) -> Result<()> {
        let mut records = self.records.lock();
        let mut writes = self.writes.lock();
        for item in items {
            records
                .entry(item.id().to_string())
                .and_modify(|existing| existing.merge_from(item))
                .or_insert_with(|| item.clone());
            writes.push(item.id().to_string());
        }
        *self.batches.lock() += 1;
        Ok(())
    }
}
