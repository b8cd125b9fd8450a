//! Page-level watermark tracking.
//!
//! Every fetched page is registered with the number of deliveries it fanned
//! out (one per stage a record was routed to). Deliveries are resolved when
//! the writer persists them or a stage drops them. The watermark advances
//! over the longest prefix of fully resolved pages, so a restart never skips
//! a record whose enrichment was not persisted.

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde_json::json;

use crate::error::Result;
use crate::model::WorkItem;
use crate::state::PipelineStateManager;

/// A record in flight, tagged with the page it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Tagged {
    pub page: u64,
    pub item: WorkItem,
}

/// Progress that became durable since the previous checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    /// Id of the last record of the newest fully resolved page.
    pub last_id: String,
    /// New records those pages contributed.
    pub records: i64,
    /// Number of pages covered.
    pub pages: usize,
}

#[derive(Debug)]
struct PageEntry {
    last_id: Option<String>,
    outstanding: usize,
    records: i64,
    ids: Vec<String>,
}

#[derive(Debug, Default)]
struct Inner {
    pages: BTreeMap<u64, PageEntry>,
    next_page: u64,
}

#[derive(Debug, Default)]
pub struct WatermarkTracker {
    inner: Mutex<Inner>,
}

impl WatermarkTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a page before any of its deliveries are enqueued.
    ///
    /// `last_id` is the id of the page's last record (scheduled or not),
    /// `scheduled` the ids newly queued from it, `deliveries` the total
    /// number of stage deliveries fanned out.
    pub fn register_page(
        &self,
        last_id: Option<String>,
        scheduled: Vec<String>,
        deliveries: usize,
    ) -> u64 {
        let mut inner = self.inner.lock();
        let page = inner.next_page;
        inner.next_page += 1;
        inner.pages.insert(
            page,
            PageEntry {
                last_id,
                outstanding: deliveries,
                records: scheduled.len() as i64,
                ids: scheduled,
            },
        );
        page
    }

    /// Mark `n` deliveries of `page` as written or dropped.
    pub fn resolve(&self, page: u64, n: usize) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.pages.get_mut(&page) {
            entry.outstanding = entry.outstanding.saturating_sub(n);
        }
    }

    /// Pop the resolved prefix and summarize it. `None` if nothing moved or
    /// the prefix carried no record ids.
    pub fn advance(&self) -> Option<Checkpoint> {
        let mut inner = self.inner.lock();
        let mut last_id = None;
        let mut records = 0;
        let mut pages = 0;
        while let Some(entry) = inner.pages.first_entry() {
            if entry.get().outstanding > 0 {
                break;
            }
            let entry = entry.remove();
            if entry.last_id.is_some() {
                last_id = entry.last_id;
            }
            records += entry.records;
            pages += 1;
        }
        last_id.map(|last_id| Checkpoint {
            last_id,
            records,
            pages,
        })
    }

    /// Pages registered but not yet covered by a checkpoint.
    pub fn pending_pages(&self) -> usize {
        self.inner.lock().pages.len()
    }

    /// Ids scheduled on pages that never reached a checkpoint.
    pub fn unfinished_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .pages
            .values()
            .flat_map(|p| p.ids.iter().cloned())
            .collect()
    }
}

/// Persist whatever the tracker can advance. Returns the checkpoint written.
pub async fn checkpoint(
    tracker: &WatermarkTracker,
    state: &PipelineStateManager,
) -> Result<Option<Checkpoint>> {
    let Some(cp) = tracker.advance() else {
        return Ok(None);
    };
    state
        .update_progress(
            cp.records,
            Some(cp.last_id.clone()),
            json!({ "last_processed_id": cp.last_id }),
        )
        .await?;
    tracing::debug!(last_id = %cp.last_id, records = cp.records, pages = cp.pages, "checkpoint");
    Ok(Some(cp))
}
