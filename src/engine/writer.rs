//! The writer stage: batches enriched records into the sink and moves the
//! watermark after each flush.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::watermark::{self, Tagged, WatermarkTracker};
use crate::error::Result;
use crate::model::WorkItem;
use crate::queue::{Message, StageQueue};
use crate::sink::RecordSink;
use crate::state::PipelineStateManager;

pub struct Writer {
    sink: Arc<dyn RecordSink>,
    input: Arc<StageQueue<Tagged>>,
    tracker: Arc<WatermarkTracker>,
    state: Arc<PipelineStateManager>,
    batch_size: usize,
    poll_interval: Duration,
    written: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl Writer {
    pub fn new(
        sink: Arc<dyn RecordSink>,
        input: Arc<StageQueue<Tagged>>,
        tracker: Arc<WatermarkTracker>,
        state: Arc<PipelineStateManager>,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            sink,
            input,
            tracker,
            state,
            batch_size: batch_size.max(1),
            poll_interval: Duration::from_secs(1),
            written: Arc::new(AtomicU64::new(0)),
            cancel,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Shared count of records written so far.
    pub fn written(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.written)
    }

    /// Drain the queue until [`Message::Stop`]. A partial batch is flushed
    /// when the queue goes idle and on stop. A sink or checkpoint failure
    /// cancels the run and is returned.
    pub async fn run(self) -> Result<u64> {
        let result = self.drain().await;
        if let Err(ref e) = result {
            error!(error = %e, "writer failed, cancelling run");
            self.cancel.cancel();
        }
        result
    }

    async fn drain(&self) -> Result<u64> {
        let mut batch: Vec<Tagged> = Vec::with_capacity(self.batch_size);
        loop {
            match self.input.get_timeout(self.poll_interval).await {
                None => {
                    self.flush(&mut batch).await?;
                }
                Some(Message::Item(tagged)) => {
                    batch.push(tagged);
                    if batch.len() >= self.batch_size {
                        self.flush(&mut batch).await?;
                    }
                }
                Some(Message::Stop) => {
                    self.flush(&mut batch).await?;
                    break;
                }
            }
        }

        let written = self.written.load(Ordering::Relaxed);
        info!(written, "writer finished");
        Ok(written)
    }

    async fn flush(&self, batch: &mut Vec<Tagged>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pages = Vec::with_capacity(batch.len());
        let items: Vec<WorkItem> = batch
            .drain(..)
            .map(|t| {
                pages.push(t.page);
                t.item
            })
            .collect();

        self.sink.upsert_batch(&items).await?;
        self.written.fetch_add(items.len() as u64, Ordering::Relaxed);
        debug!(count = items.len(), "flushed batch");

        for page in pages {
            self.tracker.resolve(page, 1);
        }
        watermark::checkpoint(&self.tracker, &self.state).await?;
        Ok(())
    }
}
