//! The standard queue-draining worker loop.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use tracing::{debug, warn};

use super::{Worker, WorkerContext};
use crate::error::{Error, Result};
use crate::queue::{Message, StageQueue};
use crate::telemetry::metrics;

/// Processes one dequeued item. Errors and panics are logged by the worker
/// and the item is dropped; they never end the worker.
#[async_trait]
pub trait ItemHandler<T>: Send + Sync + 'static {
    async fn handle(&self, item: T) -> Result<()>;
}

/// Drains one [`StageQueue`] into an [`ItemHandler`].
///
/// Dequeues with a bounded wait so stop signals are noticed on an idle queue.
/// On [`Message::Stop`] the marker is relayed to sibling workers that are
/// still running, so the queue ends empty once the whole pool has exited.
pub struct StageWorker<T> {
    stage: String,
    input: Arc<StageQueue<T>>,
    handler: Arc<dyn ItemHandler<T>>,
    poll_interval: Duration,
}

impl<T: Send + 'static> StageWorker<T> {
    pub fn new(
        stage: impl Into<String>,
        input: Arc<StageQueue<T>>,
        handler: Arc<dyn ItemHandler<T>>,
    ) -> Self {
        Self {
            stage: stage.into(),
            input,
            handler,
            poll_interval: Duration::from_secs(1),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

#[async_trait]
impl<T: Send + 'static> Worker for StageWorker<T> {
    async fn run(&self, ctx: WorkerContext) {
        loop {
            if ctx.is_cancelled() {
                debug!(stage = %self.stage, "cancelled");
                return;
            }
            if self.input.retire_unless_stopping(|| ctx.should_retire()) {
                debug!(stage = %self.stage, "retiring surplus worker");
                return;
            }

            let msg = match self.input.get_timeout(self.poll_interval).await {
                Some(msg) => msg,
                None => {
                    if ctx.is_draining() && self.input.leave_if_empty(|| ctx.leave()) {
                        return;
                    }
                    continue;
                }
            };

            let item = match msg {
                Message::Item(item) => item,
                Message::Stop => {
                    // The last worker out consumes the marker.
                    self.input.relay_stop(|| ctx.leave());
                    return;
                }
            };

            let handled = AssertUnwindSafe(self.handler.handle(item))
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(Error::Other(panic_message(payload.as_ref()))));
            match handled {
                Ok(()) => {
                    ctx.record_processed();
                    metrics::stage_items().add(
                        1,
                        &[
                            KeyValue::new("stage", self.stage.clone()),
                            KeyValue::new("result", "ok"),
                        ],
                    );
                }
                Err(e) => {
                    warn!(
                        stage = %self.stage,
                        worker_id = ctx.worker_id(),
                        error = %e,
                        "item failed, dropping"
                    );
                    metrics::stage_items().add(
                        1,
                        &[
                            KeyValue::new("stage", self.stage.clone()),
                            KeyValue::new("result", "error"),
                        ],
                    );
                }
            }
        }
    }
}

/// Best-effort text of a caught panic.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("panicked: {detail}")
}
