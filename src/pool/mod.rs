//! Dynamically sized worker pools.
//!
//! A pool runs between `min_workers` and `max_workers` copies of one
//! [`Worker`]. An auto-scaling task samples CPU load and the pool's
//! throughput on a fixed cadence and adds or retires workers according to
//! [`ScalingPolicy`]. Workers are never aborted: retiring only lowers the
//! target, and a surplus worker leaves on its own between units of work.

pub mod scaling;
pub mod stage;

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

use crate::telemetry::metrics;

pub use scaling::{
    FixedLoad, LoadSampler, ScalingConfig, ScalingDecision, ScalingPolicy, SystemCpuSampler,
};
pub use stage::{ItemHandler, StageWorker};

/// One unit-of-work loop. Each pool worker calls `run` once and exits when
/// it returns.
#[async_trait]
pub trait Worker: Send + Sync + 'static {
    async fn run(&self, ctx: WorkerContext);
}

struct PoolShared {
    target: AtomicUsize,
    live: AtomicUsize,
    processed: AtomicU64,
    draining: AtomicBool,
    cancel: CancellationToken,
}

/// Handle given to each worker: stop signals, retirement and the
/// throughput counter.
#[derive(Clone)]
pub struct WorkerContext {
    worker_id: usize,
    shared: Arc<PoolShared>,
    retired: Arc<AtomicBool>,
}

impl WorkerContext {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Cooperative cancellation: finish the current item, then leave.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Set once `stop()` has been called. An idle worker may exit.
    pub fn is_draining(&self) -> bool {
        self.shared.draining.load(Ordering::Acquire)
    }

    /// Count one item toward the pool's throughput.
    pub fn record_processed(&self) {
        self.shared.processed.fetch_add(1, Ordering::Relaxed);
    }

    /// Leave the pool now. Returns how many sibling workers are still live.
    pub fn leave(&self) -> usize {
        if self.retired.swap(true, Ordering::AcqRel) {
            return self.shared.live.load(Ordering::Acquire);
        }
        self.shared.live.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// True if this worker is surplus to the target and should exit now.
    /// At most `live - target` callers get `true`.
    pub fn should_retire(&self) -> bool {
        let shared = &self.shared;
        let mut live = shared.live.load(Ordering::Acquire);
        loop {
            if live <= shared.target.load(Ordering::Acquire) {
                return false;
            }
            match shared
                .live
                .compare_exchange(live, live - 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.retired.store(true, Ordering::Release);
                    return true;
                }
                Err(current) => live = current,
            }
        }
    }
}

/// Releases a worker's place in `live` when its task ends, panics included.
struct LiveSlot {
    shared: Arc<PoolShared>,
    retired: Arc<AtomicBool>,
}

impl Drop for LiveSlot {
    fn drop(&mut self) {
        if !self.retired.swap(true, Ordering::AcqRel) {
            self.shared.live.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

pub struct WorkerPool {
    name: String,
    config: ScalingConfig,
    policy: ScalingPolicy,
    worker: Arc<dyn Worker>,
    sampler: Arc<dyn LoadSampler>,
    shared: Arc<PoolShared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    scaler: Mutex<Option<JoinHandle<()>>>,
    scaler_stop: CancellationToken,
    history: Mutex<VecDeque<f64>>,
    last_processed: AtomicU64,
    next_worker_id: AtomicUsize,
}

impl WorkerPool {
    /// Build a pool. `cancel` is the run-wide stop signal; the pool derives
    /// its own child token from it.
    pub fn new(
        name: impl Into<String>,
        worker: Arc<dyn Worker>,
        config: ScalingConfig,
        sampler: Arc<dyn LoadSampler>,
        cancel: &CancellationToken,
    ) -> Arc<Self> {
        let name = name.into();
        let config = config.normalized();
        let cancel = cancel.child_token();
        Arc::new(Self {
            policy: ScalingPolicy::from(&config),
            shared: Arc::new(PoolShared {
                target: AtomicUsize::new(0),
                live: AtomicUsize::new(0),
                processed: AtomicU64::new(0),
                draining: AtomicBool::new(false),
                cancel: cancel.clone(),
            }),
            scaler_stop: cancel.child_token(),
            name,
            config,
            worker,
            sampler,
            handles: Mutex::new(Vec::new()),
            scaler: Mutex::new(None),
            history: Mutex::new(VecDeque::new()),
            last_processed: AtomicU64::new(0),
            next_worker_id: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ScalingConfig {
        &self.config
    }

    /// Launch `min_workers` workers and the auto-scaling task.
    pub fn start(self: &Arc<Self>) {
        info!(
            pool = %self.name,
            min_workers = self.config.min_workers,
            max_workers = self.config.max_workers,
            "starting worker pool"
        );
        for _ in 0..self.config.min_workers {
            self.add_worker();
        }

        let pool = Arc::clone(self);
        let span = tracing::info_span!("pool.autoscale", pool = %self.name);
        let handle = tokio::spawn(async move { pool.autoscale().await }.instrument(span));
        *self.scaler.lock() = Some(handle);
    }

    /// Launch one more worker if below `max_workers`.
    pub fn add_worker(&self) -> bool {
        if self.shared.draining.load(Ordering::Acquire) || self.shared.cancel.is_cancelled() {
            return false;
        }
        let max = self.config.max_workers;
        let grew = self
            .shared
            .target
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            });
        let Ok(previous) = grew else {
            return false;
        };

        self.shared.live.fetch_add(1, Ordering::AcqRel);
        let worker_id = self.next_worker_id.fetch_add(1, Ordering::Relaxed);
        let ctx = WorkerContext {
            worker_id,
            shared: Arc::clone(&self.shared),
            retired: Arc::new(AtomicBool::new(false)),
        };
        let worker = Arc::clone(&self.worker);
        let span = tracing::info_span!("pool.worker", pool = %self.name, worker_id);
        let handle = tokio::spawn(
            async move {
                let _slot = LiveSlot {
                    shared: Arc::clone(&ctx.shared),
                    retired: Arc::clone(&ctx.retired),
                };
                worker.run(ctx).await;
                debug!("worker exited");
            }
            .instrument(span),
        );
        self.handles.lock().push(handle);

        metrics::pool_size_changes().add(
            1,
            &[
                KeyValue::new("pool", self.name.clone()),
                KeyValue::new("direction", "up"),
            ],
        );
        info!(pool = %self.name, workers = previous + 1, "added worker");
        true
    }

    /// Lower the target by one if above `min_workers`. No worker is
    /// interrupted; a surplus worker exits after its current item.
    pub fn remove_worker(&self) -> bool {
        let min = self.config.min_workers;
        let shrunk = self
            .shared
            .target
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n > min).then(|| n - 1)
            });
        let Ok(previous) = shrunk else {
            return false;
        };

        metrics::pool_size_changes().add(
            1,
            &[
                KeyValue::new("pool", self.name.clone()),
                KeyValue::new("direction", "down"),
            ],
        );
        info!(pool = %self.name, workers = previous - 1, "removed worker");
        true
    }

    /// Target worker count.
    pub fn active_workers(&self) -> usize {
        self.shared.target.load(Ordering::Acquire)
    }

    /// Workers whose tasks are still running.
    pub fn live_workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.shared.processed.load(Ordering::Relaxed)
    }

    /// Items processed since the previous call.
    pub fn calculate_throughput(&self) -> f64 {
        let now = self.processed();
        let before = self.last_processed.swap(now, Ordering::Relaxed);
        now.saturating_sub(before) as f64
    }

    pub fn throughput_history(&self) -> Vec<f64> {
        self.history.lock().iter().copied().collect()
    }

    /// Stop scaling, let workers drain their queue and wait for all of them.
    pub async fn stop(&self) {
        self.scaler_stop.cancel();
        let scaler = self.scaler.lock().take();
        if let Some(handle) = scaler {
            if let Err(e) = handle.await {
                warn!(pool = %self.name, error = %e, "auto-scaler task failed");
            }
        }

        self.shared.draining.store(true, Ordering::Release);
        loop {
            let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    warn!(pool = %self.name, error = %e, "worker task failed");
                }
            }
        }
        info!(pool = %self.name, processed = self.processed(), "worker pool stopped");
    }

    /// Cancel without draining, then wait like [`stop`](Self::stop).
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.stop().await;
    }

    /// One auto-scaling step: sample, record, decide, act.
    pub fn adjust(&self) -> ScalingDecision {
        let cpu = self.sampler.cpu_percent();
        let throughput = self.calculate_throughput();
        let history: Vec<f64> = {
            let mut history = self.history.lock();
            history.push_back(throughput);
            while history.len() > self.config.throughput_window {
                history.pop_front();
            }
            history.iter().copied().collect()
        };

        let decision = self.policy.decide(cpu, &history);
        debug!(pool = %self.name, cpu, throughput, ?decision, "auto-scale sample");
        match decision {
            ScalingDecision::Add => {
                self.add_worker();
            }
            ScalingDecision::Remove => {
                self.remove_worker();
            }
            ScalingDecision::Hold => {}
        }
        decision
    }

    async fn autoscale(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.adjustment_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = self.scaler_stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.adjust();
                }
            }
        }
    }
}
