//! Worker pool and stage queue behavior under the stop-marker protocol.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nbo_enrich::error::Result;
use nbo_enrich::pool::{
    FixedLoad, ItemHandler, ScalingConfig, ScalingDecision, StageWorker, WorkerPool,
};
use nbo_enrich::queue::StageQueue;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collect {
    seen: Mutex<Vec<u32>>,
    delay: Duration,
}

#[async_trait]
impl ItemHandler<u32> for Collect {
    async fn handle(&self, item: u32) -> Result<()> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().push(item);
        Ok(())
    }
}

fn config(min: usize, max: usize) -> ScalingConfig {
    let mut config = ScalingConfig::with_bounds(min, max);
    config.adjustment_interval = Duration::from_secs(3600);
    config
}

fn stage_pool(
    queue: &Arc<StageQueue<u32>>,
    handler: Arc<Collect>,
    scaling: ScalingConfig,
    cpu: f32,
    cancel: &CancellationToken,
) -> Arc<WorkerPool> {
    let handler: Arc<dyn ItemHandler<u32>> = handler;
    let worker = StageWorker::new("test", Arc::clone(queue), handler)
        .with_poll_interval(Duration::from_millis(20));
    WorkerPool::new(
        "test",
        Arc::new(worker),
        scaling,
        Arc::new(FixedLoad(cpu)),
        cancel,
    )
}

#[tokio::test]
async fn two_workers_drain_five_items_and_consume_the_stop_marker() {
    let queue = Arc::new(StageQueue::new("test"));
    let handler = Arc::new(Collect::default());
    let pool = stage_pool(
        &queue,
        Arc::clone(&handler),
        config(2, 2),
        50.0,
        &CancellationToken::new(),
    );
    pool.start();
    assert_eq!(pool.active_workers(), 2);

    for i in 1..=5 {
        queue.put(i);
    }
    queue.stop();
    pool.stop().await;

    let mut seen = handler.seen.lock().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
    assert_eq!(pool.processed(), 5);
    assert_eq!(pool.live_workers(), 0);
    assert!(queue.is_empty());
}

#[tokio::test]
async fn stop_marker_reaches_every_worker() {
    let queue = Arc::new(StageQueue::new("test"));
    let handler = Arc::new(Collect {
        delay: Duration::from_millis(5),
        ..Collect::default()
    });
    let pool = stage_pool(
        &queue,
        Arc::clone(&handler),
        config(6, 6),
        50.0,
        &CancellationToken::new(),
    );
    pool.start();
    for i in 0..40 {
        queue.put(i);
    }
    queue.stop();

    // No drain flag: workers only leave through the relayed marker.
    for _ in 0..200 {
        if pool.live_workers() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.live_workers(), 0);
    assert!(queue.is_empty());
    assert_eq!(handler.seen.lock().len(), 40);
    pool.stop().await;
}

#[tokio::test]
async fn every_item_is_handled_exactly_once() {
    let queue = Arc::new(StageQueue::new("test"));
    let handler = Arc::new(Collect::default());
    let pool = stage_pool(
        &queue,
        Arc::clone(&handler),
        config(4, 4),
        50.0,
        &CancellationToken::new(),
    );
    pool.start();
    for i in 0..500 {
        queue.put(i);
    }
    queue.stop();
    pool.stop().await;

    let seen = handler.seen.lock();
    let distinct: HashSet<u32> = seen.iter().copied().collect();
    assert_eq!(seen.len(), 500);
    assert_eq!(distinct.len(), 500);
}

#[tokio::test]
async fn cancellation_stops_workers_without_draining() {
    let queue = Arc::new(StageQueue::new("test"));
    let handler = Arc::new(Collect {
        delay: Duration::from_millis(20),
        ..Collect::default()
    });
    let cancel = CancellationToken::new();
    let pool = stage_pool(&queue, Arc::clone(&handler), config(1, 1), 50.0, &cancel);
    pool.start();
    for i in 0..50 {
        queue.put(i);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    pool.stop().await;

    assert_eq!(pool.live_workers(), 0);
    assert!(handler.seen.lock().len() < 50);
    assert!(!queue.is_empty());
}

#[tokio::test]
async fn low_cpu_with_steady_throughput_grows_pool() {
    let queue = Arc::new(StageQueue::new("test"));
    let pool = stage_pool(
        &queue,
        Arc::new(Collect::default()),
        config(1, 3),
        10.0,
        &CancellationToken::new(),
    );
    pool.start();

    assert_eq!(pool.adjust(), ScalingDecision::Add);
    assert_eq!(pool.active_workers(), 2);
    assert_eq!(pool.adjust(), ScalingDecision::Add);
    assert_eq!(pool.active_workers(), 3);
    // At max: the decision stands but the pool does not grow.
    assert_eq!(pool.adjust(), ScalingDecision::Add);
    assert_eq!(pool.active_workers(), 3);

    queue.stop();
    pool.stop().await;
    assert!(!pool.add_worker());
}

#[tokio::test]
async fn high_cpu_shrinks_to_min() {
    let queue = Arc::new(StageQueue::new("test"));
    let pool = stage_pool(
        &queue,
        Arc::new(Collect::default()),
        config(1, 3),
        95.0,
        &CancellationToken::new(),
    );
    pool.start();
    pool.add_worker();
    pool.add_worker();

    assert_eq!(pool.adjust(), ScalingDecision::Remove);
    assert_eq!(pool.adjust(), ScalingDecision::Remove);
    assert_eq!(pool.adjust(), ScalingDecision::Remove);
    assert_eq!(pool.active_workers(), 1);

    for _ in 0..100 {
        if pool.live_workers() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(pool.live_workers(), 1);

    queue.stop();
    pool.stop().await;
    assert!(queue.is_empty());
}

#[tokio::test]
async fn shutdown_with_idle_queue_returns() {
    let queue: Arc<StageQueue<u32>> = Arc::new(StageQueue::new("test"));
    let pool = stage_pool(
        &queue,
        Arc::new(Collect::default()),
        config(3, 3),
        50.0,
        &CancellationToken::new(),
    );
    pool.start();
    tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
        .await
        .expect("shutdown hung");
    assert_eq!(pool.live_workers(), 0);
}

fn every_five_seconds(min: usize, max: usize) -> ScalingConfig {
    let mut config = ScalingConfig::with_bounds(min, max);
    config.adjustment_interval = Duration::from_secs(5);
    config
}

#[tokio::test(start_paused = true)]
async fn autoscaler_grows_idle_pool_on_its_cadence() {
    let queue = Arc::new(StageQueue::new("test"));
    let pool = stage_pool(
        &queue,
        Arc::new(Collect::default()),
        every_five_seconds(1, 3),
        5.0,
        &CancellationToken::new(),
    );
    pool.start();
    assert_eq!(pool.active_workers(), 1);

    tokio::time::sleep(Duration::from_millis(4_900)).await;
    assert_eq!(pool.active_workers(), 1);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(pool.active_workers(), 2);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.active_workers(), 3);
    assert_eq!(pool.throughput_history(), vec![0.0, 0.0]);

    queue.stop();
    pool.stop().await;
    assert_eq!(pool.live_workers(), 0);
}

#[tokio::test(start_paused = true)]
async fn autoscaler_shrinks_busy_pool_on_its_cadence() {
    let queue = Arc::new(StageQueue::new("test"));
    let pool = stage_pool(
        &queue,
        Arc::new(Collect::default()),
        every_five_seconds(1, 3),
        95.0,
        &CancellationToken::new(),
    );
    pool.start();
    pool.add_worker();
    pool.add_worker();
    assert_eq!(pool.live_workers(), 3);

    tokio::time::sleep(Duration::from_millis(5_100)).await;
    assert_eq!(pool.active_workers(), 2);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(pool.active_workers(), 1);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(pool.live_workers(), 1);

    queue.stop();
    pool.stop().await;
}
