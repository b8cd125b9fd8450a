//! End-to-end runs against in-memory collaborators.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nbo_enrich::cache::{CacheConfig, DedupCache};
use nbo_enrich::engine::{Orchestrator, PipelineConfig, RunOutcome};
use nbo_enrich::error::{Error, Result};
use nbo_enrich::model::{PipelineStatus, RunStatus, WorkItem};
use nbo_enrich::pool::{FixedLoad, ScalingConfig};
use nbo_enrich::sink::{MemoryRecordSink, RecordSink};
use nbo_enrich::source::{MemorySource, Page, RecordSource};
use nbo_enrich::stage::{Enricher, StageSpec};
use nbo_enrich::state::{MemoryStateStore, PipelineStateManager, StateStore};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

struct AddField {
    field: &'static str,
    value: &'static str,
}

#[async_trait]
impl Enricher for AddField {
    async fn enrich(&self, item: WorkItem) -> Result<WorkItem> {
        Ok(item.with_field(self.field, self.value))
    }
}

struct FailOn(&'static str);

#[async_trait]
impl Enricher for FailOn {
    async fn enrich(&self, item: WorkItem) -> Result<WorkItem> {
        if item.id() == self.0 {
            return Err(Error::Other("upstream rejected record".into()));
        }
        Ok(item.with_field("checked", true))
    }
}

struct PanicOn(&'static str);

#[async_trait]
impl Enricher for PanicOn {
    async fn enrich(&self, item: WorkItem) -> Result<WorkItem> {
        if item.id() == self.0 {
            panic!("malformed record {}", item.id());
        }
        Ok(item.with_field("checked", true))
    }
}

struct Slow(Duration);

#[async_trait]
impl Enricher for Slow {
    async fn enrich(&self, item: WorkItem) -> Result<WorkItem> {
        tokio::time::sleep(self.0).await;
        Ok(item.with_field("slow", true))
    }
}

/// Rejects any batch containing `poison` until healed.
struct FlakySink {
    inner: MemoryRecordSink,
    poison: &'static str,
    healed: AtomicBool,
}

impl FlakySink {
    fn new(poison: &'static str) -> Self {
        Self {
            inner: MemoryRecordSink::new(),
            poison,
            healed: AtomicBool::new(false),
        }
    }

    fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn upsert_batch(&self, items: &[WorkItem]) -> Result<()> {
        if !self.healed.load(Ordering::SeqCst) && items.iter().any(|i| i.id() == self.poison) {
            return Err(Error::collaborator("sink", "connection reset by peer"));
        }
        self.inner.upsert_batch(items).await
    }
}

struct BrokenSource;

#[async_trait]
impl RecordSource for BrokenSource {
    async fn fetch_page(&self, _cursor: Option<&str>, _limit: usize) -> Result<Page> {
        Err(Error::Other("subscriber API returned 503".into()))
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn records(n: usize) -> Vec<WorkItem> {
    (1..=n)
        .map(|i| {
            WorkItem::new(format!("s{i:03}"))
                .with_field("email_address", format!("user{i}@example.com"))
                .with_field("has_referrer", i % 2 == 0)
        })
        .collect()
}

fn id(i: usize) -> String {
    format!("s{i:03}")
}

fn config(page: usize, batch: usize) -> PipelineConfig {
    PipelineConfig {
        records_per_page: page,
        write_batch_size: batch,
        poll_interval: Duration::from_millis(20),
        ..PipelineConfig::default()
    }
}

fn scaling(workers: usize) -> ScalingConfig {
    let mut scaling = ScalingConfig::with_bounds(workers, workers);
    scaling.adjustment_interval = Duration::from_secs(3600);
    scaling
}

fn stage(name: &str, enricher: Arc<dyn Enricher>, workers: usize) -> StageSpec {
    StageSpec::new(name, enricher).with_scaling(scaling(workers))
}

fn cache() -> Arc<DedupCache<Uuid>> {
    Arc::new(DedupCache::new(CacheConfig::default()))
}

fn manager(store: &Arc<MemoryStateStore>) -> Arc<PipelineStateManager> {
    Arc::new(PipelineStateManager::new("main", store.clone()))
}

fn orchestrator(
    config: PipelineConfig,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    cache: Arc<DedupCache<Uuid>>,
    state: Arc<PipelineStateManager>,
) -> Orchestrator {
    Orchestrator::new(config, source, sink, cache, state).with_sampler(Arc::new(FixedLoad(50.0)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_enriches_routes_and_checkpoints() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(4, 3),
        Arc::new(MemorySource::new(records(10))),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage(
        "location",
        Arc::new(AddField {
            field: "location_city",
            value: "Lisbon",
        }),
        2,
    ))
    .with_stage(
        stage(
            "referrer",
            Arc::new(AddField {
                field: "referrer_info",
                value: "newsletter",
            }),
            1,
        )
        .with_gate(|item| item.get("has_referrer") == Some(&json!(true))),
    );

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let RunOutcome::Completed { run_id, stats } = outcome else {
        panic!("run did not complete");
    };

    assert_eq!(stats.fetched, 10);
    assert_eq!(stats.queued, 10);
    assert_eq!(stats.duplicates, 0);
    assert_eq!(stats.routed["location"], 10);
    assert_eq!(stats.routed["referrer"], 5);
    assert_eq!(stats.gated_out["referrer"], 5);
    assert_eq!(stats.written, 15);
    assert_eq!(stats.last_processed_id.as_deref(), Some(id(10).as_str()));

    assert_eq!(sink.len(), 10);
    let even = sink.get(&id(2)).unwrap();
    assert_eq!(even.get_str("location_city"), Some("Lisbon"));
    assert_eq!(even.get_str("referrer_info"), Some("newsletter"));
    let odd = sink.get(&id(3)).unwrap();
    assert_eq!(odd.get_str("location_city"), Some("Lisbon"));
    assert!(odd.get("referrer_info").is_none());

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.records_processed, 10);
    assert_eq!(run.metadata["stats"]["routed"]["referrer"], 5);
    assert!(run.metadata.get("start_time").is_some());
    assert!(run.metadata.get("end_time").is_some());

    let current = state.get_current_state().await.unwrap();
    assert_eq!(current.last_processed_id.as_deref(), Some(id(10).as_str()));
    assert!(!state.is_pipeline_running().await.unwrap());
}

#[tokio::test]
async fn run_is_bounded_and_next_run_resumes() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(4, 5),
        Arc::new(MemorySource::new(records(25))),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage(
        "location",
        Arc::new(AddField {
            field: "location_city",
            value: "Porto",
        }),
        2,
    ));

    let first = orch.run(Some(10), &CancellationToken::new()).await.unwrap();
    assert_eq!(first.stats().unwrap().queued, 10);
    assert_eq!(
        state.get_last_processed_id().await.unwrap(),
        Some(id(10))
    );

    let second = orch.run(Some(10), &CancellationToken::new()).await.unwrap();
    assert!(second.is_success());
    assert_eq!(second.stats().unwrap().duplicates, 0);
    assert_eq!(
        state.get_last_processed_id().await.unwrap(),
        Some(id(20))
    );

    let third = orch.run(Some(10), &CancellationToken::new()).await.unwrap();
    assert_eq!(third.stats().unwrap().queued, 5);

    let expected: Vec<String> = (1..=25).map(id).collect();
    assert_eq!(sink.ids(), expected);
    assert_eq!(sink.write_log().len(), 25);
}

#[tokio::test]
async fn failed_run_resumes_without_rewriting_checkpointed_records() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let sink = Arc::new(FlakySink::new("s013"));
    let orch = orchestrator(
        config(5, 5),
        Arc::new(MemorySource::new(records(20))),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage(
        "location",
        Arc::new(AddField {
            field: "location_city",
            value: "Braga",
        }),
        1,
    ));

    let first = orch.run(None, &CancellationToken::new()).await.unwrap();
    let RunOutcome::Failed { run_id, error, .. } = first else {
        panic!("run should have failed");
    };
    assert!(error.contains("connection reset by peer"));
    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error_message.as_deref(), Some(error.as_str()));

    let watermark = state.get_last_processed_id().await.unwrap();
    assert!(watermark.as_deref() < Some(id(13).as_str()));
    assert!(!sink.inner.ids().contains(&id(13)));

    sink.heal();
    let second = orch.run(None, &CancellationToken::new()).await.unwrap();
    assert!(second.is_success(), "{second:?}");

    let expected: Vec<String> = (1..=20).map(id).collect();
    assert_eq!(sink.inner.ids(), expected);
    assert_eq!(
        state.get_last_processed_id().await.unwrap(),
        Some(id(20))
    );

    // Everything at or before the first run's watermark was written once.
    let log = sink.inner.write_log();
    for i in 1..=20 {
        let key = id(i);
        if watermark.as_deref().is_some_and(|w| key.as_str() <= w) {
            assert_eq!(log.iter().filter(|x| **x == key).count(), 1, "{key}");
        }
    }
}

#[tokio::test]
async fn concurrent_run_is_skipped_without_a_new_row() {
    let store = Arc::new(MemoryStateStore::new());
    let other = manager(&store);
    other.start_run(json!({})).await.unwrap();

    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(5, 5),
        Arc::new(MemorySource::new(records(5))),
        sink.clone(),
        cache(),
        manager(&store),
    );

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    assert_eq!(outcome, RunOutcome::Skipped);
    assert_eq!(store.run_count(), 1);
    assert!(sink.is_empty());
}

#[tokio::test]
async fn cache_skips_records_seen_by_an_earlier_run() {
    let shared = cache();
    let sink = Arc::new(MemoryRecordSink::new());
    let source: Arc<dyn RecordSource> = Arc::new(MemorySource::new(records(6)));
    let enricher: Arc<dyn Enricher> = Arc::new(AddField {
        field: "location_city",
        value: "Faro",
    });

    for round in 0..2 {
        // Fresh state each round: the watermark starts over, the cache does not.
        let store = Arc::new(MemoryStateStore::new());
        let orch = orchestrator(
            config(4, 4),
            Arc::clone(&source),
            sink.clone(),
            Arc::clone(&shared),
            manager(&store),
        )
        .with_stage(stage("location", Arc::clone(&enricher), 1));
        let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
        let stats = outcome.stats().unwrap();
        if round == 0 {
            assert_eq!(stats.queued, 6);
        } else {
            assert_eq!(stats.queued, 0);
            assert_eq!(stats.duplicates, 6);
            assert_eq!(stats.written, 0);
        }
    }
    assert_eq!(sink.write_log().len(), 6);
}

#[tokio::test]
async fn duplicate_ids_within_a_page_are_queued_once() {
    let mut items = records(3);
    items.insert(1, WorkItem::new(id(1)));
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(10, 10),
        Arc::new(MemorySource::new(items)),
        sink.clone(),
        cache(),
        manager(&Arc::new(MemoryStateStore::new())),
    )
    .with_stage(stage(
        "location",
        Arc::new(AddField {
            field: "location_city",
            value: "Evora",
        }),
        1,
    ));

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let stats = outcome.stats().unwrap();
    assert_eq!(stats.fetched, 4);
    assert_eq!(stats.queued, 3);
    assert_eq!(stats.duplicates, 1);
    assert_eq!(sink.write_log().len(), 3);
}

#[tokio::test]
async fn source_failure_is_recorded_verbatim() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let orch = orchestrator(
        config(5, 5),
        Arc::new(BrokenSource),
        Arc::new(MemoryRecordSink::new()),
        cache(),
        state.clone(),
    );

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let RunOutcome::Failed { run_id, error, .. } = outcome else {
        panic!("expected failure");
    };
    assert_eq!(error, "source: subscriber API returned 503");

    let run = store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.error_message.as_deref(), Some(error.as_str()));
    assert_eq!(run.metadata["error"]["message"], error.as_str());
    assert_eq!(
        state.get_current_state().await.unwrap().status,
        PipelineStatus::Error
    );

    // An errored pipeline can start again.
    let retry = orch.run(None, &CancellationToken::new()).await.unwrap();
    assert!(matches!(retry, RunOutcome::Failed { .. }));
    assert_eq!(store.run_count(), 2);
}

#[tokio::test]
async fn enricher_error_drops_the_record_from_that_stage_only() {
    let sink = Arc::new(MemoryRecordSink::new());
    let state = manager(&Arc::new(MemoryStateStore::new()));
    let orch = orchestrator(
        config(5, 5),
        Arc::new(MemorySource::new(records(5))),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage("validator", Arc::new(FailOn("s003")), 1))
    .with_stage(stage(
        "location",
        Arc::new(AddField {
            field: "location_city",
            value: "Coimbra",
        }),
        1,
    ));

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let stats = outcome.stats().unwrap().clone();
    assert!(outcome.is_success());
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.written, 9);

    let failed = sink.get(&id(3)).unwrap();
    assert_eq!(failed.get_str("location_city"), Some("Coimbra"));
    assert!(failed.get("checked").is_none());
    assert_eq!(
        state.get_last_processed_id().await.unwrap(),
        Some(id(5))
    );
}

#[tokio::test]
async fn timed_out_enrichment_is_forwarded_unenriched() {
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(5, 5),
        Arc::new(MemorySource::new(records(2))),
        sink.clone(),
        cache(),
        manager(&Arc::new(MemoryStateStore::new())),
    )
    .with_stage(
        stage("slow", Arc::new(Slow(Duration::from_secs(5))), 2)
            .with_item_timeout(Duration::from_millis(30)),
    );

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let stats = outcome.stats().unwrap();
    assert!(outcome.is_success());
    assert_eq!(stats.timed_out, 2);
    assert_eq!(sink.len(), 2);
    let item = sink.get(&id(1)).unwrap();
    assert!(item.get("slow").is_none());
    assert_eq!(item.get_str("email_address"), Some("user1@example.com"));
}

#[tokio::test]
async fn records_missing_required_fields_are_rejected() {
    let mut items = records(4);
    items[2] = WorkItem::new(id(3));
    let sink = Arc::new(MemoryRecordSink::new());
    let state = manager(&Arc::new(MemoryStateStore::new()));
    let orch = orchestrator(
        PipelineConfig {
            required_fields: vec!["email_address".to_string()],
            ..config(10, 10)
        },
        Arc::new(MemorySource::new(items)),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage(
        "location",
        Arc::new(AddField {
            field: "location_city",
            value: "Aveiro",
        }),
        1,
    ));

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let stats = outcome.stats().unwrap();
    assert_eq!(stats.rejected, 1);
    assert_eq!(sink.len(), 3);
    assert!(sink.get(&id(3)).is_none());
    assert_eq!(
        state.get_last_processed_id().await.unwrap(),
        Some(id(4))
    );
}

#[tokio::test]
async fn preparer_output_drives_gates() {
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(10, 10),
        Arc::new(MemorySource::new(records(4))),
        sink.clone(),
        cache(),
        manager(&Arc::new(MemoryStateStore::new())),
    )
    .with_preparer(|item| {
        let corporate = item
            .get_str("email_address")
            .is_some_and(|e| e.starts_with("user1") || e.starts_with("user2"));
        item.with_field("is_corporate", corporate)
    })
    .with_stage(
        stage(
            "company",
            Arc::new(AddField {
                field: "company_name",
                value: "Acme",
            }),
            1,
        )
        .with_gate(|item| item.get("is_corporate") == Some(&json!(true))),
    );

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let stats = outcome.stats().unwrap();
    assert_eq!(stats.routed["company"], 2);
    assert_eq!(stats.gated_out["company"], 2);
    let ids: HashSet<String> = sink.ids().into_iter().collect();
    assert_eq!(ids, HashSet::from([id(1), id(2)]));
}

#[tokio::test]
async fn cancelled_run_fails_and_releases_the_pipeline() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let orch = orchestrator(
        config(5, 5),
        Arc::new(MemorySource::new(records(5))),
        Arc::new(MemoryRecordSink::new()),
        cache(),
        state.clone(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let outcome = orch.run(None, &cancel).await.unwrap();
    assert!(matches!(outcome, RunOutcome::Failed { .. }));
    assert!(!state.is_pipeline_running().await.unwrap());
    // Nothing was checkpointed, so nothing stays marked in the cache.
    assert_eq!(orch.cache().size(), 0);
}

#[tokio::test]
async fn cancel_while_draining_fails_and_next_run_writes_everything() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(4, 1),
        Arc::new(MemorySource::new(records(4))),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage("slow", Arc::new(Slow(Duration::from_millis(200))), 1));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let first = orch.run(None, &cancel).await.unwrap();
    let RunOutcome::Failed { error, .. } = first else {
        panic!("cancelled run must not complete");
    };
    assert!(error.contains("cancelled"), "{error}");
    assert!(sink.len() < 4);
    assert!(state.get_last_processed_id().await.unwrap().is_none());

    let second = orch.run(None, &CancellationToken::new()).await.unwrap();
    let stats = second.stats().unwrap().clone();
    assert!(second.is_success());
    assert_eq!(stats.duplicates, 0);
    assert_eq!(sink.ids(), vec![id(1), id(2), id(3), id(4)]);
    assert_eq!(
        state.get_last_processed_id().await.unwrap().as_deref(),
        Some("s004")
    );
}

#[tokio::test]
async fn panicking_enricher_drops_one_record_and_keeps_the_stage_alive() {
    let store = Arc::new(MemoryStateStore::new());
    let state = manager(&store);
    let sink = Arc::new(MemoryRecordSink::new());
    let orch = orchestrator(
        config(5, 2),
        Arc::new(MemorySource::new(records(5))),
        sink.clone(),
        cache(),
        state.clone(),
    )
    .with_stage(stage("check", Arc::new(PanicOn("s002")), 1));

    let outcome = orch.run(None, &CancellationToken::new()).await.unwrap();
    let RunOutcome::Completed { stats, .. } = outcome else {
        panic!("run did not complete");
    };
    assert_eq!(stats.dropped, 1);
    assert_eq!(stats.written, 4);
    assert_eq!(sink.ids(), vec![id(1), id(3), id(4), id(5)]);
    assert!(!state.is_pipeline_running().await.unwrap());
}
