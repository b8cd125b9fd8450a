//! The staged enrichment pipeline.
//!
//! One run moves through `fetching -> draining -> writing` and ends
//! `completed` or `failed`. Fetching pages the source from the stored
//! watermark, drops ids the dedup cache has already seen, and fans every new
//! record out to each stage whose gate admits it. Stage pools feed a single
//! writer. Draining sends one stop marker per stage queue and waits for the
//! pools; writing waits for the writer to flush its tail.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, error, info, warn};
use uuid::Uuid;

use super::watermark::{self, Tagged, WatermarkTracker};
use super::writer::Writer;
use crate::cache::DedupCache;
use crate::error::{Error, Result};
use crate::model::WorkItem;
use crate::pool::stage::panic_message;
use crate::pool::{ItemHandler, LoadSampler, StageWorker, SystemCpuSampler, WorkerPool};
use crate::queue::StageQueue;
use crate::sink::RecordSink;
use crate::source::RecordSource;
use crate::stage::{Enricher, StageSpec};
use crate::state::PipelineStateManager;
use crate::telemetry::metrics;
use crate::telemetry::run::{record_phase, start_run_span, start_stage_span};

/// Hook applied to each new record before routing, e.g. to classify it so
/// stage gates can read the result.
pub type Preparer = Arc<dyn Fn(WorkItem) -> WorkItem + Send + Sync>;

/// Run-level knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub pipeline_name: String,
    /// Page size requested from the source.
    pub records_per_page: usize,
    /// Default bound on new records queued per run.
    pub max_records_per_run: usize,
    /// Writer batch size.
    pub write_batch_size: usize,
    /// Bounded dequeue wait for stage workers and the writer.
    pub poll_interval: Duration,
    /// Records missing any of these fields are dropped before routing.
    pub required_fields: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "main".to_string(),
            records_per_page: 1000,
            max_records_per_run: 5000,
            write_batch_size: 100,
            poll_interval: Duration::from_secs(1),
            required_fields: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    Fetching,
    Draining,
    Writing,
    Completed,
    Failed,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunPhase::Idle => "idle",
            RunPhase::Fetching => "fetching",
            RunPhase::Draining => "draining",
            RunPhase::Writing => "writing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Per-run counters, stored in the run's metadata on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    pub pages: u64,
    pub fetched: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub queued: u64,
    pub routed: BTreeMap<String, u64>,
    pub gated_out: BTreeMap<String, u64>,
    pub dropped: u64,
    pub timed_out: u64,
    pub written: u64,
    pub last_processed_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { run_id: Uuid, stats: RunStats },
    Failed { run_id: Uuid, error: String, stats: RunStats },
    /// Another run held the pipeline.
    Skipped,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed { .. })
    }

    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            RunOutcome::Completed { run_id, .. } | RunOutcome::Failed { run_id, .. } => {
                Some(*run_id)
            }
            RunOutcome::Skipped => None,
        }
    }

    pub fn stats(&self) -> Option<&RunStats> {
        match self {
            RunOutcome::Completed { stats, .. } | RunOutcome::Failed { stats, .. } => Some(stats),
            RunOutcome::Skipped => None,
        }
    }
}

#[derive(Default)]
struct StageCounters {
    dropped: AtomicU64,
    timed_out: AtomicU64,
}

/// Runs one stage's enricher on a tagged record and forwards the result.
struct EnrichHandler {
    stage: String,
    enricher: Arc<dyn Enricher>,
    item_timeout: Option<Duration>,
    output: Arc<StageQueue<Tagged>>,
    tracker: Arc<WatermarkTracker>,
    counters: Arc<StageCounters>,
}

#[async_trait]
impl ItemHandler<Tagged> for EnrichHandler {
    async fn handle(&self, tagged: Tagged) -> Result<()> {
        let Tagged { page, item } = tagged;
        let id = item.id().to_string();

        let unenriched = self.item_timeout.map(|_| item.clone());
        // A panicking enricher drops the record like any other enrichment error.
        let enrich = AssertUnwindSafe(self.enricher.enrich(item))
            .catch_unwind()
            .map(|caught| {
                caught.unwrap_or_else(|payload| Err(Error::Other(panic_message(payload.as_ref()))))
            });

        let result = match (self.item_timeout, unenriched) {
            (Some(limit), Some(unenriched)) => {
                match tokio::time::timeout(limit, enrich).await {
                    Ok(result) => result,
                    Err(_) => {
                        warn!(stage = %self.stage, record = %id, "enrichment timed out, forwarding unenriched");
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        metrics::stage_timeouts()
                            .add(1, &[KeyValue::new("stage", self.stage.clone())]);
                        Ok(unenriched)
                    }
                }
            }
            _ => enrich.await,
        };

        match result {
            Ok(enriched) => {
                self.output.put(Tagged {
                    page,
                    item: enriched,
                });
                Ok(())
            }
            Err(e) => {
                self.tracker.resolve(page, 1);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                Err(Error::collaborator(
                    self.stage.clone(),
                    format!("record {id}: {e}"),
                ))
            }
        }
    }
}

struct RunningStage {
    spec: StageSpec,
    queue: Arc<StageQueue<Tagged>>,
    pool: Arc<WorkerPool>,
}

/// Composes source, dedup cache, stage pools, writer and state manager.
pub struct Orchestrator {
    config: PipelineConfig,
    source: Arc<dyn RecordSource>,
    sink: Arc<dyn RecordSink>,
    stages: Vec<StageSpec>,
    cache: Arc<DedupCache<Uuid>>,
    state: Arc<PipelineStateManager>,
    sampler: Arc<dyn LoadSampler>,
    prepare: Option<Preparer>,
}

impl Orchestrator {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn RecordSource>,
        sink: Arc<dyn RecordSink>,
        cache: Arc<DedupCache<Uuid>>,
        state: Arc<PipelineStateManager>,
    ) -> Self {
        Self {
            config,
            source,
            sink,
            stages: Vec::new(),
            cache,
            state,
            sampler: Arc::new(SystemCpuSampler::new()),
            prepare: None,
        }
    }

    pub fn with_stage(mut self, stage: StageSpec) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn LoadSampler>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn with_preparer<F>(mut self, prepare: F) -> Self
    where
        F: Fn(WorkItem) -> WorkItem + Send + Sync + 'static,
    {
        self.prepare = Some(Arc::new(prepare));
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn state(&self) -> &Arc<PipelineStateManager> {
        &self.state
    }

    pub fn cache(&self) -> &Arc<DedupCache<Uuid>> {
        &self.cache
    }

    /// Execute one run. Returns `Skipped` if another run holds the pipeline;
    /// errors only if the run could not be started or its failure could not
    /// be recorded.
    pub async fn run(
        &self,
        max_records: Option<usize>,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let max_records = max_records.unwrap_or(self.config.max_records_per_run);
        let resume_from = self.state.get_last_processed_id().await?;

        let run_id = match self
            .state
            .start_run(json!({
                "max_records": max_records,
                "start_time": Utc::now().to_rfc3339(),
                "last_processed_id": resume_from,
            }))
            .await
        {
            Ok(run_id) => run_id,
            Err(Error::AlreadyRunning { pipeline }) => {
                warn!(pipeline = %pipeline, "pipeline is already running, skipping");
                metrics::run_outcomes().add(
                    1,
                    &[
                        KeyValue::new("pipeline", pipeline),
                        KeyValue::new("outcome", "skipped"),
                    ],
                );
                return Ok(RunOutcome::Skipped);
            }
            Err(e) => return Err(e),
        };

        let span = start_run_span(&self.config.pipeline_name, &run_id);
        self.execute_run(run_id, resume_from, max_records, cancel, span.clone())
            .instrument(span)
            .await
    }

    async fn execute_run(
        &self,
        run_id: Uuid,
        resume_from: Option<String>,
        max_records: usize,
        cancel: &CancellationToken,
        span: Span,
    ) -> Result<RunOutcome> {
        info!(run_id = %run_id, resume_from = ?resume_from, max_records, "started pipeline run");
        let run_cancel = cancel.child_token();
        let tracker = Arc::new(WatermarkTracker::new());
        let output = Arc::new(StageQueue::<Tagged>::new("writer"));
        let counters = Arc::new(StageCounters::default());
        let mut stats = RunStats::default();

        let stages = self.start_stages(&output, &tracker, &counters, &run_cancel);

        let writer = Writer::new(
            Arc::clone(&self.sink),
            Arc::clone(&output),
            Arc::clone(&tracker),
            Arc::clone(&self.state),
            self.config.write_batch_size,
            run_cancel.clone(),
        )
        .with_poll_interval(self.config.poll_interval);
        let written = writer.written();
        let writer_task = tokio::spawn(writer.run().instrument(tracing::info_span!("writer")));

        record_phase(&span, RunPhase::Idle, RunPhase::Fetching);
        let fetched = self
            .fetch(
                run_id,
                resume_from,
                max_records,
                &stages,
                &tracker,
                &mut stats,
                &run_cancel,
            )
            .await;
        if fetched.is_err() {
            run_cancel.cancel();
        }

        record_phase(&span, RunPhase::Fetching, RunPhase::Draining);
        for stage in &stages {
            stage.queue.stop();
        }
        for stage in &stages {
            stage.pool.stop().await;
        }
        output.stop();

        record_phase(&span, RunPhase::Draining, RunPhase::Writing);
        let writer_result = match writer_task.await {
            Ok(result) => result,
            Err(e) => Err(Error::Other(format!("writer task failed: {e}"))),
        };

        stats.written = written.load(Ordering::Relaxed);
        stats.dropped = counters.dropped.load(Ordering::Relaxed);
        stats.timed_out = counters.timed_out.load(Ordering::Relaxed);

        // The writer's error explains a cancelled fetch, so it wins.
        let outcome = match (writer_result, fetched) {
            (Err(e), _) | (Ok(_), Err(e)) => Err(e),
            (Ok(_), Ok(())) => match watermark::checkpoint(&tracker, &self.state).await {
                Err(e) => Err(e),
                // Cancelled workers leave deliveries behind; those pages were
                // never written and must not count as done.
                Ok(_) => match tracker.pending_pages() {
                    0 => Ok(()),
                    n if run_cancel.is_cancelled() => Err(Error::Other(format!(
                        "run cancelled with {n} page(s) not fully written"
                    ))),
                    n => Err(Error::Other(format!(
                        "{n} page(s) not fully written when the run ended"
                    ))),
                },
            },
        };
        let outcome = match outcome {
            Ok(()) => self.state.get_last_processed_id().await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(last_processed_id) => {
                stats.last_processed_id = last_processed_id;
                self.finish_completed(run_id, stats, &span).await
            }
            Err(e) => {
                // Ids scheduled on pages that never reached a checkpoint must
                // be fetchable again by the next run.
                for id in tracker.unfinished_ids() {
                    self.cache.delete(&id);
                }
                stats.last_processed_id = self.state.get_last_processed_id().await.ok().flatten();
                self.finish_failed(run_id, e, stats, &span).await
            }
        }
    }

    fn start_stages(
        &self,
        output: &Arc<StageQueue<Tagged>>,
        tracker: &Arc<WatermarkTracker>,
        counters: &Arc<StageCounters>,
        cancel: &CancellationToken,
    ) -> Vec<RunningStage> {
        self.stages
            .iter()
            .map(|spec| {
                let queue = Arc::new(StageQueue::new(spec.name.clone()));
                let handler: Arc<dyn ItemHandler<Tagged>> = Arc::new(EnrichHandler {
                    stage: spec.name.clone(),
                    enricher: Arc::clone(&spec.enricher),
                    item_timeout: spec.item_timeout,
                    output: Arc::clone(output),
                    tracker: Arc::clone(tracker),
                    counters: Arc::clone(counters),
                });
                let worker = StageWorker::new(spec.name.clone(), Arc::clone(&queue), handler)
                    .with_poll_interval(self.config.poll_interval);
                let pool = WorkerPool::new(
                    spec.name.clone(),
                    Arc::new(worker),
                    spec.scaling.clone(),
                    Arc::clone(&self.sampler),
                    cancel,
                );
                {
                    let _entered = start_stage_span(&spec.name).entered();
                    pool.start();
                }
                RunningStage {
                    spec: spec.clone(),
                    queue,
                    pool,
                }
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    async fn fetch(
        &self,
        run_id: Uuid,
        resume_from: Option<String>,
        max_records: usize,
        stages: &[RunningStage],
        tracker: &WatermarkTracker,
        stats: &mut RunStats,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut cursor = resume_from;
        let pipeline = self.config.pipeline_name.clone();

        while (stats.queued as usize) < max_records {
            if cancel.is_cancelled() {
                return Err(Error::Other("run cancelled".to_string()));
            }

            let remaining = max_records - stats.queued as usize;
            let limit = self.config.records_per_page.min(remaining).max(1);
            let page = self
                .source
                .fetch_page(cursor.as_deref(), limit)
                .await
                .map_err(|e| Error::collaborator("source", e))?;
            if page.items.is_empty() {
                debug!("source returned an empty page");
                break;
            }
            stats.pages += 1;
            stats.fetched += page.items.len() as u64;
            metrics::records_fetched().add(
                page.items.len() as u64,
                &[KeyValue::new("pipeline", pipeline.clone())],
            );

            let last_id = page.last_id().map(str::to_string);
            let ids: Vec<&str> = page.items.iter().map(WorkItem::id).collect();
            let fresh = self.cache.mark_scheduled(&ids, run_id);
            let duplicates = page.items.len() - fresh.len();
            stats.duplicates += duplicates as u64;
            if duplicates > 0 {
                metrics::records_deduplicated().add(
                    duplicates as u64,
                    &[KeyValue::new("pipeline", pipeline.clone())],
                );
            }

            // Keep only the first copy of each fresh id, in page order.
            let mut wanted: std::collections::HashSet<&str> =
                fresh.iter().map(String::as_str).collect();
            let mut scheduled: Vec<WorkItem> = Vec::with_capacity(fresh.len());
            for item in page.items.iter() {
                if wanted.remove(item.id()) {
                    scheduled.push(item.clone());
                }
            }

            let mut routes: Vec<(WorkItem, Vec<usize>)> = Vec::with_capacity(scheduled.len());
            for item in scheduled {
                let item = match &self.prepare {
                    Some(prepare) => prepare(item),
                    None => item,
                };
                if let Some(missing) = self
                    .config
                    .required_fields
                    .iter()
                    .find(|f| item.get(f).is_none_or(|v| v.is_null()))
                {
                    debug!(record = %item.id(), field = %missing, "record missing required field, dropping");
                    stats.rejected += 1;
                    continue;
                }
                let targets: Vec<usize> = stages
                    .iter()
                    .enumerate()
                    .filter_map(|(i, stage)| {
                        let admitted = stage.spec.admits(&item);
                        let name = stage.spec.name.clone();
                        if admitted {
                            *stats.routed.entry(name).or_default() += 1;
                        } else {
                            *stats.gated_out.entry(name).or_default() += 1;
                        }
                        admitted.then_some(i)
                    })
                    .collect();
                routes.push((item, targets));
            }

            let deliveries: usize = routes.iter().map(|(_, t)| t.len()).sum();
            let page_no = tracker.register_page(last_id.clone(), fresh.clone(), deliveries);
            for (item, targets) in routes {
                // Each stage owns its own copy; the last one takes the original.
                let Some((&last, rest)) = targets.split_last() else {
                    continue;
                };
                for &i in rest {
                    self.dispatch(&stages[i], page_no, item.clone());
                }
                self.dispatch(&stages[last], page_no, item);
            }

            stats.queued += fresh.len() as u64;
            info!(
                page = page_no,
                fetched = page.items.len(),
                queued = fresh.len(),
                total_queued = stats.queued,
                "fetched page"
            );

            cursor = match page.next_cursor {
                Some(next) => Some(next),
                None => {
                    info!("no more records to fetch");
                    break;
                }
            };
        }
        Ok(())
    }

    fn dispatch(&self, stage: &RunningStage, page: u64, item: WorkItem) {
        metrics::records_routed().add(1, &[KeyValue::new("stage", stage.spec.name.clone())]);
        stage.queue.put(Tagged { page, item });
    }

    async fn finish_completed(
        &self,
        run_id: Uuid,
        stats: RunStats,
        span: &Span,
    ) -> Result<RunOutcome> {
        let metadata = json!({
            "end_time": Utc::now().to_rfc3339(),
            "phase": RunPhase::Completed,
            "stats": stats,
        });
        if let Err(e) = self.state.complete_run(None, None, metadata).await {
            error!(run_id = %run_id, error = %e, "failed to record run completion");
            return self.finish_failed(run_id, e, stats, span).await;
        }
        record_phase(span, RunPhase::Writing, RunPhase::Completed);
        metrics::run_outcomes().add(
            1,
            &[
                KeyValue::new("pipeline", self.config.pipeline_name.clone()),
                KeyValue::new("outcome", "completed"),
            ],
        );
        info!(
            run_id = %run_id,
            queued = stats.queued,
            written = stats.written,
            "pipeline run completed"
        );
        Ok(RunOutcome::Completed { run_id, stats })
    }

    async fn finish_failed(
        &self,
        run_id: Uuid,
        error: Error,
        stats: RunStats,
        span: &Span,
    ) -> Result<RunOutcome> {
        let message = error.to_string();
        record_phase(span, RunPhase::Writing, RunPhase::Failed);
        self.state
            .fail_run(
                &message,
                None,
                json!({
                    "end_time": Utc::now().to_rfc3339(),
                    "phase": RunPhase::Failed,
                    "stats": stats,
                }),
            )
            .await?;
        metrics::run_outcomes().add(
            1,
            &[
                KeyValue::new("pipeline", self.config.pipeline_name.clone()),
                KeyValue::new("outcome", "failed"),
            ],
        );
        Ok(RunOutcome::Failed {
            run_id,
            error: message,
            stats,
        })
    }
}
