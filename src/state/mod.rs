//! Pipeline progress and run tracking.
//!
//! [`PipelineStateManager`] owns the lifecycle of one pipeline's runs: it
//! refuses to start a run while another is in flight, checkpoints the
//! resumption watermark, and finalizes each run exactly once.
//!
//! A run whose final write failed is released locally and remembered as
//! unfinalized. The next `start_run` (or `recover_abandoned_run`) fails it in
//! the store before claiming the pipeline again.

pub mod memory;
pub mod store;

use std::sync::Arc;

use chrono::Utc;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{PipelineRun, PipelineState, PipelineStatus, RunStatus};

pub use memory::MemoryStateStore;
pub use store::{RunUpdate, StateStore, StateUpdate};

#[derive(Debug, Clone)]
struct ActiveRun {
    run_id: Uuid,
    records_processed: i64,
    last_processed_id: Option<String>,
}

#[derive(Debug, Default)]
struct RunSlot {
    active: Option<ActiveRun>,
    /// Run this manager released without recording its outcome.
    unfinalized: Option<Uuid>,
}

pub struct PipelineStateManager {
    pipeline_name: String,
    store: Arc<dyn StateStore>,
    slot: Mutex<RunSlot>,
}

impl PipelineStateManager {
    pub fn new(pipeline_name: impl Into<String>, store: Arc<dyn StateStore>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            store,
            slot: Mutex::new(RunSlot::default()),
        }
    }

    pub fn pipeline_name(&self) -> &str {
        &self.pipeline_name
    }

    /// Current pipeline row, created `idle` on first call.
    pub async fn get_current_state(&self) -> Result<PipelineState> {
        self.store.ensure_state(&self.pipeline_name).await
    }

    /// Begin a run. Fails with [`Error::AlreadyRunning`] without writing
    /// anything if the pipeline is already running.
    pub async fn start_run(&self, metadata: Value) -> Result<Uuid> {
        let mut slot = self.slot.lock().await;
        if slot.active.is_some() {
            return Err(Error::AlreadyRunning {
                pipeline: self.pipeline_name.clone(),
            });
        }
        if let Some(run_id) = slot.unfinalized {
            self.release(
                Some(run_id),
                "run ended without its outcome being recorded",
            )
            .await?;
            slot.unfinalized = None;
        }

        let state = self.store.ensure_state(&self.pipeline_name).await?;
        let run = PipelineRun::start(&self.pipeline_name, metadata);
        if !self.store.claim_run(&run).await? {
            warn!(pipeline = %self.pipeline_name, "pipeline already running, not starting");
            return Err(Error::AlreadyRunning {
                pipeline: self.pipeline_name.clone(),
            });
        }

        slot.active = Some(ActiveRun {
            run_id: run.run_id,
            records_processed: 0,
            last_processed_id: state.last_processed_id,
        });
        info!(pipeline = %self.pipeline_name, run_id = %run.run_id, "started run");
        Ok(run.run_id)
    }

    /// Checkpoint: add `records_delta` to the run's count, move the watermark
    /// if `last_processed_id` is given, and merge `metadata_updates`.
    pub async fn update_progress(
        &self,
        records_delta: i64,
        last_processed_id: Option<String>,
        metadata_updates: Value,
    ) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let active = slot.active.as_mut().ok_or_else(|| self.no_active_run())?;

        active.records_processed += records_delta;
        if last_processed_id.is_some() {
            active.last_processed_id = last_processed_id;
        }

        self.store
            .update_run(
                active.run_id,
                RunUpdate {
                    records_processed: Some(active.records_processed),
                    metadata: metadata_updates,
                    ..RunUpdate::default()
                },
            )
            .await?;
        self.store
            .update_state(
                &self.pipeline_name,
                StateUpdate {
                    status: None,
                    last_processed_id: active.last_processed_id.clone(),
                    records_processed: Some(active.records_processed),
                },
            )
            .await
    }

    /// Finalize the run as completed and return the pipeline to `idle`.
    /// `records_processed` replaces the running count when given.
    pub async fn complete_run(
        &self,
        records_processed: Option<i64>,
        last_processed_id: Option<String>,
        metadata_updates: Value,
    ) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let mut active = slot.active.take().ok_or_else(|| self.no_active_run())?;

        if let Some(n) = records_processed {
            active.records_processed = n;
        }
        if last_processed_id.is_some() {
            active.last_processed_id = last_processed_id;
        }

        if let Err(e) = self.write_completion(&active, metadata_updates).await {
            // Still ours: the caller may record a failure instead.
            slot.active = Some(active);
            return Err(e);
        }

        info!(
            pipeline = %self.pipeline_name,
            run_id = %active.run_id,
            records_processed = active.records_processed,
            "completed run"
        );
        Ok(())
    }

    async fn write_completion(&self, active: &ActiveRun, metadata_updates: Value) -> Result<()> {
        self.store
            .update_run(
                active.run_id,
                RunUpdate {
                    status: Some(RunStatus::Completed),
                    end_time: Some(Utc::now()),
                    records_processed: Some(active.records_processed),
                    error_message: None,
                    metadata: metadata_updates,
                },
            )
            .await?;
        self.store
            .update_state(
                &self.pipeline_name,
                StateUpdate {
                    status: Some(PipelineStatus::Idle),
                    last_processed_id: active.last_processed_id.clone(),
                    records_processed: Some(active.records_processed),
                },
            )
            .await
    }

    /// Finalize the run as failed and put the pipeline in `error`. The
    /// message is stored verbatim and also under `metadata.error`.
    pub async fn fail_run(
        &self,
        error_message: &str,
        records_processed: Option<i64>,
        metadata_updates: Value,
    ) -> Result<()> {
        let mut slot = self.slot.lock().await;
        let mut active = slot.active.take().ok_or_else(|| self.no_active_run())?;

        if let Some(n) = records_processed {
            active.records_processed = n;
        }

        error!(
            pipeline = %self.pipeline_name,
            run_id = %active.run_id,
            records_processed = active.records_processed,
            error = error_message,
            "run failed"
        );
        if let Err(e) = self.write_failure(&active, error_message, metadata_updates).await {
            warn!(
                pipeline = %self.pipeline_name,
                run_id = %active.run_id,
                error = %e,
                "could not record run failure, will retry before the next run"
            );
            slot.unfinalized = Some(active.run_id);
            return Err(e);
        }
        Ok(())
    }

    async fn write_failure(
        &self,
        active: &ActiveRun,
        error_message: &str,
        metadata_updates: Value,
    ) -> Result<()> {
        let mut metadata = metadata_updates;
        crate::model::pipeline::merge_metadata(
            &mut metadata,
            json!({
                "error": {
                    "message": error_message,
                    "timestamp": Utc::now().to_rfc3339(),
                }
            }),
        );

        self.store
            .update_run(
                active.run_id,
                RunUpdate {
                    status: Some(RunStatus::Failed),
                    end_time: Some(Utc::now()),
                    records_processed: Some(active.records_processed),
                    error_message: Some(error_message.to_string()),
                    metadata,
                },
            )
            .await?;
        self.store
            .update_state(
                &self.pipeline_name,
                StateUpdate {
                    status: Some(PipelineStatus::Error),
                    last_processed_id: None,
                    records_processed: Some(active.records_processed),
                },
            )
            .await
    }

    pub async fn is_pipeline_running(&self) -> Result<bool> {
        Ok(self.get_current_state().await?.status == PipelineStatus::Running)
    }

    /// The resumption watermark.
    pub async fn get_last_processed_id(&self) -> Result<Option<String>> {
        Ok(self.get_current_state().await?.last_processed_id)
    }

    /// Most recent runs first.
    pub async fn get_pipeline_history(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        self.store.recent_runs(&self.pipeline_name, limit).await
    }

    /// Id of the run started by this manager, if one is in flight.
    pub async fn current_run_id(&self) -> Option<Uuid> {
        self.slot.lock().await.active.as_ref().map(|a| a.run_id)
    }

    /// Run this manager gave up on without recording its outcome. The store
    /// still shows it `running` until the next start or recovery.
    pub async fn unfinalized_run(&self) -> Option<Uuid> {
        self.slot.lock().await.unfinalized
    }

    /// Release a pipeline left `running` by a process that died mid-run.
    ///
    /// Fails the orphaned run (if it is still `running`) and moves the
    /// pipeline to `error`. Returns the orphaned run id, or `None` if the
    /// pipeline was not stuck. Refuses while this manager has a live run.
    pub async fn recover_abandoned_run(&self, reason: &str) -> Result<Option<Uuid>> {
        let mut slot = self.slot.lock().await;
        if slot.active.is_some() {
            return Err(Error::AlreadyRunning {
                pipeline: self.pipeline_name.clone(),
            });
        }
        let recovered = self.release(None, reason).await?;
        slot.unfinalized = None;
        Ok(recovered)
    }

    /// Fail the run the store still shows `running` and move the pipeline to
    /// `error`. With `expected`, only that run is released.
    async fn release(&self, expected: Option<Uuid>, reason: &str) -> Result<Option<Uuid>> {
        let state = self.store.ensure_state(&self.pipeline_name).await?;
        if state.status != PipelineStatus::Running {
            return Ok(None);
        }
        if expected.is_some() && state.last_run_id != expected {
            return Ok(None);
        }

        if let Some(run_id) = state.last_run_id {
            let still_running = self
                .store
                .get_run(run_id)
                .await?
                .is_some_and(|run| !run.status.is_terminal());
            if still_running {
                self.store
                    .update_run(
                        run_id,
                        RunUpdate {
                            status: Some(RunStatus::Failed),
                            end_time: Some(Utc::now()),
                            error_message: Some(reason.to_string()),
                            metadata: json!({
                                "error": {
                                    "message": reason,
                                    "timestamp": Utc::now().to_rfc3339(),
                                }
                            }),
                            ..RunUpdate::default()
                        },
                    )
                    .await?;
            }
        }
        self.store
            .update_state(
                &self.pipeline_name,
                StateUpdate {
                    status: Some(PipelineStatus::Error),
                    ..StateUpdate::default()
                },
            )
            .await?;

        warn!(
            pipeline = %self.pipeline_name,
            run_id = ?state.last_run_id,
            "recovered abandoned run"
        );
        Ok(state.last_run_id)
    }

    fn no_active_run(&self) -> Error {
        Error::NoActiveRun {
            pipeline: self.pipeline_name.clone(),
        }
    }
}
