//! In-process [`StateStore`].

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use super::store::{
    RunUpdate, StateStore, StateUpdate, validate_pipeline_transition, validate_run_update,
};
use crate::error::{Error, Result};
use crate::model::pipeline::merge_metadata;
use crate::model::{PipelineRun, PipelineState, PipelineStatus};

#[derive(Default)]
struct Tables {
    states: HashMap<String, PipelineState>,
    runs: HashMap<Uuid, PipelineRun>,
}

/// State kept in memory. Survives across runs of one process, which is
/// enough for tests and dry runs.
#[derive(Default)]
pub struct MemoryStateStore {
    tables: Mutex<Tables>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.tables.lock().runs.len()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn ensure_state(&self, pipeline: &str) -> Result<PipelineState> {
        let mut tables = self.tables.lock();
        Ok(tables
            .states
            .entry(pipeline.to_string())
            .or_insert_with(|| PipelineState::idle(pipeline))
            .clone())
    }

    async fn claim_run(&self, run: &PipelineRun) -> Result<bool> {
        let mut tables = self.tables.lock();
        let state = tables
            .states
            .entry(run.pipeline_name.clone())
            .or_insert_with(|| PipelineState::idle(&run.pipeline_name));
        if !state.status.can_transition_to(PipelineStatus::Running) {
            return Ok(false);
        }
        state.status = PipelineStatus::Running;
        state.last_run_id = Some(run.run_id);
        state.last_run_timestamp = Some(run.start_time);
        tables.runs.insert(run.run_id, run.clone());
        Ok(true)
    }

    async fn update_state(&self, pipeline: &str, update: StateUpdate) -> Result<()> {
        let mut tables = self.tables.lock();
        let state = tables
            .states
            .get_mut(pipeline)
            .ok_or_else(|| Error::NotFound(format!("pipeline '{pipeline}'")))?;
        if let Some(status) = update.status {
            validate_pipeline_transition(state.status, status)?;
            state.status = status;
        }
        if let Some(id) = update.last_processed_id {
            state.last_processed_id = Some(id);
        }
        if let Some(n) = update.records_processed {
            state.records_processed = n;
        }
        Ok(())
    }

    async fn update_run(&self, run_id: Uuid, update: RunUpdate) -> Result<()> {
        let mut tables = self.tables.lock();
        let run = tables
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
        validate_run_update(run.status, update.status)?;
        if let Some(status) = update.status {
            run.status = status;
        }
        if let Some(end_time) = update.end_time {
            run.end_time = Some(end_time);
        }
        if let Some(n) = update.records_processed {
            run.records_processed = n;
        }
        if let Some(message) = update.error_message {
            run.error_message = Some(message);
        }
        merge_metadata(&mut run.metadata, update.metadata);
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        Ok(self.tables.lock().runs.get(&run_id).cloned())
    }

    async fn recent_runs(&self, pipeline: &str, limit: usize) -> Result<Vec<PipelineRun>> {
        let tables = self.tables.lock();
        let mut runs: Vec<PipelineRun> = tables
            .runs
            .values()
            .filter(|r| r.pipeline_name == pipeline)
            .cloned()
            .collect();
        runs.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        runs.truncate(limit);
        Ok(runs)
    }
}
