//! Row-store abstraction behind the state manager.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{PipelineRun, PipelineState, PipelineStatus, RunStatus};

/// Partial update of a `pipeline_state` row. `None` leaves a column as is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateUpdate {
    pub status: Option<PipelineStatus>,
    pub last_processed_id: Option<String>,
    pub records_processed: Option<i64>,
}

/// Partial update of a `pipeline_runs` row. `metadata` is shallow-merged
/// into the stored object.
#[derive(Debug, Clone, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub end_time: Option<DateTime<Utc>>,
    pub records_processed: Option<i64>,
    pub error_message: Option<String>,
    pub metadata: serde_json::Value,
}

impl Default for RunUpdate {
    fn default() -> Self {
        Self {
            status: None,
            end_time: None,
            records_processed: None,
            error_message: None,
            metadata: serde_json::Value::Object(Default::default()),
        }
    }
}

/// Persistence for pipeline and run rows.
///
/// Implementations must make `claim_run` atomic: flipping the pipeline to
/// `running` and inserting the run row happen together or not at all.
/// `update_run` only touches runs still in `running`; a finalized run is
/// immutable and the call fails with `InvalidTransition`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Fetch the pipeline row, creating it `idle` if absent.
    async fn ensure_state(&self, pipeline: &str) -> Result<PipelineState>;

    /// Mark the pipeline running and insert `run`. `Ok(false)` if the
    /// pipeline was already running; nothing is written in that case.
    async fn claim_run(&self, run: &PipelineRun) -> Result<bool>;

    async fn update_state(&self, pipeline: &str, update: StateUpdate) -> Result<()>;

    async fn update_run(&self, run_id: Uuid, update: RunUpdate) -> Result<()>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>>;

    /// Most recent runs first.
    async fn recent_runs(&self, pipeline: &str, limit: usize) -> Result<Vec<PipelineRun>>;
}

/// Check a pipeline status change against the transition table.
pub(crate) fn validate_pipeline_transition(
    from: PipelineStatus,
    to: PipelineStatus,
) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Check a run update against the run's current status. Any update to a
/// terminal run is refused; a status change must be a legal exit.
pub(crate) fn validate_run_update(from: RunStatus, to: Option<RunStatus>) -> Result<()> {
    let allowed = match to {
        Some(to) => from.can_transition_to(to),
        None => !from.is_terminal(),
    };
    if allowed {
        Ok(())
    } else {
        Err(Error::InvalidTransition {
            from: from.to_string(),
            to: to.unwrap_or(from).to_string(),
        })
    }
}
