//! Pipeline progress and run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

// ---------------------------------------------------------------------------
// Pipeline status
// ---------------------------------------------------------------------------

/// Status of a pipeline as a whole. One row per pipeline name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// No run in flight. Also the status after a successful run.
    Idle,
    /// A run holds the pipeline.
    Running,
    /// The last run failed. A new run may start.
    Error,
}

impl PipelineStatus {
    pub fn can_transition_to(self, to: PipelineStatus) -> bool {
        use PipelineStatus::*;
        matches!(
            (self, to),
            (Idle, Running) | (Error, Running) | (Running, Idle) | (Running, Error)
        )
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineStatus::Idle => "idle",
            PipelineStatus::Running => "running",
            PipelineStatus::Error => "error",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "running" => Ok(Self::Running),
            "error" => Ok(Self::Error),
            _ => Err(Error::Other(format!("unknown pipeline status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Lifecycle of a single run. Completed and failed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        matches!(
            (self, to),
            (RunStatus::Running, RunStatus::Completed) | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(Error::Other(format!("unknown run status: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// Pipeline-level progress. Created idle on first reference, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_name: String,
    pub status: PipelineStatus,
    pub last_run_id: Option<Uuid>,
    pub last_run_timestamp: Option<DateTime<Utc>>,
    /// Resumption watermark: id of the last record known to be persisted.
    pub last_processed_id: Option<String>,
    pub records_processed: i64,
}

impl PipelineState {
    pub fn idle(pipeline_name: impl Into<String>) -> Self {
        Self {
            pipeline_name: pipeline_name.into(),
            status: PipelineStatus::Idle,
            last_run_id: None,
            last_run_timestamp: None,
            last_processed_id: None,
            records_processed: 0,
        }
    }
}

/// One invocation of the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: Uuid,
    pub pipeline_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub records_processed: i64,
    pub error_message: Option<String>,
    /// Opaque JSON object, merged shallowly on every update.
    pub metadata: serde_json::Value,
}

impl PipelineRun {
    pub fn start(pipeline_name: impl Into<String>, metadata: serde_json::Value) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            pipeline_name: pipeline_name.into(),
            start_time: Utc::now(),
            end_time: None,
            status: RunStatus::Running,
            records_processed: 0,
            error_message: None,
            metadata: normalize_metadata(metadata),
        }
    }
}

/// Shallow-merge `updates` into `target`. Non-object values are replaced by
/// an empty object first so the column always holds a JSON object.
pub fn merge_metadata(target: &mut serde_json::Value, updates: serde_json::Value) {
    if !target.is_object() {
        *target = serde_json::Value::Object(Default::default());
    }
    if let (Some(dst), serde_json::Value::Object(src)) = (target.as_object_mut(), updates) {
        for (k, v) in src {
            dst.insert(k, v);
        }
    }
}

fn normalize_metadata(metadata: serde_json::Value) -> serde_json::Value {
    let mut out = serde_json::Value::Object(Default::default());
    merge_metadata(&mut out, metadata);
    out
}
