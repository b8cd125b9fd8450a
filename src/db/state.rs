//! Postgres-backed pipeline state and run rows.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{PipelineRun, PipelineState, PipelineStatus, RunStatus};
use crate::state::store::{validate_pipeline_transition, validate_run_update};
use crate::state::{RunUpdate, StateStore, StateUpdate};

const RUN_COLUMNS: &str = "run_id, pipeline_name, start_time, end_time, status, records_processed, error_message, metadata";

#[async_trait]
impl StateStore for super::Db {
    async fn ensure_state(&self, pipeline: &str) -> Result<PipelineState> {
        sqlx::query(
            "INSERT INTO pipeline_state (pipeline_name, status) VALUES ($1, 'idle')
             ON CONFLICT (pipeline_name) DO NOTHING",
        )
        .bind(pipeline)
        .execute(&self.pool)
        .await?;

        let row: PipelineStateRow = sqlx::query_as(
            "SELECT pipeline_name, status, last_run_id, last_run_timestamp, last_processed_id, records_processed
             FROM pipeline_state WHERE pipeline_name = $1",
        )
        .bind(pipeline)
        .fetch_one(&self.pool)
        .await?;
        row.try_into_state()
    }

    async fn claim_run(&self, run: &PipelineRun) -> Result<bool> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO pipeline_state (pipeline_name, status) VALUES ($1, 'idle')
             ON CONFLICT (pipeline_name) DO NOTHING",
        )
        .bind(&run.pipeline_name)
        .execute(&mut *tx)
        .await?;

        // Optimistic claim: only succeeds if nobody else holds the pipeline.
        let claimed = sqlx::query(
            "UPDATE pipeline_state
             SET status = 'running', last_run_id = $2, last_run_timestamp = $3, updated_at = now()
             WHERE pipeline_name = $1 AND status <> 'running'",
        )
        .bind(&run.pipeline_name)
        .bind(run.run_id)
        .bind(run.start_time)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if claimed == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            "INSERT INTO pipeline_runs (run_id, pipeline_name, start_time, status, records_processed, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(run.run_id)
        .bind(&run.pipeline_name)
        .bind(run.start_time)
        .bind(run.status.to_string())
        .bind(run.records_processed)
        .bind(&run.metadata)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn update_state(&self, pipeline: &str, update: StateUpdate) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let current: Option<(String,)> = sqlx::query_as(
            "SELECT status FROM pipeline_state WHERE pipeline_name = $1 FOR UPDATE",
        )
        .bind(pipeline)
        .fetch_optional(&mut *tx)
        .await?;
        let Some((current,)) = current else {
            return Err(Error::NotFound(format!("pipeline '{pipeline}'")));
        };
        if let Some(to) = update.status {
            validate_pipeline_transition(current.parse::<PipelineStatus>()?, to)?;
        }

        sqlx::query(
            "UPDATE pipeline_state
             SET status = COALESCE($2, status),
                 last_processed_id = COALESCE($3, last_processed_id),
                 records_processed = COALESCE($4, records_processed),
                 updated_at = now()
             WHERE pipeline_name = $1",
        )
        .bind(pipeline)
        .bind(update.status.map(|s| s.to_string()))
        .bind(update.last_processed_id)
        .bind(update.records_processed)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn update_run(&self, run_id: Uuid, update: RunUpdate) -> Result<()> {
        // Only running rows are updated, so the status must be a legal exit.
        validate_run_update(RunStatus::Running, update.status)?;
        let status = update.status;
        let to = status.map(|s| s.to_string());
        let rows_affected = sqlx::query(
            "UPDATE pipeline_runs
             SET status = COALESCE($2, status),
                 end_time = COALESCE($3, end_time),
                 records_processed = COALESCE($4, records_processed),
                 error_message = COALESCE($5, error_message),
                 metadata = metadata || $6
             WHERE run_id = $1 AND status = 'running'",
        )
        .bind(run_id)
        .bind(&to)
        .bind(update.end_time)
        .bind(update.records_processed)
        .bind(update.error_message)
        .bind(&update.metadata)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if rows_affected == 0 {
            let run = self
                .get_run(run_id)
                .await?
                .ok_or_else(|| Error::NotFound(format!("run {run_id}")))?;
            validate_run_update(run.status, status)?;
            return Err(Error::Other(format!("run {run_id} changed while updating")));
        }
        Ok(())
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>> {
        let row: Option<PipelineRunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE run_id = $1"
        ))
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(PipelineRunRow::try_into_run).transpose()
    }

    async fn recent_runs(&self, pipeline: &str, limit: usize) -> Result<Vec<PipelineRun>> {
        let rows: Vec<PipelineRunRow> = sqlx::query_as(&format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs
             WHERE pipeline_name = $1
             ORDER BY start_time DESC
             LIMIT $2"
        ))
        .bind(pipeline)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(PipelineRunRow::try_into_run).collect()
    }
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct PipelineStateRow {
    pipeline_name: String,
    status: String,
    last_run_id: Option<Uuid>,
    last_run_timestamp: Option<DateTime<Utc>>,
    last_processed_id: Option<String>,
    records_processed: i64,
}

impl PipelineStateRow {
    fn try_into_state(self) -> Result<PipelineState> {
        Ok(PipelineState {
            pipeline_name: self.pipeline_name,
            status: self.status.parse()?,
            last_run_id: self.last_run_id,
            last_run_timestamp: self.last_run_timestamp,
            last_processed_id: self.last_processed_id,
            records_processed: self.records_processed,
        })
    }
}

#[derive(sqlx::FromRow)]
struct PipelineRunRow {
    run_id: Uuid,
    pipeline_name: String,
    start_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    status: String,
    records_processed: i64,
    error_message: Option<String>,
    metadata: serde_json::Value,
}

impl PipelineRunRow {
    fn try_into_run(self) -> Result<PipelineRun> {
        Ok(PipelineRun {
            run_id: self.run_id,
            pipeline_name: self.pipeline_name,
            start_time: self.start_time,
            end_time: self.end_time,
            status: self.status.parse()?,
            records_processed: self.records_processed,
            error_message: self.error_message,
            metadata: self.metadata,
        })
    }
}
