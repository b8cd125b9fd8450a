//! Periodic pipeline invocation.
//!
//! Wakes on a fixed cadence, asks whether a batch is due and, if so, runs
//! the orchestrator. A batch is due when the pipeline is not running and at
//! least `interval` has passed since the last run started.
//!
//! The loop survives store outages: a run that could not be finalized is
//! released locally and failed in the store once it answers again.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, warn};

use super::orchestrator::{Orchestrator, RunOutcome};
use crate::error::Result;
use crate::model::PipelineStatus;

/// Configuration for the scheduler loop.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Minimum time between the starts of two runs.
    pub interval: Duration,
    /// Per-run bound on new records; `None` uses the pipeline default.
    pub max_records: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            max_records: None,
        }
    }
}

impl SchedulerConfig {
    /// How often the loop re-checks: a quarter of the interval, at most a
    /// minute, at least a second.
    pub fn check_interval(&self) -> Duration {
        (self.interval / 4).clamp(Duration::from_secs(1), Duration::from_secs(60))
    }
}

pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    config: SchedulerConfig,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, config: SchedulerConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the loop. Cancelling it also cancels a run in flight
    /// after its current items finish.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal the scheduler to shut down.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub async fn should_run_batch(&self) -> Result<bool> {
        self.should_run_batch_at(Utc::now()).await
    }

    pub async fn should_run_batch_at(&self, now: DateTime<Utc>) -> Result<bool> {
        let manager = self.orchestrator.state();
        let state = manager.get_current_state().await?;
        // A run of ours whose outcome never reached the store still shows
        // `running`; starting the next run releases it.
        if state.status == PipelineStatus::Running && manager.unfinalized_run().await.is_none() {
            info!(pipeline = %state.pipeline_name, "pipeline is already running, skipping batch");
            return Ok(false);
        }

        if let Some(last) = state.last_run_timestamp {
            // A timestamp in the future reads as zero elapsed.
            let elapsed = now
                .signed_duration_since(last)
                .to_std()
                .unwrap_or_default();
            if elapsed < self.config.interval {
                info!(
                    since_last_run_secs = elapsed.as_secs(),
                    interval_secs = self.config.interval.as_secs(),
                    "not enough time since last run"
                );
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Run one batch now, regardless of timing.
    pub async fn run_batch(&self) -> Result<RunOutcome> {
        info!("starting pipeline batch");
        let outcome = self
            .orchestrator
            .run(self.config.max_records, &self.shutdown)
            .await?;
        match &outcome {
            RunOutcome::Completed { run_id, .. } => info!(run_id = %run_id, "pipeline batch completed"),
            RunOutcome::Failed { run_id, error, .. } => {
                warn!(run_id = %run_id, error = %error, "pipeline batch failed")
            }
            RunOutcome::Skipped => info!("pipeline batch skipped"),
        }
        Ok(outcome)
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run(&self) -> Result<()> {
        let check_every = self.config.check_interval();
        info!(
            interval_secs = self.config.interval.as_secs(),
            check_every_secs = check_every.as_secs(),
            "scheduler started"
        );

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            match self.should_run_batch().await {
                Ok(true) => {
                    let span = tracing::info_span!("scheduler.batch");
                    if let Err(e) = self.run_batch().instrument(span).await {
                        error!("pipeline batch error: {e}");
                    }
                }
                Ok(false) => {}
                Err(e) => error!("failed to check pipeline state: {e}"),
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(check_every) => {}
            }
        }

        info!("scheduler shutting down");
        Ok(())
    }
}
