//! nbo CLI: runs the enrichment pipeline and inspects its state.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use nbo_enrich::cache::DedupCache;
use nbo_enrich::config::Config;
use nbo_enrich::db::Db;
use nbo_enrich::engine::{Orchestrator, RunOutcome, Scheduler};
use nbo_enrich::model::PipelineRun;
use nbo_enrich::stage::{EmailNormalizer, StageSpec};
use nbo_enrich::state::{PipelineStateManager, StateStore};
use nbo_enrich::telemetry::{TelemetryConfig, init_telemetry};
use secrecy::ExposeSecret;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "nbo", about = "Subscriber enrichment pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Apply pending database migrations
    Migrate,
    /// Run batches on the configured interval until Ctrl-C
    Serve,
    /// Run a single batch now
    RunBatch {
        /// Bound on new records (defaults to MAX_RECORDS_PER_BATCH)
        #[arg(long)]
        max_records: Option<usize>,
    },
    /// Show the pipeline's current state
    Status {
        /// Pipeline name (defaults to PIPELINE_NAME)
        #[arg(long)]
        pipeline: Option<String>,
    },
    /// List recent runs, newest first
    Runs {
        #[arg(long)]
        pipeline: Option<String>,
        /// Maximum runs to show
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Show one run in full
    ShowRun {
        /// Run ID
        run_id: uuid::Uuid,
    },
    /// Release a pipeline left running by a crashed process
    Recover {
        #[arg(long)]
        pipeline: Option<String>,
        /// Reason recorded on the abandoned run
        #[arg(long, default_value = "abandoned: process exited mid-run")]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "nbo"))?;

    let db = Arc::new(Db::connect(config.database_url.expose_secret()).await?);
    db.migrate().await?;

    let pipeline_name =
        |arg: Option<String>| arg.unwrap_or_else(|| config.pipeline.pipeline_name.clone());

    match cli.command {
        Command::Migrate => {
            db.health_check().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Command::Serve => cmd_serve(&config, db).await,
        Command::RunBatch { max_records } => cmd_run_batch(&config, db, max_records).await,
        Command::Status { pipeline } => cmd_status(db, pipeline_name(pipeline)).await,
        Command::Runs { pipeline, limit } => cmd_runs(db, pipeline_name(pipeline), limit).await,
        Command::ShowRun { run_id } => cmd_show_run(&db, run_id).await,
        Command::Recover { pipeline, reason } => {
            cmd_recover(db, pipeline_name(pipeline), &reason).await
        }
    }
}

/// Postgres feeds, stores and tracks the pipeline; one normalizing stage
/// sized by the pool settings.
fn build_orchestrator(config: &Config, db: Arc<Db>) -> Orchestrator {
    let cache = Arc::new(DedupCache::new(config.cache.clone()));
    let state = Arc::new(PipelineStateManager::new(
        config.pipeline.pipeline_name.clone(),
        db.clone(),
    ));
    Orchestrator::new(config.pipeline.clone(), db.clone(), db, cache, state).with_stage(
        StageSpec::new("normalize", Arc::new(EmailNormalizer)).with_scaling(config.pool.clone()),
    )
}

async fn cmd_serve(config: &Config, db: Arc<Db>) -> anyhow::Result<()> {
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(build_orchestrator(config, db)),
        config.scheduler.clone(),
    ));

    let ctrl = scheduler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    scheduler.run().await?;
    Ok(())
}

async fn cmd_run_batch(
    config: &Config,
    db: Arc<Db>,
    max_records: Option<usize>,
) -> anyhow::Result<()> {
    let orchestrator = build_orchestrator(config, db);

    let cancel = CancellationToken::new();
    let ctrl = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.cancel();
    });

    match orchestrator.run(max_records, &cancel).await? {
        RunOutcome::Completed { run_id, stats } => {
            println!("Run {run_id} completed.");
            println!("Fetched:    {}", stats.fetched);
            println!("Duplicates: {}", stats.duplicates);
            println!("Written:    {}", stats.written);
            println!(
                "Watermark:  {}",
                stats.last_processed_id.as_deref().unwrap_or("-")
            );
            Ok(())
        }
        RunOutcome::Failed { run_id, error, .. } => {
            anyhow::bail!("run {run_id} failed: {error}")
        }
        RunOutcome::Skipped => {
            println!(
                "Pipeline '{}' is already running; nothing to do.",
                config.pipeline.pipeline_name
            );
            Ok(())
        }
    }
}

async fn cmd_status(db: Arc<Db>, pipeline: String) -> anyhow::Result<()> {
    let manager = PipelineStateManager::new(pipeline, db);
    let state = manager.get_current_state().await?;

    println!("Pipeline:   {}", state.pipeline_name);
    println!("Status:     {}", state.status);
    println!(
        "Last Run:   {}",
        state
            .last_run_id
            .map(|id| id.to_string())
            .unwrap_or("-".to_string())
    );
    println!(
        "Started:    {}",
        state
            .last_run_timestamp
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or("-".to_string())
    );
    println!(
        "Watermark:  {}",
        state.last_processed_id.as_deref().unwrap_or("-")
    );
    println!("Records:    {}", state.records_processed);
    Ok(())
}

async fn cmd_runs(db: Arc<Db>, pipeline: String, limit: usize) -> anyhow::Result<()> {
    let manager = PipelineStateManager::new(pipeline, db);
    let runs = manager.get_pipeline_history(limit).await?;

    if runs.is_empty() {
        println!("No runs found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<16}  {:<16}  {:>8}  ERROR",
        "ID", "STATUS", "STARTED", "ENDED", "RECORDS"
    );
    println!("{}", "-".repeat(90));

    for run in &runs {
        let short_id = &run.run_id.to_string()[..8];
        let ended = run
            .end_time
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or("-".to_string());
        let error = run.error_message.as_deref().unwrap_or("-");
        let error_display: String = error.chars().take(30).collect();
        println!(
            "{:<8}  {:<10}  {:<16}  {:<16}  {:>8}  {}",
            short_id,
            run.status,
            run.start_time.format("%Y-%m-%d %H:%M"),
            ended,
            run.records_processed,
            error_display
        );
    }

    println!("\n{} run(s)", runs.len());
    Ok(())
}

async fn cmd_show_run(db: &Db, run_id: uuid::Uuid) -> anyhow::Result<()> {
    let Some(run) = db.get_run(run_id).await? else {
        anyhow::bail!("no run with id {run_id}");
    };
    print_run(&run)
}

fn print_run(run: &PipelineRun) -> anyhow::Result<()> {
    println!("ID:         {}", run.run_id);
    println!("Pipeline:   {}", run.pipeline_name);
    println!("Status:     {}", run.status);
    println!("Started:    {}", run.start_time);
    if let Some(end) = run.end_time {
        println!("Ended:      {end}");
    }
    println!("Records:    {}", run.records_processed);
    if let Some(ref err) = run.error_message {
        println!("Error:      {err}");
    }
    println!(
        "Metadata:   {}",
        serde_json::to_string_pretty(&run.metadata)?
    );
    Ok(())
}

async fn cmd_recover(db: Arc<Db>, pipeline: String, reason: &str) -> anyhow::Result<()> {
    let manager = PipelineStateManager::new(pipeline.clone(), db);
    match manager.recover_abandoned_run(reason).await? {
        Some(run_id) => println!("Recovered pipeline '{pipeline}': run {run_id} marked failed."),
        None => println!("Pipeline '{pipeline}' is not stuck; nothing to do."),
    }
    Ok(())
}
