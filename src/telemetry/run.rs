//! Run and stage span helpers.

use std::fmt::Display;

use tracing::Span;
use uuid::Uuid;

/// Start a span covering one pipeline run.
///
/// The `run.phase` field is declared empty and updated by [`record_phase`].
pub fn start_run_span(pipeline: &str, run_id: &Uuid) -> Span {
    tracing::info_span!(
        "pipeline.run",
        "pipeline.name" = pipeline,
        "run.id" = %run_id,
        "run.phase" = tracing::field::Empty,
    )
}

/// Span around a stage's worker pool startup.
pub fn start_stage_span(stage: &str) -> Span {
    tracing::info_span!("pipeline.stage", "stage.name" = stage)
}

/// Record a phase transition on the run span and emit an event inside it.
pub fn record_phase(span: &Span, from: impl Display, to: impl Display) {
    let to = to.to_string();
    span.record("run.phase", to.as_str());
    span.in_scope(|| {
        tracing::info!(from = %from, to = %to, "phase_transition");
    });
}
