//! Core data model.
//!
//! A [`WorkItem`] is a subscriber record flowing through the enrichment
//! stages. [`PipelineState`] and [`PipelineRun`] are the persisted progress
//! rows that make a pipeline resumable.

pub mod pipeline;
pub mod record;

pub use pipeline::{PipelineRun, PipelineState, PipelineStatus, RunStatus};
pub use record::WorkItem;
