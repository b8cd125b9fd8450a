//! # nbo-enrich
//!
//! Orchestration core for subscriber-record enrichment.
//!
//! Pages records from a source, skips ids already seen through an in-memory
//! dedup cache, fans new records out to enrichment stages backed by
//! auto-scaling worker pools, and batches results into a sink. Pipeline
//! state and run history live in Postgres so runs resume from the last
//! durable watermark.

pub mod cache;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod model;
pub mod pool;
pub mod queue;
pub mod sink;
pub mod source;
pub mod stage;
pub mod state;
pub mod telemetry;
