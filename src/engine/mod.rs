//! Pipeline engine: the orchestrator, its writer stage, watermark tracking
//! and the interval scheduler.

pub mod orchestrator;
pub mod scheduler;
pub mod watermark;
pub mod writer;

pub use orchestrator::{Orchestrator, PipelineConfig, Preparer, RunOutcome, RunPhase, RunStats};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use watermark::{Checkpoint, Tagged, WatermarkTracker};
pub use writer::Writer;
