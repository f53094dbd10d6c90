//! Event sinks for pipeline observability.
//!
//! A sink is injected into each [`Pipeline`](crate::pipeline::Pipeline);
//! there is no process-wide sink.

mod sink;

pub use sink::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};

/// Event type names emitted by the invoker and composers.
pub mod names {
    /// An invocation began.
    pub const PIPELINE_STARTED: &str = "pipeline.started";
    /// An invocation produced an output.
    pub const PIPELINE_COMPLETED: &str = "pipeline.completed";
    /// An invocation failed.
    pub const PIPELINE_FAILED: &str = "pipeline.failed";
    /// A leaf stage began.
    pub const STAGE_STARTED: &str = "stage.started";
    /// A leaf stage produced an output.
    pub const STAGE_COMPLETED: &str = "stage.completed";
    /// A leaf stage failed.
    pub const STAGE_FAILED: &str = "stage.failed";
    /// A collect-all group lost a branch but kept going.
    pub const BRANCH_FAILED: &str = "branch.failed";
}
