//! Per-invocation context.
//!
//! An [`InvocationContext`] is created fresh for every call to
//! [`Pipeline::invoke`](crate::pipeline::Pipeline::invoke) and threaded by
//! reference through every stage. It carries identity (pipeline name, run
//! id), the current composite scope, the injected event sink, and the
//! collector for branch failures tolerated by collect-all groups.
//!
//! It never carries stage data: every value a stage needs arrives through
//! its input.

use crate::events::{EventSink, NoOpEventSink};
use crate::pipeline::BranchFailure;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Execution context for one pipeline invocation.
#[derive(Clone)]
pub struct InvocationContext {
    pipeline: Arc<str>,
    run_id: Uuid,
    scope: Vec<String>,
    sink: Arc<dyn EventSink>,
    failures: Arc<Mutex<Vec<BranchFailure>>>,
}

impl InvocationContext {
    /// Creates a context for a new run of `pipeline`.
    #[must_use]
    pub fn new(pipeline: &str, sink: Arc<dyn EventSink>) -> Self {
        Self {
            pipeline: Arc::from(pipeline),
            run_id: Uuid::new_v4(),
            scope: Vec::new(),
            sink,
            failures: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a context that is not attached to any pipeline.
    ///
    /// Useful for applying a single stage directly, e.g. in tests.
    #[must_use]
    pub fn detached() -> Self {
        Self::new("detached", Arc::new(NoOpEventSink))
    }

    /// Returns a context one composite level deeper.
    ///
    /// The child shares the run id, sink and failure collector.
    #[must_use]
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut child = self.clone();
        child.scope.push(segment.into());
        child
    }

    /// Returns a child context with its own branch-failure collector.
    ///
    /// Failures recorded under the child stay there until
    /// [`adopt_branch_failures`](Self::adopt_branch_failures) moves them up.
    #[must_use]
    pub fn isolated_child(&self, segment: impl Into<String>) -> Self {
        let mut child = self.child(segment);
        child.failures = Arc::new(Mutex::new(Vec::new()));
        child
    }

    /// Moves every failure recorded under `child` into this context.
    pub fn adopt_branch_failures(&self, child: &Self) {
        let adopted = child.take_branch_failures();
        if !adopted.is_empty() {
            self.failures.lock().extend(adopted);
        }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn pipeline(&self) -> &str {
        &self.pipeline
    }

    /// Returns the run id.
    #[must_use]
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Returns the composite scope, outermost first.
    #[must_use]
    pub fn scope(&self) -> &[String] {
        &self.scope
    }

    /// Records a branch failure tolerated by a collect-all group.
    pub fn record_branch_failure(&self, failure: BranchFailure) {
        self.failures.lock().push(failure);
    }

    /// Drains every recorded branch failure.
    #[must_use]
    pub fn take_branch_failures(&self) -> Vec<BranchFailure> {
        std::mem::take(&mut *self.failures.lock())
    }

    /// Emits an event through the injected sink, tagged with run identity.
    pub fn emit(&self, event_type: &str, data: serde_json::Value) {
        let mut payload = serde_json::json!({
            "pipeline": &*self.pipeline,
            "run_id": self.run_id.to_string(),
        });
        if !self.scope.is_empty() {
            payload["scope"] = serde_json::json!(self.scope);
        }
        if let (Some(target), serde_json::Value::Object(extra)) = (payload.as_object_mut(), data) {
            target.extend(extra);
        }
        self.sink.try_emit(event_type, Some(payload));
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("pipeline", &self.pipeline)
            .field("run_id", &self.run_id)
            .field("scope", &self.scope)
            .finish_non_exhaustive()
    }
}
