//! Finalized pipelines and their invocation.

use super::describe::StageDescriptor;
use super::failure::{BatchSummary, BranchFailure};
use super::validation::detect_cycles;
use crate::config::InvokerConfig;
use crate::context::InvocationContext;
use crate::contracts::{parse_as, Shape, ValidationError};
use crate::core::StageKind;
use crate::errors::{CompositionError, InvocationError, StageExecutionError};
use crate::events::{names, EventSink, NoOpEventSink};
use crate::observability::SpanTimer;
use crate::stages::{run_stage, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// The outcome of one successful invocation.
#[derive(Debug, Clone)]
pub struct InvocationResult {
    /// Name of the pipeline.
    pub pipeline: String,
    /// Identifier of this run.
    pub run_id: Uuid,
    /// The terminal stage's output.
    pub output: Value,
    /// Branches that failed inside collect-all groups.
    pub branch_failures: Vec<BranchFailure>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// Wall time of the run in milliseconds.
    pub duration_ms: f64,
}

impl InvocationResult {
    /// Returns true if some collect-all branch failed.
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.branch_failures.is_empty()
    }

    /// Deserializes the output into `T`.
    pub fn parse_as<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        parse_as(&self.output)
    }

    /// Consumes the result, returning the output.
    #[must_use]
    pub fn into_output(self) -> Value {
        self.output
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, Value> {
        let mut map = HashMap::new();
        map.insert("pipeline".to_string(), serde_json::json!(self.pipeline));
        map.insert("run_id".to_string(), serde_json::json!(self.run_id.to_string()));
        map.insert("output".to_string(), self.output.clone());
        map.insert(
            "branch_failures".to_string(),
            serde_json::json!(self
                .branch_failures
                .iter()
                .map(BranchFailure::to_dict)
                .collect::<Vec<_>>()),
        );
        map.insert("started_at".to_string(), serde_json::json!(self.started_at.to_rfc3339()));
        map.insert("duration_ms".to_string(), serde_json::json!(self.duration_ms));
        map
    }
}

/// Per-item results of [`Pipeline::invoke_many`], in input order.
#[derive(Debug, Clone)]
pub struct BatchOutcome {
    results: Vec<Result<InvocationResult, InvocationError>>,
}

impl BatchOutcome {
    /// Returns every per-item result.
    #[must_use]
    pub fn results(&self) -> &[Result<InvocationResult, InvocationError>] {
        &self.results
    }

    /// Consumes the outcome, returning every per-item result.
    #[must_use]
    pub fn into_results(self) -> Vec<Result<InvocationResult, InvocationError>> {
        self.results
    }

    /// Returns the output of each item, `None` for failed items.
    #[must_use]
    pub fn outputs(&self) -> Vec<Option<&Value>> {
        self.results
            .iter()
            .map(|r| r.as_ref().ok().map(|res| &res.output))
            .collect()
    }

    /// Returns the failed items with their input index.
    #[must_use]
    pub fn failures(&self) -> Vec<(usize, &InvocationError)> {
        self.results
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.as_ref().err().map(|e| (i, e)))
            .collect()
    }

    /// Returns the number of items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true for an empty batch.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Summarizes the batch.
    #[must_use]
    pub fn summary(&self) -> BatchSummary {
        let failed = self.results.iter().filter(|r| r.is_err()).count();
        BatchSummary {
            total: self.results.len(),
            succeeded: self.results.len() - failed,
            failed,
        }
    }
}

/// A validated, invocable stage graph.
///
/// Pipelines are immutable and cheap to clone; invoke them any number of
/// times, concurrently if needed. Each invocation is independent.
#[derive(Clone)]
pub struct Pipeline {
    name: String,
    root: Arc<dyn Stage>,
    sink: Arc<dyn EventSink>,
    config: InvokerConfig,
}

impl Pipeline {
    /// Finalizes `root` into a pipeline.
    ///
    /// Fails if the name is blank or the graph contains a cycle.
    pub fn new(name: impl Into<String>, root: Arc<dyn Stage>) -> Result<Self, CompositionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CompositionError::invalid_name("pipeline", "name must not be blank"));
        }
        detect_cycles(&root)?;

        Ok(Self {
            name,
            root,
            sink: Arc::new(NoOpEventSink),
            config: InvokerConfig::default(),
        })
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Sets the invoker configuration.
    #[must_use]
    pub fn with_config(mut self, config: InvokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the root stage.
    #[must_use]
    pub fn root(&self) -> &Arc<dyn Stage> {
        &self.root
    }

    /// Returns the invoker configuration.
    #[must_use]
    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    /// Returns the id of the stage that receives the pipeline input.
    #[must_use]
    pub fn entry_stage_id(&self) -> &str {
        self.root
            .sequence_steps()
            .and_then(<[_]>::first)
            .map_or_else(|| self.root.id(), |s| s.id())
    }

    /// Returns the id of the stage that produces the pipeline output.
    #[must_use]
    pub fn terminal_stage_id(&self) -> &str {
        self.root
            .sequence_steps()
            .and_then(<[_]>::last)
            .map_or_else(|| self.root.id(), |s| s.id())
    }

    /// Describes the stage graph.
    #[must_use]
    pub fn describe(&self) -> StageDescriptor {
        StageDescriptor::of(self)
    }

    fn check_input(&self, input: &Value) -> Result<(), InvocationError> {
        if !self.config.validate_input {
            return Ok(());
        }
        self.root.input_shape().check_value(input).map_err(|e| {
            let err: InvocationError =
                StageExecutionError::input_contract(self.entry_stage_id(), e.to_string()).into();
            if self.root.sequence_steps().is_some() {
                err.at_position(0)
            } else {
                err
            }
        })
    }

    /// Runs the pipeline once.
    ///
    /// Errors carry the path of the failing stage and the pipeline name;
    /// nothing else is added to them.
    pub async fn invoke(&self, input: Value) -> Result<InvocationResult, InvocationError> {
        let ctx = InvocationContext::new(&self.name, Arc::clone(&self.sink));
        let started_at = Utc::now();
        let timer = SpanTimer::start(&self.name);

        info!(pipeline = %self.name, run_id = %ctx.run_id(), "Pipeline invocation started");
        ctx.emit(
            names::PIPELINE_STARTED,
            serde_json::json!({"entry": self.entry_stage_id()}),
        );

        let result = match self.check_input(&input) {
            Ok(()) => run_stage(self.root.as_ref(), &ctx, &input).await,
            Err(e) => Err(e),
        };
        let duration_ms = timer.finish();

        match result {
            Ok(output) => {
                let branch_failures = ctx.take_branch_failures();
                info!(
                    pipeline = %self.name,
                    run_id = %ctx.run_id(),
                    duration_ms,
                    partial = !branch_failures.is_empty(),
                    "Pipeline invocation completed"
                );
                ctx.emit(
                    names::PIPELINE_COMPLETED,
                    serde_json::json!({
                        "duration_ms": duration_ms,
                        "branch_failures": branch_failures.len(),
                    }),
                );
                Ok(InvocationResult {
                    pipeline: self.name.clone(),
                    run_id: ctx.run_id(),
                    output,
                    branch_failures,
                    started_at,
                    duration_ms,
                })
            }
            Err(err) => {
                let err = err.in_pipeline(&self.name);
                warn!(
                    pipeline = %self.name,
                    run_id = %ctx.run_id(),
                    duration_ms,
                    path = ?err.path(),
                    error = %err,
                    "Pipeline invocation failed"
                );
                ctx.emit(names::PIPELINE_FAILED, serde_json::json!(err.to_dict()));
                Err(err)
            }
        }
    }

    /// Runs the pipeline once per input.
    ///
    /// A failing item never affects the others; results come back in input
    /// order. At most `batch_concurrency` items run at once.
    pub async fn invoke_many(&self, inputs: Vec<Value>) -> BatchOutcome {
        let concurrency = self.config.batch_concurrency.max(1);
        let results: Vec<_> = stream::iter(inputs)
            .map(|input| self.invoke(input))
            .buffered(concurrency)
            .collect()
            .await;

        let outcome = BatchOutcome { results };
        let summary = outcome.summary();
        info!(
            pipeline = %self.name,
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Batch invocation completed"
        );
        outcome
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("root", &self.root.id())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Stage for Pipeline {
    fn id(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> StageKind {
        StageKind::Pipeline
    }

    fn input_shape(&self) -> Shape {
        self.root.input_shape()
    }

    fn output_shape(&self) -> Shape {
        self.root.output_shape()
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        self.root.output_shape_for(input)
    }

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        vec![Arc::clone(&self.root)]
    }

    /// Runs the root within the caller's invocation; no new run is started.
    async fn apply(&self, ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        run_stage(self.root.as_ref(), ctx, input).await
    }
}
