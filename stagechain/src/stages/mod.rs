//! Stage trait and implementations.
//!
//! Stages are the fundamental units of work in a stagechain pipeline. A
//! stage takes one input value and produces one output value, or fails.

pub mod capability;
pub mod parsers;
pub mod prompt;

use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::core::StageKind;
use crate::errors::{InvocationError, StageExecutionError};
use crate::events::names;
use crate::observability::SpanTimer;
use async_trait::async_trait;
use serde_json::Value;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};

pub use capability::{CapabilityStage, EmbeddingStage, ModelStage, RetrieverStage};
pub use parsers::{JsonOutputParser, StrOutputParser, StructuredOutputParser};
pub use prompt::{ChatPromptTemplate, PromptTemplate, StuffDocuments};

/// Trait for pipeline stages.
///
/// Stages never mutate their input: `apply` receives it by shared
/// reference and returns a new value.
#[async_trait]
pub trait Stage: Send + Sync + Debug {
    /// Returns the identifier of the stage, used in diagnostics.
    fn id(&self) -> &str;

    /// Returns the kind of work this stage performs.
    fn kind(&self) -> StageKind {
        StageKind::Transform
    }

    /// Returns the contract every input must satisfy.
    fn input_shape(&self) -> Shape {
        Shape::Any
    }

    /// Returns the contract every output satisfies.
    fn output_shape(&self) -> Shape {
        Shape::Any
    }

    /// Returns the output contract given what the input is known to be.
    ///
    /// Stages that thread their input through (passthrough, assign) refine
    /// their output with the upstream contract; everything else ignores it.
    fn output_shape_for(&self, input: &Shape) -> Shape {
        let _ = input;
        self.output_shape()
    }

    /// Returns the direct sub-stages of a composite.
    fn children(&self) -> Vec<Arc<dyn Stage>> {
        Vec::new()
    }

    /// Returns the flattened steps if this stage is a sequence.
    fn sequence_steps(&self) -> Option<&[Arc<dyn Stage>]> {
        None
    }

    /// Applies the stage to one input.
    ///
    /// # Arguments
    ///
    /// * `ctx` - The invocation context
    /// * `input` - The value produced upstream
    async fn apply(&self, ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError>;
}

/// Runs a stage, emitting lifecycle events for leaf stages.
///
/// Composites are passed straight through; their leaves report themselves.
pub(crate) async fn run_stage(
    stage: &dyn Stage,
    ctx: &InvocationContext,
    input: &Value,
) -> Result<Value, InvocationError> {
    let kind = stage.kind();
    if kind.is_composite() {
        return stage.apply(ctx, input).await;
    }

    let stage_id = stage.id();
    ctx.emit(
        names::STAGE_STARTED,
        serde_json::json!({"stage": stage_id, "kind": kind}),
    );
    let timer = SpanTimer::start(stage_id);

    let result = stage.apply(ctx, input).await;
    let duration_ms = timer.finish();

    match &result {
        Ok(_) => {
            debug!(
                pipeline = ctx.pipeline(),
                run_id = %ctx.run_id(),
                stage = stage_id,
                %kind,
                duration_ms,
                "Stage completed"
            );
            ctx.emit(
                names::STAGE_COMPLETED,
                serde_json::json!({"stage": stage_id, "duration_ms": duration_ms}),
            );
        }
        Err(err) => {
            warn!(
                pipeline = ctx.pipeline(),
                run_id = %ctx.run_id(),
                stage = stage_id,
                %kind,
                duration_ms,
                error = %err,
                "Stage failed"
            );
            ctx.emit(
                names::STAGE_FAILED,
                serde_json::json!({
                    "stage": stage_id,
                    "duration_ms": duration_ms,
                    "error": err.to_string(),
                }),
            );
        }
    }
    result
}

/// A stage wrapping a pure synchronous function.
pub struct FnStage<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    id: String,
    func: F,
    input_shape: Shape,
    output_shape: Shape,
}

impl<F> FnStage<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    /// Creates a new function-based stage.
    pub fn new(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            func,
            input_shape: Shape::Any,
            output_shape: Shape::Any,
        }
    }

    /// Declares the input contract.
    #[must_use]
    pub fn with_input_shape(mut self, shape: Shape) -> Self {
        self.input_shape = shape;
        self
    }

    /// Declares the output contract.
    #[must_use]
    pub fn with_output_shape(mut self, shape: Shape) -> Self {
        self.output_shape = shape;
        self
    }
}

impl<F> Debug for FnStage<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnStage")
            .field("id", &self.id)
            .field("input_shape", &self.input_shape)
            .field("output_shape", &self.output_shape)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.output_shape.clone()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        (self.func)(input)
            .map_err(|e| StageExecutionError::function(&self.id, format!("{e:#}")).into())
    }
}

/// A stage wrapping an async function.
///
/// The function receives an owned copy of the input.
pub struct AsyncFnStage<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    id: String,
    func: F,
    kind: StageKind,
    input_shape: Shape,
    output_shape: Shape,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> AsyncFnStage<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    /// Creates a new async function-based stage.
    pub fn new(id: impl Into<String>, func: F) -> Self {
        Self {
            id: id.into(),
            func,
            kind: StageKind::Transform,
            input_shape: Shape::Any,
            output_shape: Shape::Any,
            _phantom: PhantomData,
        }
    }

    /// Sets the reported stage kind.
    #[must_use]
    pub fn with_kind(mut self, kind: StageKind) -> Self {
        self.kind = kind;
        self
    }

    /// Declares the input contract.
    #[must_use]
    pub fn with_input_shape(mut self, shape: Shape) -> Self {
        self.input_shape = shape;
        self
    }

    /// Declares the output contract.
    #[must_use]
    pub fn with_output_shape(mut self, shape: Shape) -> Self {
        self.output_shape = shape;
        self
    }
}

impl<F, Fut> Debug for AsyncFnStage<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFnStage")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Stage for AsyncFnStage<F, Fut>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send,
{
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Shape {
        self.output_shape.clone()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        (self.func)(input.clone())
            .await
            .map_err(|e| StageExecutionError::function(&self.id, format!("{e:#}")).into())
    }
}

/// Returns its input unchanged.
#[derive(Debug, Clone)]
pub struct Passthrough {
    id: String,
}

#[async_trait]
impl Stage for Passthrough {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        input.clone()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        Ok(input.clone())
    }
}

/// Extracts one field of an object input.
#[derive(Debug, Clone)]
pub struct Pluck {
    id: String,
    key: String,
}

#[async_trait]
impl Stage for Pluck {
    fn id(&self) -> &str {
        &self.id
    }

    fn input_shape(&self) -> Shape {
        Shape::object([self.key.clone()])
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        input.get(&self.key).cloned().ok_or_else(|| {
            StageExecutionError::input_contract(&self.id, format!("missing key '{}'", self.key))
                .into()
        })
    }
}

/// Ignores its input and returns a fixed value.
#[derive(Debug, Clone)]
pub struct Constant {
    id: String,
    value: Value,
}

#[async_trait]
impl Stage for Constant {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_shape(&self) -> Shape {
        Shape::of_value(&self.value)
    }

    async fn apply(&self, _ctx: &InvocationContext, _input: &Value) -> Result<Value, InvocationError> {
        Ok(self.value.clone())
    }
}

/// Creates a stage that returns its input unchanged.
#[must_use]
pub fn passthrough(id: impl Into<String>) -> Arc<dyn Stage> {
    Arc::new(Passthrough { id: id.into() })
}

/// Creates a stage that extracts `key` from an object input.
#[must_use]
pub fn pluck(id: impl Into<String>, key: impl Into<String>) -> Arc<dyn Stage> {
    Arc::new(Pluck {
        id: id.into(),
        key: key.into(),
    })
}

/// Creates a stage that always returns `value`.
#[must_use]
pub fn constant(id: impl Into<String>, value: Value) -> Arc<dyn Stage> {
    Arc::new(Constant {
        id: id.into(),
        value,
    })
}
