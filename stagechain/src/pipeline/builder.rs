//! Incremental pipeline construction.

use super::assign::Assign;
use super::invoker::Pipeline;
use super::parallel::ParallelGroup;
use super::sequence::Sequence;
use crate::config::InvokerConfig;
use crate::contracts::Shape;
use crate::errors::CompositionError;
use crate::events::EventSink;
use crate::stages::Stage;
use std::fmt;
use std::sync::Arc;

/// Builder for constructing pipelines step by step.
///
/// Each step is checked against the contract produced by the steps before
/// it as soon as it is added, so a mismatch points at the offending call.
pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn Stage>>,
    produced: Shape,
    sink: Option<Arc<dyn EventSink>>,
    config: InvokerConfig,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            produced: Shape::Any,
            sink: None,
            config: InvokerConfig::default(),
        }
    }

    /// Appends a stage.
    pub fn then(mut self, stage: Arc<dyn Stage>) -> Result<Self, CompositionError> {
        self.produced = match self.steps.last() {
            Some(previous) => {
                stage.input_shape().accepts(&self.produced).map_err(|e| {
                    CompositionError::shape_mismatch(previous.id(), stage.id(), e.to_string())
                })?;
                stage.output_shape_for(&self.produced)
            }
            None => stage.output_shape(),
        };
        self.steps.push(stage);
        Ok(self)
    }

    /// Appends a parallel group.
    pub fn parallel(self, group: ParallelGroup) -> Result<Self, CompositionError> {
        self.then(Arc::new(group))
    }

    /// Appends an assign step.
    pub fn assign(self, assign: Assign) -> Result<Self, CompositionError> {
        self.then(Arc::new(assign))
    }

    /// Sets the event sink of the built pipeline.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Sets the invoker configuration of the built pipeline.
    #[must_use]
    pub fn with_config(mut self, config: InvokerConfig) -> Self {
        self.config = config;
        self
    }

    /// Returns the number of steps added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no step was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Finalizes the pipeline.
    pub fn build(mut self) -> Result<Pipeline, CompositionError> {
        let root: Arc<dyn Stage> = match self.steps.len() {
            0 => return Err(CompositionError::empty(format!("pipeline '{}'", self.name))),
            1 => self.steps.remove(0),
            _ => Arc::new(Sequence::new(self.steps)?),
        };

        let mut pipeline = Pipeline::new(self.name, root)?.with_config(self.config);
        if let Some(sink) = self.sink {
            pipeline = pipeline.with_event_sink(sink);
        }
        Ok(pipeline)
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("produced", &self.produced)
            .field("has_sink", &self.sink.is_some())
            .field("config", &self.config)
            .finish()
    }
}
