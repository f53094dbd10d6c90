//! Sequential composition.

use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::core::StageKind;
use crate::errors::{CompositionError, InvocationError};
use crate::stages::{run_stage, Stage};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Stages applied one after another, each consuming the previous output.
///
/// Sequences are always flat: building a sequence from steps that are
/// themselves sequences splices their steps in. `(A | B) | C` and
/// `A | (B | C)` are therefore the same three-step sequence, with the same
/// behavior, error paths and error positions.
#[derive(Debug, Clone)]
pub struct Sequence {
    id: String,
    steps: Vec<Arc<dyn Stage>>,
    output_shape: Shape,
}

impl Sequence {
    /// Builds a sequence, checking every adjacent pair of contracts.
    pub fn new(steps: Vec<Arc<dyn Stage>>) -> Result<Self, CompositionError> {
        let mut flat: Vec<Arc<dyn Stage>> = Vec::with_capacity(steps.len());
        for step in steps {
            match step.sequence_steps() {
                Some(inner) => flat.extend(inner.iter().cloned()),
                None => flat.push(step),
            }
        }

        if flat.is_empty() {
            return Err(CompositionError::empty("sequence"));
        }

        let mut produced = flat[0].output_shape();
        for pair in flat.windows(2) {
            let (upstream, downstream) = (&pair[0], &pair[1]);
            downstream.input_shape().accepts(&produced).map_err(|e| {
                CompositionError::shape_mismatch(upstream.id(), downstream.id(), e.to_string())
            })?;
            produced = downstream.output_shape_for(&produced);
        }

        let id = flat.iter().map(|s| s.id()).collect::<Vec<_>>().join(" | ");
        Ok(Self {
            id,
            steps: flat,
            output_shape: produced,
        })
    }

    /// Chains `first` then `second`.
    pub fn chain(first: Arc<dyn Stage>, second: Arc<dyn Stage>) -> Result<Self, CompositionError> {
        Self::new(vec![first, second])
    }

    /// Returns a new sequence with `next` appended.
    pub fn then(&self, next: Arc<dyn Stage>) -> Result<Self, CompositionError> {
        let mut steps = self.steps.clone();
        steps.push(next);
        Self::new(steps)
    }

    /// Returns the flattened steps.
    #[must_use]
    pub fn steps(&self) -> &[Arc<dyn Stage>] {
        &self.steps
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Always false; an empty sequence cannot be built.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

#[async_trait]
impl Stage for Sequence {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Sequence
    }

    fn input_shape(&self) -> Shape {
        self.steps.first().map(|s| s.input_shape()).unwrap_or_default()
    }

    fn output_shape(&self) -> Shape {
        self.output_shape.clone()
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        self.steps
            .iter()
            .fold(input.clone(), |produced, step| step.output_shape_for(&produced))
    }

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        self.steps.clone()
    }

    fn sequence_steps(&self) -> Option<&[Arc<dyn Stage>]> {
        Some(&self.steps)
    }

    async fn apply(&self, ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let Some((first, rest)) = self.steps.split_first() else {
            return Ok(input.clone());
        };

        let mut current = run_stage(first.as_ref(), ctx, input)
            .await
            .map_err(|e| e.at_position(0))?;

        for (offset, step) in rest.iter().enumerate() {
            current = run_stage(step.as_ref(), ctx, &current)
                .await
                .map_err(|e| e.at_position(offset + 1))?;
        }
        Ok(current)
    }
}
