//! Serializable view of a pipeline's topology.

use crate::contracts::Shape;
use crate::core::StageKind;
use crate::stages::Stage;
use serde::{Deserialize, Serialize};

/// One node of a described stage graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Stage identifier.
    pub id: String,
    /// Stage kind.
    pub kind: StageKind,
    /// Input contract.
    pub input_shape: Shape,
    /// Output contract.
    pub output_shape: Shape,
    /// Direct sub-stages, in execution or declaration order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<StageDescriptor>,
}

impl StageDescriptor {
    /// Describes `stage` and everything below it.
    ///
    /// The graph must be acyclic; [`Pipeline`](super::Pipeline) guarantees
    /// this for the stages it holds.
    #[must_use]
    pub fn of(stage: &dyn Stage) -> Self {
        Self {
            id: stage.id().to_string(),
            kind: stage.kind(),
            input_shape: stage.input_shape(),
            output_shape: stage.output_shape(),
            children: stage
                .children()
                .iter()
                .map(|child| Self::of(child.as_ref()))
                .collect(),
        }
    }

    /// Returns the number of leaf stages.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        if self.children.is_empty() {
            1
        } else {
            self.children.iter().map(Self::leaf_count).sum()
        }
    }

    /// Returns the deepest nesting level (a leaf has depth 1).
    #[must_use]
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(Self::depth).max().unwrap_or(0)
    }

    /// Renders the descriptor as pretty JSON.
    pub fn to_json_pretty(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}
