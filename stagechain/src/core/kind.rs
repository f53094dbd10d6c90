//! Stage kind enum.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of work a stage performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// A pure transformation of the input (reshape, extract, format).
    #[default]
    Transform,
    /// Renders a prompt template.
    Prompt,
    /// Calls a chat model.
    Model,
    /// Parses model output.
    Parser,
    /// Calls a retriever.
    Retriever,
    /// Calls an embedder.
    Embedding,
    /// Calls a generic external capability.
    Capability,
    /// Sequential composition.
    Sequence,
    /// Parallel fan-out and merge.
    Parallel,
    /// Parallel fan-out merged into the input object.
    Assign,
    /// Predicate routing between alternatives.
    Branch,
    /// A finalized pipeline used as a stage.
    Pipeline,
}

impl StageKind {
    /// Returns true for kinds that only orchestrate other stages.
    #[must_use]
    pub fn is_composite(self) -> bool {
        matches!(
            self,
            Self::Sequence | Self::Parallel | Self::Assign | Self::Branch | Self::Pipeline
        )
    }

    /// Returns true for kinds that reach an external collaborator.
    #[must_use]
    pub fn is_external(self) -> bool {
        matches!(
            self,
            Self::Model | Self::Retriever | Self::Embedding | Self::Capability
        )
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transform => write!(f, "transform"),
            Self::Prompt => write!(f, "prompt"),
            Self::Model => write!(f, "model"),
            Self::Parser => write!(f, "parser"),
            Self::Retriever => write!(f, "retriever"),
            Self::Embedding => write!(f, "embedding"),
            Self::Capability => write!(f, "capability"),
            Self::Sequence => write!(f, "sequence"),
            Self::Parallel => write!(f, "parallel"),
            Self::Assign => write!(f, "assign"),
            Self::Branch => write!(f, "branch"),
            Self::Pipeline => write!(f, "pipeline"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_default() {
        assert_eq!(StageKind::default(), StageKind::Transform);
    }

    #[test]
    fn test_composite_kinds() {
        assert!(StageKind::Sequence.is_composite());
        assert!(StageKind::Pipeline.is_composite());
        assert!(!StageKind::Model.is_composite());
        assert!(StageKind::Model.is_external());
        assert!(!StageKind::Parser.is_external());
    }

    #[test]
    fn test_kind_display_matches_serde() {
        for kind in [StageKind::Transform, StageKind::Parallel, StageKind::Embedding] {
            let json = serde_json::to_value(kind).unwrap();
            assert_eq!(json, serde_json::json!(kind.to_string()));
        }
    }
}
