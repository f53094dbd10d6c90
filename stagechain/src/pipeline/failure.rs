//! Failure policies for parallel groups and batch invocation.

use crate::errors::InvocationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// How a parallel group reacts to a failing branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicy {
    /// The first failing branch aborts the group (default).
    #[default]
    FailFast,
    /// Every branch runs; failures are recorded and the group only fails
    /// when no branch succeeds.
    CollectAll,
}

/// A branch failure tolerated by a [`MergePolicy::CollectAll`] group.
#[derive(Debug, Clone)]
pub struct BranchFailure {
    /// Identifier of the parallel group.
    pub group: String,
    /// Name of the failed branch.
    pub branch: String,
    /// Route from the pipeline root down to the failing stage.
    pub path: Vec<String>,
    /// The branch's error.
    pub error: InvocationError,
    /// When the failure was recorded.
    pub recorded_at: DateTime<Utc>,
}

impl BranchFailure {
    /// Creates a new branch failure record.
    ///
    /// The path is taken from `error`, which should already be prefixed
    /// with the enclosing scope.
    #[must_use]
    pub fn new(group: impl Into<String>, branch: impl Into<String>, error: InvocationError) -> Self {
        Self {
            group: group.into(),
            branch: branch.into(),
            path: error.path().to_vec(),
            error,
            recorded_at: Utc::now(),
        }
    }

    /// Returns the identifier of the stage that actually failed.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        self.error.stage_id()
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("group".to_string(), serde_json::json!(self.group));
        map.insert("branch".to_string(), serde_json::json!(self.branch));
        map.insert("path".to_string(), serde_json::json!(self.path));
        map.insert("stage".to_string(), serde_json::json!(self.stage_id()));
        map.insert("error".to_string(), serde_json::json!(self.error.to_string()));
        map.insert(
            "recorded_at".to_string(),
            serde_json::json!(self.recorded_at.to_rfc3339()),
        );
        map
    }
}

/// Summary of a batch invocation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Number of inputs.
    pub total: usize,
    /// Number of inputs that produced an output.
    pub succeeded: usize,
    /// Number of inputs that failed.
    pub failed: usize,
}

impl BatchSummary {
    /// Returns the success rate.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.succeeded as f64 / self.total as f64
    }

    /// Returns true if any item failed.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    /// Converts to dictionary.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("total".to_string(), serde_json::json!(self.total));
        map.insert("succeeded".to_string(), serde_json::json!(self.succeeded));
        map.insert("failed".to_string(), serde_json::json!(self.failed));
        map.insert("success_rate".to_string(), serde_json::json!(self.success_rate()));
        map
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StageExecutionError;

    #[test]
    fn test_merge_policy_default() {
        assert_eq!(MergePolicy::default(), MergePolicy::FailFast);
        let json = serde_json::to_value(MergePolicy::CollectAll).unwrap();
        assert_eq!(json, "collect_all");
    }

    #[test]
    fn test_branch_failure_takes_error_path() {
        let err: InvocationError = StageExecutionError::function("parser", "bad json").into();
        let failure = BranchFailure::new("analysis", "sentiment", err.within("branch:sentiment"));

        assert_eq!(failure.path, ["branch:sentiment", "parser"]);
        assert_eq!(failure.stage_id(), "parser");

        let dict = failure.to_dict();
        assert_eq!(dict.get("branch").unwrap(), "sentiment");
        assert!(dict.contains_key("recorded_at"));
    }

    #[test]
    fn test_batch_summary() {
        let summary = BatchSummary {
            total: 4,
            succeeded: 3,
            failed: 1,
        };
        assert!((summary.success_rate() - 0.75).abs() < f64::EPSILON);
        assert!(summary.has_failures());

        let empty = BatchSummary {
            total: 0,
            succeeded: 0,
            failed: 0,
        };
        assert!(empty.success_rate().abs() < f64::EPSILON);
    }
}
