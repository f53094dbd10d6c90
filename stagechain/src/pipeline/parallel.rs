//! Parallel composition: fan one input out to named branches and merge.

use super::failure::{BranchFailure, MergePolicy};
use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::core::StageKind;
use crate::errors::{
    BranchError, CompositionError, InvocationError, MergeError, StageExecutionError, StageFailure,
};
use crate::events::names;
use crate::stages::{run_stage, Stage};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, warn};

/// How the branches of a group are scheduled.
///
/// Branches share no mutable state, so both modes produce the same result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Every branch runs as its own tokio task.
    #[default]
    Concurrent,
    /// Branches run one at a time, in declaration order.
    Sequential,
}

/// Aborts spawned branch tasks when the group stops waiting for them.
struct AbortOnDrop(Vec<AbortHandle>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        for handle in &self.0 {
            handle.abort();
        }
    }
}

fn segment(branch: &str) -> String {
    format!("branch:{branch}")
}

/// Named stages that all consume the same input.
///
/// The output is an object keyed by branch name. Branch names are unique
/// and no branch can see another branch's output.
#[derive(Debug, Clone)]
pub struct ParallelGroup {
    id: String,
    branches: Vec<(String, Arc<dyn Stage>)>,
    policy: MergePolicy,
    mode: ExecutionMode,
    input_shape: Shape,
}

impl ParallelGroup {
    /// Starts building a group.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> ParallelGroupBuilder {
        ParallelGroupBuilder::new(id)
    }

    /// Builds a fail-fast concurrent group from `(name, stage)` pairs.
    pub fn from_branches<I, S>(id: impl Into<String>, branches: I) -> Result<Self, CompositionError>
    where
        I: IntoIterator<Item = (S, Arc<dyn Stage>)>,
        S: Into<String>,
    {
        branches
            .into_iter()
            .try_fold(Self::builder(id), |builder, (name, stage)| builder.branch(name, stage))?
            .build()
    }

    /// Returns the branch names in declaration order.
    #[must_use]
    pub fn branch_names(&self) -> Vec<&str> {
        self.branches.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Returns the merge policy.
    #[must_use]
    pub fn policy(&self) -> MergePolicy {
        self.policy
    }

    /// Returns the execution mode.
    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Runs every branch and returns the per-branch outcomes.
    ///
    /// Under fail-fast the first failure ends the run early and is the only
    /// outcome reported as an error. Each branch records tolerated failures
    /// in its own collector; they reach `ctx` only if the branch succeeds.
    async fn run_branches(
        &self,
        ctx: &InvocationContext,
        input: &Value,
    ) -> Result<Vec<(usize, Result<Value, InvocationError>)>, InvocationError> {
        let fail_fast = self.policy == MergePolicy::FailFast;
        let children: Vec<InvocationContext> = self
            .branches
            .iter()
            .map(|(name, _)| ctx.isolated_child(segment(name)))
            .collect();
        let mut outcomes = Vec::with_capacity(self.branches.len());

        match self.mode {
            ExecutionMode::Sequential => {
                for (index, (name, stage)) in self.branches.iter().enumerate() {
                    let result = AssertUnwindSafe(run_stage(stage.as_ref(), &children[index], input))
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|_| Err(self.branch_panicked(index)));
                    if fail_fast {
                        if let Err(err) = result {
                            return Err(err.within(segment(name)));
                        }
                    }
                    outcomes.push((index, result));
                }
            }
            ExecutionMode::Concurrent => {
                let shared = Arc::new(input.clone());
                let mut pending = FuturesUnordered::new();
                let mut handles = Vec::with_capacity(self.branches.len());

                for (index, (_, stage)) in self.branches.iter().enumerate() {
                    let stage = Arc::clone(stage);
                    let input = Arc::clone(&shared);
                    let child = children[index].clone();
                    let handle = tokio::spawn(async move {
                        run_stage(stage.as_ref(), &child, &input).await
                    });
                    handles.push(handle.abort_handle());
                    pending.push(async move { (index, handle.await) });
                }
                let _guard = AbortOnDrop(handles);

                while let Some((index, joined)) = pending.next().await {
                    let result = joined.unwrap_or_else(|e| Err(self.join_failure(index, &e)));
                    if fail_fast {
                        if let Err(err) = result {
                            let name = &self.branches[index].0;
                            debug!(group = %self.id, branch = %name, "Aborting remaining branches");
                            return Err(err.within(segment(name)));
                        }
                    }
                    outcomes.push((index, result));
                }
            }
        }

        outcomes.sort_by_key(|(index, _)| *index);
        for (index, result) in &outcomes {
            if result.is_ok() {
                ctx.adopt_branch_failures(&children[*index]);
            }
        }
        Ok(outcomes)
    }

    fn branch_panicked(&self, index: usize) -> InvocationError {
        let stage_id = self.branches[index].1.id();
        StageExecutionError::new(stage_id, StageFailure::Panicked("branch task panicked".to_string()))
            .into()
    }

    fn join_failure(&self, index: usize, err: &JoinError) -> InvocationError {
        if err.is_panic() {
            return self.branch_panicked(index);
        }
        let stage_id = self.branches[index].1.id();
        StageExecutionError::new(
            stage_id,
            StageFailure::Panicked("branch task was cancelled".to_string()),
        )
        .into()
    }
}

#[async_trait]
impl Stage for ParallelGroup {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Parallel
    }

    fn input_shape(&self) -> Shape {
        self.input_shape.clone()
    }

    fn output_shape(&self) -> Shape {
        let names = self.branches.iter().map(|(name, _)| name.clone());
        match self.policy {
            MergePolicy::FailFast => Shape::object(names),
            MergePolicy::CollectAll => Shape::partial_object(names),
        }
    }

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        self.branches.iter().map(|(_, stage)| Arc::clone(stage)).collect()
    }

    async fn apply(&self, ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let outcomes = self.run_branches(ctx, input).await?;

        let mut merged = Map::new();
        let mut failures = Vec::new();
        for (index, result) in outcomes {
            let name = &self.branches[index].0;
            match result {
                Ok(value) => {
                    merged.insert(name.clone(), value);
                }
                Err(err) => failures.push(BranchError {
                    branch: name.clone(),
                    error: err.within(segment(name)),
                }),
            }
        }

        if failures.is_empty() {
            return Ok(Value::Object(merged));
        }

        if merged.is_empty() {
            warn!(group = %self.id, failed = failures.len(), "Every branch failed");
            return Err(MergeError::new(&self.id, failures).into());
        }

        for failure in failures {
            let error = failure.error.within_all(ctx.scope());
            warn!(
                group = %self.id,
                branch = %failure.branch,
                error = %error,
                "Branch failed; continuing with partial results"
            );
            ctx.emit(
                names::BRANCH_FAILED,
                serde_json::json!({
                    "group": self.id,
                    "branch": failure.branch,
                    "path": error.path(),
                    "error": error.to_string(),
                }),
            );
            ctx.record_branch_failure(BranchFailure::new(&self.id, failure.branch, error));
        }
        Ok(Value::Object(merged))
    }
}

/// Builder for [`ParallelGroup`].
#[derive(Debug)]
pub struct ParallelGroupBuilder {
    id: String,
    branches: Vec<(String, Arc<dyn Stage>)>,
    names: HashSet<String>,
    policy: MergePolicy,
    mode: ExecutionMode,
}

impl ParallelGroupBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            branches: Vec::new(),
            names: HashSet::new(),
            policy: MergePolicy::default(),
            mode: ExecutionMode::default(),
        }
    }

    /// Adds a named branch.
    pub fn branch(mut self, name: impl Into<String>, stage: Arc<dyn Stage>) -> Result<Self, CompositionError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(CompositionError::invalid_name(
                "branch",
                format!("parallel group '{}' has a blank branch name", self.id),
            ));
        }
        if !self.names.insert(name.clone()) {
            return Err(CompositionError::duplicate_branch(&self.id, &name));
        }
        self.branches.push((name, stage));
        Ok(self)
    }

    /// Sets the merge policy.
    #[must_use]
    pub fn merge_policy(mut self, policy: MergePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Shorthand for [`MergePolicy::CollectAll`].
    #[must_use]
    pub fn collect_all(self) -> Self {
        self.merge_policy(MergePolicy::CollectAll)
    }

    /// Sets the execution mode.
    #[must_use]
    pub fn execution(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Builds the group.
    pub fn build(self) -> Result<ParallelGroup, CompositionError> {
        if self.branches.is_empty() {
            return Err(CompositionError::empty(format!("parallel group '{}'", self.id)));
        }

        let shapes: Vec<Shape> = self.branches.iter().map(|(_, s)| s.input_shape()).collect();
        let input_shape = Shape::combine_inputs(shapes.iter()).map_err(|e| {
            CompositionError::shape_mismatch(&self.id, &self.id, e.to_string())
                .with_stages(self.branches.iter().map(|(_, s)| s.id().to_string()).collect())
        })?;

        Ok(ParallelGroup {
            id: self.id,
            branches: self.branches,
            policy: self.policy,
            mode: self.mode,
            input_shape,
        })
    }
}
