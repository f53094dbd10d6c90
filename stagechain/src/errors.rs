//! Error types for the stagechain framework.
//!
//! Errors fall into two families:
//!
//! - construction-time: [`CompositionError`] (and [`CycleDetectedError`]),
//!   raised while a pipeline is being built and never deferred to invocation;
//! - invocation-time: [`InvocationError`], wrapping either a
//!   [`StageExecutionError`] or a [`MergeError`], raised per call and always
//!   carrying the path of the failing stage.
//!
//! [`ChainError`] unifies both for callers that build and invoke in one place.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// The umbrella error type for stagechain operations.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// The pipeline graph is malformed.
    #[error("{0}")]
    Composition(#[from] CompositionError),

    /// A stage's function or capability call failed.
    #[error("{0}")]
    StageExecution(#[from] StageExecutionError),

    /// Every branch of a collect-all parallel group failed.
    #[error("{0}")]
    Merge(#[from] MergeError),
}

impl From<InvocationError> for ChainError {
    fn from(err: InvocationError) -> Self {
        match err {
            InvocationError::StageExecution(e) => Self::StageExecution(e),
            InvocationError::Merge(e) => Self::Merge(e),
        }
    }
}

impl From<CycleDetectedError> for ChainError {
    fn from(err: CycleDetectedError) -> Self {
        Self::Composition(err.into())
    }
}

/// Metadata about a contract error for better diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ContractErrorInfo {
    /// Error code (e.g., "COMPOSE-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ContractErrorInfo {
    /// Creates a new contract error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code));
        map.insert("summary".to_string(), serde_json::json!(self.summary));
        if let Some(ref hint) = self.fix_hint {
            map.insert("fix_hint".to_string(), serde_json::json!(hint));
        }
        if !self.context.is_empty() {
            map.insert("context".to_string(), serde_json::json!(self.context));
        }
        map
    }
}

/// The category of a [`CompositionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompositionErrorKind {
    /// A stage feeds its own input, directly or transitively.
    Cycle,
    /// Two branches of one parallel group share a name.
    DuplicateBranch,
    /// Adjacent stages disagree on the shape of the value passed between them.
    ShapeMismatch,
    /// A pipeline, group or branch set has nothing in it.
    Empty,
    /// A pipeline, stage or branch name is blank or otherwise unusable.
    InvalidName,
    /// A prompt template could not be parsed.
    Template,
}

/// Error raised when a pipeline graph is malformed.
///
/// Always raised by constructors and builders, never by `invoke`.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CompositionError {
    /// The category of the error.
    pub kind: CompositionErrorKind,
    /// The error message.
    pub message: String,
    /// The stages involved in the error.
    pub stages: Vec<String>,
    /// Optional contract error info.
    pub error_info: Option<ContractErrorInfo>,
}

impl CompositionError {
    /// Creates a new composition error.
    #[must_use]
    pub fn new(kind: CompositionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stages: Vec::new(),
            error_info: None,
        }
    }

    /// Sets the stages involved.
    #[must_use]
    pub fn with_stages(mut self, stages: Vec<String>) -> Self {
        self.stages = stages;
        self
    }

    /// Sets the contract error info.
    #[must_use]
    pub fn with_error_info(mut self, info: ContractErrorInfo) -> Self {
        self.error_info = Some(info);
        self
    }

    /// A parallel group received two branches with the same name.
    #[must_use]
    pub fn duplicate_branch(group: &str, branch: &str) -> Self {
        Self::new(
            CompositionErrorKind::DuplicateBranch,
            format!("Parallel group '{group}' already has a branch named '{branch}'"),
        )
        .with_stages(vec![group.to_string(), branch.to_string()])
        .with_error_info(
            ContractErrorInfo::new(
                "COMPOSE-DUPLICATE-BRANCH",
                format!("Branch '{branch}' is declared twice"),
            )
            .with_fix_hint("Branch names key the merged output and must be unique within a group."),
        )
    }

    /// The output of `upstream` does not satisfy the input contract of `downstream`.
    #[must_use]
    pub fn shape_mismatch(upstream: &str, downstream: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            CompositionErrorKind::ShapeMismatch,
            format!("Stage '{downstream}' cannot consume the output of '{upstream}': {detail}"),
        )
        .with_stages(vec![upstream.to_string(), downstream.to_string()])
        .with_error_info(
            ContractErrorInfo::new("COMPOSE-SHAPE-MISMATCH", detail)
                .with_context_entry("upstream", upstream)
                .with_context_entry("downstream", downstream)
                .with_fix_hint(
                    "Insert a transform stage that reshapes the value, or thread the missing key through with Assign.",
                ),
        )
    }

    /// Something that needs at least one member has none.
    #[must_use]
    pub fn empty(what: impl Into<String>) -> Self {
        let what = what.into();
        Self::new(CompositionErrorKind::Empty, format!("{what} has no stages"))
            .with_stages(vec![what])
            .with_error_info(
                ContractErrorInfo::new("COMPOSE-EMPTY", "Cannot build an empty composition")
                    .with_fix_hint("Add at least one stage before building."),
            )
    }

    /// A name is blank or otherwise rejected.
    #[must_use]
    pub fn invalid_name(what: &str, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self::new(
            CompositionErrorKind::InvalidName,
            format!("Invalid {what} name: {reason}"),
        )
        .with_error_info(ContractErrorInfo::new("COMPOSE-INVALID-NAME", reason))
    }

    /// A prompt template is malformed.
    #[must_use]
    pub fn template(stage: &str, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            CompositionErrorKind::Template,
            format!("Prompt template '{stage}' is invalid: {detail}"),
        )
        .with_stages(vec![stage.to_string()])
        .with_error_info(
            ContractErrorInfo::new("COMPOSE-TEMPLATE", detail)
                .with_fix_hint("Placeholders are written {name}; write {{ and }} for literal braces."),
        )
    }

    /// Returns the error code, if any.
    #[must_use]
    pub fn code(&self) -> Option<&str> {
        self.error_info.as_ref().map(|info| info.code.as_str())
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("kind".to_string(), serde_json::json!(self.kind));
        map.insert("message".to_string(), serde_json::json!(self.message));
        map.insert("stages".to_string(), serde_json::json!(self.stages));
        if let Some(ref info) = self.error_info {
            map.insert("error_info".to_string(), serde_json::json!(info.to_dict()));
        }
        map
    }
}

/// Error raised when a cycle is detected in the pipeline graph.
#[derive(Debug, Clone, Error)]
#[error("Cycle detected in pipeline: {}", .cycle_path.join(" -> "))]
pub struct CycleDetectedError {
    /// The path of stages forming the cycle.
    pub cycle_path: Vec<String>,
    /// Contract error info.
    pub error_info: ContractErrorInfo,
}

impl CycleDetectedError {
    /// Creates a new cycle detected error.
    #[must_use]
    pub fn new(cycle_path: Vec<String>) -> Self {
        let info = ContractErrorInfo::new(
            "COMPOSE-CYCLE",
            format!("Stage graph feeds back into itself: {}", cycle_path.join(" -> ")),
        )
        .with_fix_hint("A stage may not contain itself; share the stage without nesting it inside its own output.");

        Self {
            cycle_path,
            error_info: info,
        }
    }
}

impl From<CycleDetectedError> for CompositionError {
    fn from(err: CycleDetectedError) -> Self {
        Self {
            kind: CompositionErrorKind::Cycle,
            message: err.to_string(),
            stages: err.cycle_path.clone(),
            error_info: Some(err.error_info),
        }
    }
}

/// Errors reported by external capabilities (models, retrievers, embedders).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CapabilityError {
    /// The collaborator refused the call because of rate limiting.
    #[error("{capability}: rate limited")]
    RateLimited {
        /// The capability name.
        capability: String,
        /// Suggested wait before retrying, if the collaborator reported one.
        retry_after_ms: Option<u64>,
    },

    /// The call did not finish in time.
    #[error("{capability}: timed out after {timeout_ms}ms")]
    Timeout {
        /// The capability name.
        capability: String,
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The collaborator answered with something that could not be understood.
    #[error("{capability}: malformed response - {reason}")]
    MalformedResponse {
        /// The capability name.
        capability: String,
        /// What was wrong with the response.
        reason: String,
    },

    /// The collaborator could not be reached.
    #[error("{capability}: unavailable - {reason}")]
    Unavailable {
        /// The capability name.
        capability: String,
        /// The reason.
        reason: String,
    },

    /// The collaborator rejected the request itself.
    #[error("{capability}: request rejected - {reason}")]
    Rejected {
        /// The capability name.
        capability: String,
        /// The reason.
        reason: String,
    },
}

impl CapabilityError {
    /// Creates a rate limited error.
    #[must_use]
    pub fn rate_limited(capability: impl Into<String>) -> Self {
        Self::RateLimited {
            capability: capability.into(),
            retry_after_ms: None,
        }
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(capability: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            capability: capability.into(),
            timeout_ms,
        }
    }

    /// Creates a malformed response error.
    #[must_use]
    pub fn malformed(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedResponse {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    /// Creates an unavailable error.
    #[must_use]
    pub fn unavailable(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    /// Creates a rejected error.
    #[must_use]
    pub fn rejected(capability: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            capability: capability.into(),
            reason: reason.into(),
        }
    }

    /// Returns the name of the capability that failed.
    #[must_use]
    pub fn capability(&self) -> &str {
        match self {
            Self::RateLimited { capability, .. }
            | Self::Timeout { capability, .. }
            | Self::MalformedResponse { capability, .. }
            | Self::Unavailable { capability, .. }
            | Self::Rejected { capability, .. } => capability,
        }
    }

    /// Returns true if repeating the same call may succeed.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Timeout { .. } | Self::Unavailable { .. }
        )
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();

        let kind = match self {
            Self::RateLimited { retry_after_ms, .. } => {
                if let Some(ms) = retry_after_ms {
                    map.insert("retry_after_ms".to_string(), serde_json::json!(ms));
                }
                "RateLimited"
            }
            Self::Timeout { timeout_ms, .. } => {
                map.insert("timeout_ms".to_string(), serde_json::json!(timeout_ms));
                "Timeout"
            }
            Self::MalformedResponse { reason, .. } => {
                map.insert("reason".to_string(), serde_json::json!(reason));
                "MalformedResponse"
            }
            Self::Unavailable { reason, .. } => {
                map.insert("reason".to_string(), serde_json::json!(reason));
                "Unavailable"
            }
            Self::Rejected { reason, .. } => {
                map.insert("reason".to_string(), serde_json::json!(reason));
                "Rejected"
            }
        };

        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("capability".to_string(), serde_json::json!(self.capability()));
        map.insert("retryable".to_string(), serde_json::json!(self.is_retryable()));
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Why a single stage failed.
#[derive(Debug, Clone, Error)]
pub enum StageFailure {
    /// The wrapped function returned an error.
    #[error("{0}")]
    Function(String),

    /// The external capability reported an error.
    #[error("{0}")]
    Capability(#[from] CapabilityError),

    /// The input value did not satisfy the stage's input contract.
    #[error("input contract violated: {0}")]
    InputContract(String),

    /// A parser could not make sense of its input.
    #[error("output parsing failed: {0}")]
    Parse(String),

    /// The stage task panicked.
    #[error("stage panicked: {0}")]
    Panicked(String),
}

fn fmt_path(path: &[String]) -> String {
    format!("[{}]", path.join(", "))
}

fn fmt_pipeline(pipeline: &Option<String>) -> String {
    pipeline
        .as_ref()
        .map(|name| format!("pipeline '{name}': "))
        .unwrap_or_default()
}

/// A stage's function or capability call failed.
#[derive(Debug, Clone, Error)]
#[error(
    "{}stage '{stage_id}' failed at {}: {cause}",
    fmt_pipeline(.pipeline),
    fmt_path(.path)
)]
pub struct StageExecutionError {
    /// Identifier of the leaf stage that failed.
    pub stage_id: String,
    /// Route from the outermost composite down to the failing stage,
    /// e.g. `["branch:sentiment", "parser"]`.
    pub path: Vec<String>,
    /// Index of the failing step within its innermost sequence.
    pub position: Option<usize>,
    /// Name of the top-level pipeline, attached by the invoker.
    pub pipeline: Option<String>,
    /// The underlying failure.
    pub cause: StageFailure,
}

impl StageExecutionError {
    /// Creates a new stage execution error whose path is just the stage itself.
    #[must_use]
    pub fn new(stage_id: impl Into<String>, cause: impl Into<StageFailure>) -> Self {
        let stage_id = stage_id.into();
        Self {
            path: vec![stage_id.clone()],
            stage_id,
            position: None,
            pipeline: None,
            cause: cause.into(),
        }
    }

    /// Shorthand for a [`StageFailure::Function`] error.
    #[must_use]
    pub fn function(stage_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage_id, StageFailure::Function(message.into()))
    }

    /// Shorthand for a [`StageFailure::InputContract`] error.
    #[must_use]
    pub fn input_contract(stage_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage_id, StageFailure::InputContract(message.into()))
    }

    /// Shorthand for a [`StageFailure::Parse`] error.
    #[must_use]
    pub fn parse(stage_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(stage_id, StageFailure::Parse(message.into()))
    }
}

/// One failed branch of a parallel group.
#[derive(Debug, Clone)]
pub struct BranchError {
    /// Branch name.
    pub branch: String,
    /// The branch's error, with a path relative to the group.
    pub error: InvocationError,
}

/// Every branch of a collect-all parallel group failed.
#[derive(Debug, Clone, Error)]
#[error(
    "{}all {} branches of parallel group '{group}' failed at {}",
    fmt_pipeline(.pipeline),
    .failures.len(),
    fmt_path(.path)
)]
pub struct MergeError {
    /// Identifier of the parallel group.
    pub group: String,
    /// Route from the outermost composite down to the group.
    pub path: Vec<String>,
    /// Index of the group within its innermost sequence.
    pub position: Option<usize>,
    /// Name of the top-level pipeline, attached by the invoker.
    pub pipeline: Option<String>,
    /// The per-branch errors, in branch declaration order.
    pub failures: Vec<BranchError>,
}

impl MergeError {
    /// Creates a new merge error.
    #[must_use]
    pub fn new(group: impl Into<String>, failures: Vec<BranchError>) -> Self {
        let group = group.into();
        Self {
            path: vec![group.clone()],
            group,
            position: None,
            pipeline: None,
            failures,
        }
    }

    /// Returns the names of the failed branches.
    #[must_use]
    pub fn branch_names(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.branch.as_str()).collect()
    }
}

/// An error raised while a pipeline is being invoked.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    /// A stage failed.
    #[error(transparent)]
    StageExecution(#[from] StageExecutionError),

    /// A collect-all parallel group lost every branch.
    #[error(transparent)]
    Merge(#[from] MergeError),
}

impl InvocationError {
    /// Returns the route to the failing stage or group.
    #[must_use]
    pub fn path(&self) -> &[String] {
        match self {
            Self::StageExecution(e) => &e.path,
            Self::Merge(e) => &e.path,
        }
    }

    /// Returns the identifier of the failing stage or group.
    #[must_use]
    pub fn stage_id(&self) -> &str {
        match self {
            Self::StageExecution(e) => &e.stage_id,
            Self::Merge(e) => &e.group,
        }
    }

    /// Returns the position within the innermost sequence, if tagged.
    #[must_use]
    pub fn position(&self) -> Option<usize> {
        match self {
            Self::StageExecution(e) => e.position,
            Self::Merge(e) => e.position,
        }
    }

    /// Returns the top-level pipeline name, if attached.
    #[must_use]
    pub fn pipeline(&self) -> Option<&str> {
        match self {
            Self::StageExecution(e) => e.pipeline.as_deref(),
            Self::Merge(e) => e.pipeline.as_deref(),
        }
    }

    /// Prepends a path segment (e.g. `branch:summary`).
    #[must_use]
    pub fn within(mut self, segment: impl Into<String>) -> Self {
        let path = match &mut self {
            Self::StageExecution(e) => &mut e.path,
            Self::Merge(e) => &mut e.path,
        };
        path.insert(0, segment.into());
        self
    }

    /// Prepends several path segments, outermost first.
    #[must_use]
    pub fn within_all(mut self, segments: &[String]) -> Self {
        for segment in segments.iter().rev() {
            self = self.within(segment.clone());
        }
        self
    }

    /// Tags the error with its position in a sequence unless already tagged.
    #[must_use]
    pub fn at_position(mut self, index: usize) -> Self {
        let position = match &mut self {
            Self::StageExecution(e) => &mut e.position,
            Self::Merge(e) => &mut e.position,
        };
        position.get_or_insert(index);
        self
    }

    /// Attaches the top-level pipeline name unless already attached.
    #[must_use]
    pub fn in_pipeline(mut self, name: &str) -> Self {
        let pipeline = match &mut self {
            Self::StageExecution(e) => &mut e.pipeline,
            Self::Merge(e) => &mut e.pipeline,
        };
        if pipeline.is_none() {
            *pipeline = Some(name.to_string());
        }
        self
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        let kind = match self {
            Self::StageExecution(_) => "StageExecutionError",
            Self::Merge(e) => {
                map.insert(
                    "failed_branches".to_string(),
                    serde_json::json!(e.branch_names()),
                );
                "MergeError"
            }
        };
        map.insert("type".to_string(), serde_json::json!(kind));
        map.insert("stage".to_string(), serde_json::json!(self.stage_id()));
        map.insert("path".to_string(), serde_json::json!(self.path()));
        if let Some(position) = self.position() {
            map.insert("position".to_string(), serde_json::json!(position));
        }
        if let Some(pipeline) = self.pipeline() {
            map.insert("pipeline".to_string(), serde_json::json!(pipeline));
        }
        map.insert("message".to_string(), serde_json::json!(self.to_string()));
        map
    }
}

/// Provides default suggestions for common contract error codes.
pub struct ContractSuggestions;

impl ContractSuggestions {
    /// Gets a suggestion for a given error code.
    #[must_use]
    pub fn get(code: &str) -> Option<&'static str> {
        match code {
            "COMPOSE-CYCLE" => Some(
                "Check composite stages for self-references. \
                 Every value a stage needs must arrive through its input.",
            ),
            "COMPOSE-DUPLICATE-BRANCH" => Some(
                "Rename one of the branches; the merged output is keyed by branch name.",
            ),
            "COMPOSE-SHAPE-MISMATCH" => Some(
                "Compare the upstream output shape with the downstream input shape. \
                 Keys required downstream must be guaranteed upstream.",
            ),
            "COMPOSE-EMPTY" => Some("Add at least one stage before building."),
            "COMPOSE-INVALID-NAME" => Some("Use a non-blank name."),
            "COMPOSE-TEMPLATE" => Some(
                "Check placeholder syntax: {name} for variables, {{ and }} for literal braces.",
            ),
            _ => None,
        }
    }
}
