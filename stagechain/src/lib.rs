//! # Stagechain
//!
//! Composable pipelines of prompt, model, parser and transform stages.
//!
//! Stagechain provides a small algebra for building model-backed workflows:
//!
//! - **Sequences**: stages applied in order, associative by construction
//! - **Parallel groups**: named branches over one input, merged into an object
//! - **Assign and branch**: accumulate keys, or route by predicate
//! - **Contracts**: adjacent stages are shape-checked when composed
//! - **Invocation**: single or batched runs with path-carrying errors
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use serde_json::json;
//! use stagechain::prelude::*;
//! use std::sync::Arc;
//!
//! let pipeline = PipelineBuilder::new("essay")
//!     .then(Arc::new(PromptTemplate::new("prompt", "Write about {topic}")?))?
//!     .then(Arc::new(ModelStage::new("llm", model)))?
//!     .then(Arc::new(StrOutputParser::default()))?
//!     .build()?;
//!
//! let result = pipeline.invoke(json!({"topic": "AI"})).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod capabilities;
pub mod config;
pub mod context;
pub mod contracts;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod pipeline;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capabilities::{
        Capability, ChatMessage, ChatModel, ChatRequest, Document, Embedder, ModelResponse,
        Retriever, RetryConfig, RetryingChatModel, Role,
    };
    pub use crate::config::{InvokerConfig, ModelParams, TracingConfig};
    pub use crate::context::InvocationContext;
    pub use crate::contracts::{parse_as, Shape, TypedOutput, ValidationError};
    pub use crate::core::StageKind;
    pub use crate::errors::{
        CapabilityError, ChainError, CompositionError, CompositionErrorKind, InvocationError,
        MergeError, StageExecutionError, StageFailure,
    };
    pub use crate::events::{CollectingEventSink, EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        Assign, BatchOutcome, Branch, BranchFailure, ExecutionMode, InvocationResult,
        MergePolicy, ParallelGroup, Pipeline, PipelineBuilder, Sequence,
    };
    pub use crate::stages::{
        constant, passthrough, pluck, AsyncFnStage, CapabilityStage, ChatPromptTemplate,
        EmbeddingStage, FnStage, JsonOutputParser, ModelStage, PromptTemplate, RetrieverStage,
        Stage, StrOutputParser, StructuredOutputParser, StuffDocuments,
    };
}
