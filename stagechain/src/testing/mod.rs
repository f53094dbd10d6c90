//! Testing utilities for stagechain pipelines.
//!
//! This module provides:
//! - Mock collaborators (chat model, retriever, embedder, capability)
//! - Instrumented stages for exercising composition behavior
//! - Assertions over invocation errors and results

mod assertions;
mod mocks;

pub use assertions::{assert_branch_failed, assert_failed_at, assert_not_partial};
pub use mocks::{
    CountingStage, EchoCapability, FailingStage, MockChatModel, MockEmbedder, SlowStage,
    StaticRetriever,
};
