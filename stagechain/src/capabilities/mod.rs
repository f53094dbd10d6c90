//! External capabilities invoked by stages.
//!
//! A capability is an opaque request/response collaborator: a chat model,
//! a retriever, an embedder, or anything else reachable through
//! [`Capability`]. The core never looks inside one; it only observes
//! success or a [`CapabilityError`](crate::errors::CapabilityError).
//!
//! Handles are shared as `Arc<dyn ...>` and must be safe for concurrent use
//! when the stage wrapping them sits inside a parallel group.

mod model;
mod retrieval;
pub mod retry;

pub use model::{ChatMessage, ChatModel, ChatRequest, ModelResponse, Role};
pub use retrieval::{Document, Embedder, Retriever};
pub use retry::{
    with_retry, with_retry_hinted, with_retry_when, BackoffStrategy, JitterStrategy, RetryConfig,
    RetryingChatModel,
};

use crate::contracts::Shape;
use crate::errors::CapabilityError;
use async_trait::async_trait;

/// A generic request/response collaborator.
#[async_trait]
pub trait Capability: Send + Sync {
    /// Returns the capability name used in errors and logs.
    fn name(&self) -> &str;

    /// Returns the contract of accepted requests.
    fn request_shape(&self) -> Shape {
        Shape::Any
    }

    /// Returns the contract of produced responses.
    fn response_shape(&self) -> Shape {
        Shape::Any
    }

    /// Performs one request.
    async fn request(&self, request: serde_json::Value) -> Result<serde_json::Value, CapabilityError>;
}
