//! Stages that forward their input to an external capability.
//!
//! Each adapter holds a shared handle to its collaborator and any call
//! parameters it needs; nothing is read from ambient state.

use super::Stage;
use crate::capabilities::{Capability, ChatMessage, ChatModel, ChatRequest, Embedder, Retriever};
use crate::config::ModelParams;
use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::core::StageKind;
use crate::errors::{InvocationError, StageExecutionError};
use async_trait::async_trait;
use serde::Deserialize as _;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Calls a generic [`Capability`] with the stage input as the request.
pub struct CapabilityStage {
    id: String,
    capability: Arc<dyn Capability>,
}

impl CapabilityStage {
    /// Creates a capability stage.
    #[must_use]
    pub fn new(id: impl Into<String>, capability: Arc<dyn Capability>) -> Self {
        Self {
            id: id.into(),
            capability,
        }
    }
}

impl fmt::Debug for CapabilityStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityStage")
            .field("id", &self.id)
            .field("capability", &self.capability.name())
            .finish()
    }
}

#[async_trait]
impl Stage for CapabilityStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Capability
    }

    fn input_shape(&self) -> Shape {
        self.capability.request_shape()
    }

    fn output_shape(&self) -> Shape {
        self.capability.response_shape()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        self.capability
            .request(input.clone())
            .await
            .map_err(|e| StageExecutionError::new(&self.id, e).into())
    }
}

/// Calls a [`ChatModel`].
///
/// Accepts either a bare string (sent as one human message) or an array of
/// `{role, content}` messages, and produces an assistant message object
/// `{role, content, model}`.
pub struct ModelStage {
    id: String,
    model: Arc<dyn ChatModel>,
    params: ModelParams,
}

impl ModelStage {
    /// Creates a model stage with the collaborator's default parameters.
    #[must_use]
    pub fn new(id: impl Into<String>, model: Arc<dyn ChatModel>) -> Self {
        Self {
            id: id.into(),
            model,
            params: ModelParams::default(),
        }
    }

    /// Sets the call parameters.
    #[must_use]
    pub fn with_params(mut self, params: ModelParams) -> Self {
        self.params = params;
        self
    }

    fn messages_from(&self, input: &Value) -> Result<Vec<ChatMessage>, StageExecutionError> {
        match input {
            Value::String(text) => Ok(vec![ChatMessage::human(text.clone())]),
            Value::Array(_) => Vec::<ChatMessage>::deserialize(input).map_err(|e| {
                StageExecutionError::input_contract(&self.id, format!("invalid chat messages: {e}"))
            }),
            other => Err(StageExecutionError::input_contract(
                &self.id,
                format!("expected a prompt string or chat messages, got {other}"),
            )),
        }
    }
}

impl fmt::Debug for ModelStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelStage")
            .field("id", &self.id)
            .field("model", &self.model.model_name())
            .field("params", &self.params)
            .finish()
    }
}

#[async_trait]
impl Stage for ModelStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Model
    }

    fn input_shape(&self) -> Shape {
        Shape::one_of(vec![
            Shape::String,
            Shape::array_of(Shape::object(["role", "content"])),
        ])
    }

    fn output_shape(&self) -> Shape {
        Shape::object(["role", "content", "model"])
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let messages = self.messages_from(input)?;
        let request = ChatRequest::new(messages).with_params(self.params.clone());

        let response = self
            .model
            .complete(request)
            .await
            .map_err(|e| StageExecutionError::new(&self.id, e))?;

        debug!(
            stage = %self.id,
            model = %response.model,
            total_tokens = response.total_tokens(),
            "Model call completed"
        );

        let mut message = serde_json::json!({
            "role": "assistant",
            "content": response.content,
            "model": response.model,
        });
        if response.input_tokens.is_some() || response.output_tokens.is_some() {
            message["usage"] = serde_json::json!({
                "input_tokens": response.input_tokens,
                "output_tokens": response.output_tokens,
            });
        }
        Ok(message)
    }
}

/// Calls a [`Retriever`] with a query string and produces an array of
/// `{page_content, metadata}` documents.
pub struct RetrieverStage {
    id: String,
    retriever: Arc<dyn Retriever>,
}

impl RetrieverStage {
    /// Creates a retriever stage.
    #[must_use]
    pub fn new(id: impl Into<String>, retriever: Arc<dyn Retriever>) -> Self {
        Self {
            id: id.into(),
            retriever,
        }
    }
}

impl fmt::Debug for RetrieverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetrieverStage")
            .field("id", &self.id)
            .field("retriever", &self.retriever.name())
            .finish()
    }
}

#[async_trait]
impl Stage for RetrieverStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Retriever
    }

    fn input_shape(&self) -> Shape {
        Shape::String
    }

    fn output_shape(&self) -> Shape {
        Shape::array_of(Shape::object(["page_content", "metadata"]))
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let query = input.as_str().ok_or_else(|| {
            StageExecutionError::input_contract(&self.id, "expected a query string")
        })?;

        let documents = self
            .retriever
            .retrieve(query)
            .await
            .map_err(|e| StageExecutionError::new(&self.id, e))?;

        serde_json::to_value(documents)
            .map_err(|e| StageExecutionError::function(&self.id, e.to_string()).into())
    }
}

/// Calls an [`Embedder`].
///
/// A string input yields one vector; an array of strings yields one vector
/// per element.
pub struct EmbeddingStage {
    id: String,
    embedder: Arc<dyn Embedder>,
}

impl EmbeddingStage {
    /// Creates an embedding stage.
    #[must_use]
    pub fn new(id: impl Into<String>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            id: id.into(),
            embedder,
        }
    }
}

impl fmt::Debug for EmbeddingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingStage")
            .field("id", &self.id)
            .field("embedder", &self.embedder.name())
            .finish()
    }
}

#[async_trait]
impl Stage for EmbeddingStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Embedding
    }

    fn input_shape(&self) -> Shape {
        Shape::one_of(vec![Shape::String, Shape::array_of(Shape::String)])
    }

    fn output_shape(&self) -> Shape {
        Shape::array_of(Shape::Any)
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let (texts, single) = match input {
            Value::String(text) => (vec![text.clone()], true),
            Value::Array(items) => {
                let texts = items
                    .iter()
                    .map(|item| item.as_str().map(str::to_string))
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| {
                        StageExecutionError::input_contract(&self.id, "expected an array of strings")
                    })?;
                (texts, false)
            }
            _ => {
                return Err(StageExecutionError::input_contract(
                    &self.id,
                    "expected a string or an array of strings",
                )
                .into())
            }
        };

        let mut vectors = self
            .embedder
            .embed(&texts)
            .await
            .map_err(|e| StageExecutionError::new(&self.id, e))?;

        if vectors.len() != texts.len() {
            return Err(StageExecutionError::new(
                &self.id,
                crate::errors::CapabilityError::malformed(
                    self.embedder.name(),
                    format!("{} vectors for {} texts", vectors.len(), texts.len()),
                ),
            )
            .into());
        }

        if single {
            Ok(serde_json::json!(vectors.remove(0)))
        } else {
            Ok(serde_json::json!(vectors))
        }
    }
}
