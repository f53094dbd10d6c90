//! Mock collaborators and stages for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::capabilities::{
    Capability, ChatModel, ChatRequest, Document, Embedder, ModelResponse, Retriever,
};
use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::errors::{CapabilityError, InvocationError, StageExecutionError};
use crate::stages::Stage;

#[derive(Debug)]
enum Reply {
    Echo(String),
    Scripted(Mutex<VecDeque<String>>),
    Fail(CapabilityError),
    FailThen {
        failures: usize,
        error: CapabilityError,
        content: String,
    },
}

/// A chat model that echoes, replays a script, or always fails.
#[derive(Debug)]
pub struct MockChatModel {
    name: String,
    reply: Reply,
    calls: AtomicUsize,
    requests: Mutex<Vec<ChatRequest>>,
}

impl MockChatModel {
    fn with_reply(reply: Reply) -> Self {
        Self {
            name: "mock-model".to_string(),
            reply,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Replies with `prefix` followed by the last human message.
    #[must_use]
    pub fn echo(prefix: impl Into<String>) -> Self {
        Self::with_reply(Reply::Echo(prefix.into()))
    }

    /// Replies with each scripted answer in turn, then fails as unavailable.
    #[must_use]
    pub fn scripted<I, S>(replies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_reply(Reply::Scripted(Mutex::new(
            replies.into_iter().map(Into::into).collect(),
        )))
    }

    /// Fails every call with `error`.
    #[must_use]
    pub fn failing(error: CapabilityError) -> Self {
        Self::with_reply(Reply::Fail(error))
    }

    /// Fails the first `failures` calls with `error`, then replies with
    /// `content` on every later call.
    #[must_use]
    pub fn flaky(failures: usize, error: CapabilityError, content: impl Into<String>) -> Self {
        Self::with_reply(Reply::FailThen {
            failures,
            error,
            content: content.into(),
        })
    }

    /// Sets the reported model name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Returns the number of completed or failed calls.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Returns every request received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl ChatModel for MockChatModel {
    fn model_name(&self) -> &str {
        &self.name
    }

    async fn complete(&self, request: ChatRequest) -> Result<ModelResponse, CapabilityError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let last_human = request.last_human().unwrap_or_default().to_string();
        self.requests.lock().push(request);

        let content = match &self.reply {
            Reply::Echo(prefix) => format!("{prefix}{last_human}"),
            Reply::Scripted(script) => script
                .lock()
                .pop_front()
                .ok_or_else(|| CapabilityError::unavailable(&self.name, "script exhausted"))?,
            Reply::Fail(error) => return Err(error.clone()),
            Reply::FailThen { failures, error, .. } if call < *failures => return Err(error.clone()),
            Reply::FailThen { content, .. } => content.clone(),
        };
        Ok(ModelResponse::new(content, &self.name))
    }
}

/// A retriever that returns the same documents for every query.
#[derive(Debug)]
pub struct StaticRetriever {
    documents: Vec<Document>,
}

impl StaticRetriever {
    /// Creates a retriever over the given texts.
    #[must_use]
    pub fn new<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            documents: texts.into_iter().map(Document::new).collect(),
        }
    }
}

#[async_trait]
impl Retriever for StaticRetriever {
    fn name(&self) -> &str {
        "static-retriever"
    }

    async fn retrieve(&self, _query: &str) -> Result<Vec<Document>, CapabilityError> {
        Ok(self.documents.clone())
    }
}

/// A deterministic embedder: the same text always maps to the same vector.
#[derive(Debug)]
pub struct MockEmbedder {
    dimensions: usize,
}

impl MockEmbedder {
    /// Creates an embedder producing vectors of `dimensions` components.
    #[must_use]
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn name(&self) -> &str {
        "mock-embedder"
    }

    #[allow(clippy::cast_precision_loss)]
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, CapabilityError> {
        Ok(texts
            .iter()
            .map(|text| {
                let seed: usize = text.bytes().map(usize::from).sum();
                (0..self.dimensions)
                    .map(|i| ((seed + i) % 97) as f32 / 97.0)
                    .collect()
            })
            .collect())
    }
}

/// A capability that answers string requests with `prefix` + request.
#[derive(Debug)]
pub struct EchoCapability {
    name: String,
    prefix: String,
}

impl EchoCapability {
    /// Creates an echo capability.
    #[must_use]
    pub fn new(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
        }
    }
}

#[async_trait]
impl Capability for EchoCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_shape(&self) -> Shape {
        Shape::String
    }

    fn response_shape(&self) -> Shape {
        Shape::String
    }

    async fn request(&self, request: Value) -> Result<Value, CapabilityError> {
        match request {
            Value::String(text) => Ok(Value::String(format!("{}{text}", self.prefix))),
            other => Err(CapabilityError::rejected(
                &self.name,
                format!("expected a string request, got {other}"),
            )),
        }
    }
}

/// A passthrough stage that counts its invocations.
#[derive(Debug)]
pub struct CountingStage {
    id: String,
    calls: AtomicUsize,
}

impl CountingStage {
    /// Creates a counting stage.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            calls: AtomicUsize::new(0),
        }
    }

    /// Returns the number of times the stage was applied.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Stage for CountingStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        input.clone()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(input.clone())
    }
}

/// A stage that always fails.
#[derive(Debug)]
pub struct FailingStage {
    id: String,
    error: String,
}

impl FailingStage {
    /// Creates a new failing stage.
    #[must_use]
    pub fn new(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            error: error.into(),
        }
    }
}

#[async_trait]
impl Stage for FailingStage {
    fn id(&self) -> &str {
        &self.id
    }

    async fn apply(&self, _ctx: &InvocationContext, _input: &Value) -> Result<Value, InvocationError> {
        Err(StageExecutionError::function(&self.id, &self.error).into())
    }
}

/// A passthrough stage that sleeps first.
#[derive(Debug)]
pub struct SlowStage {
    id: String,
    delay: Duration,
}

impl SlowStage {
    /// Creates a new slow stage.
    #[must_use]
    pub fn new(id: impl Into<String>, delay: Duration) -> Self {
        Self {
            id: id.into(),
            delay,
        }
    }

    /// Creates a slow stage with delay in milliseconds.
    #[must_use]
    pub fn with_delay_ms(id: impl Into<String>, ms: u64) -> Self {
        Self::new(id, Duration::from_millis(ms))
    }
}

#[async_trait]
impl Stage for SlowStage {
    fn id(&self) -> &str {
        &self.id
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        input.clone()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        tokio::time::sleep(self.delay).await;
        Ok(input.clone())
    }
}
