//! Output parsers applied after a model call.

use super::Stage;
use crate::context::InvocationContext;
use crate::contracts::{Shape, TypedOutput};
use crate::core::StageKind;
use crate::errors::{InvocationError, StageExecutionError};
use async_trait::async_trait;
use regex::Regex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::fmt;
use std::marker::PhantomData;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static FENCE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^\s*```[A-Za-z0-9_-]*[ \t]*\n?(.*?)\s*```\s*$").expect("Invalid regex pattern")
});

fn text_shape() -> Shape {
    Shape::one_of(vec![Shape::String, Shape::object(["content"])])
}

/// Extracts the text of a model answer: a bare string, or the `content` of
/// a message object.
fn text_of<'a>(stage: &str, input: &'a Value) -> Result<&'a str, StageExecutionError> {
    match input {
        Value::String(text) => Ok(text),
        Value::Object(map) => map.get("content").and_then(Value::as_str).ok_or_else(|| {
            StageExecutionError::input_contract(stage, "message has no string 'content'")
        }),
        other => Err(StageExecutionError::input_contract(
            stage,
            format!("expected text or a message, got {other}"),
        )),
    }
}

/// Removes a surrounding Markdown code fence, if any.
fn strip_fences(text: &str) -> &str {
    FENCE_PATTERN
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map_or_else(|| text.trim(), |m| m.as_str())
}

/// Turns a model message (or string) into a plain string.
#[derive(Debug, Clone)]
pub struct StrOutputParser {
    id: String,
}

impl StrOutputParser {
    /// Creates a string parser.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

impl Default for StrOutputParser {
    fn default() -> Self {
        Self::new("str_output_parser")
    }
}

#[async_trait]
impl Stage for StrOutputParser {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn input_shape(&self) -> Shape {
        text_shape()
    }

    fn output_shape(&self) -> Shape {
        Shape::String
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        Ok(Value::String(text_of(&self.id, input)?.to_string()))
    }
}

/// Parses a model answer as JSON.
///
/// Markdown code fences around the payload are ignored. When required keys
/// are declared, the parsed value must be an object carrying all of them.
#[derive(Debug, Clone)]
pub struct JsonOutputParser {
    id: String,
    required: Vec<String>,
}

impl JsonOutputParser {
    /// Creates a JSON parser.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            required: Vec::new(),
        }
    }

    /// Requires the parsed object to carry `keys`.
    #[must_use]
    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Parses text into a JSON value.
    pub fn parse(&self, text: &str) -> Result<Value, StageExecutionError> {
        let value: Value = serde_json::from_str(strip_fences(text))
            .map_err(|e| StageExecutionError::parse(&self.id, format!("invalid JSON: {e}")))?;

        if !self.required.is_empty() {
            self.output_shape()
                .check_value(&value)
                .map_err(|e| StageExecutionError::parse(&self.id, e.to_string()))?;
        }
        Ok(value)
    }
}

#[async_trait]
impl Stage for JsonOutputParser {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn input_shape(&self) -> Shape {
        text_shape()
    }

    fn output_shape(&self) -> Shape {
        if self.required.is_empty() {
            Shape::Any
        } else {
            Shape::object(self.required.iter().cloned())
        }
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        Ok(self.parse(text_of(&self.id, input)?)?)
    }
}

/// Parses a model answer as JSON and validates it as `T`.
///
/// The output is `T` serialized back to a value, so fields unknown to `T`
/// are dropped and defaults are filled in.
pub struct StructuredOutputParser<T> {
    json: JsonOutputParser,
    output_shape: Shape,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StructuredOutputParser<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Creates a structured parser.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            json: JsonOutputParser::new(id),
            output_shape: Shape::Any,
            _marker: PhantomData,
        }
    }

    /// Declares the shape of `T` for composition checks.
    #[must_use]
    pub fn with_output_shape(mut self, shape: Shape) -> Self {
        self.output_shape = shape;
        self
    }

    /// Parses text into a `T`.
    pub fn parse_typed(&self, text: &str) -> Result<T, StageExecutionError> {
        let value = self.json.parse(text)?;
        TypedOutput::<T>::new()
            .from_value(value)
            .map_err(|e| StageExecutionError::parse(&self.json.id, e.to_string()))
    }
}

impl<T> fmt::Debug for StructuredOutputParser<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredOutputParser")
            .field("id", &self.json.id)
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

#[async_trait]
impl<T> Stage for StructuredOutputParser<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    fn id(&self) -> &str {
        &self.json.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Parser
    }

    fn input_shape(&self) -> Shape {
        text_shape()
    }

    fn output_shape(&self) -> Shape {
        self.output_shape.clone()
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let typed = self.parse_typed(text_of(&self.json.id, input)?)?;
        TypedOutput::<T>::new()
            .to_value(&typed)
            .map_err(|e| StageExecutionError::parse(&self.json.id, e.to_string()).into())
    }
}
