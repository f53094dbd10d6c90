//! Prompt formatting stages.
//!
//! Templates use `{name}` placeholders; `{{` and `}}` produce literal
//! braces. Templates are parsed when the stage is built, so a malformed
//! template is a [`CompositionError`], not an invocation failure.

use super::Stage;
use crate::capabilities::{ChatMessage, Role};
use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::core::StageKind;
use crate::errors::{CompositionError, InvocationError, StageExecutionError};
use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

/// Matches:
/// - `{{` and `}}` (escaped braces)
/// - `{name}` (placeholder, name in capture group 1)
/// - a lone `{` or `}` (malformed)
#[allow(clippy::expect_used)]
static TOKEN_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?x)
        \{\{ | \}\}          # escapes
        |
        \{ ([^{}]*) \}       # placeholder
        |
        [{}]                 # unmatched brace
        ",
    )
    .expect("Invalid regex pattern")
});

#[allow(clippy::expect_used)]
static NAME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex pattern"));

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Variable(String),
}

/// A parsed template string.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Template {
    segments: Vec<Segment>,
}

impl Template {
    fn parse(stage: &str, text: &str) -> Result<Self, CompositionError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut last = 0;

        for caps in TOKEN_PATTERN.captures_iter(text) {
            let Some(token) = caps.get(0) else { continue };
            literal.push_str(&text[last..token.start()]);
            last = token.end();

            match token.as_str() {
                "{{" => literal.push('{'),
                "}}" => literal.push('}'),
                "{" | "}" => {
                    return Err(CompositionError::template(
                        stage,
                        format!("unmatched '{}' at byte {}", token.as_str(), token.start()),
                    ))
                }
                _ => {
                    let name = caps.get(1).map_or("", |m| m.as_str()).trim();
                    if !NAME_PATTERN.is_match(name) {
                        return Err(CompositionError::template(
                            stage,
                            format!("'{{{name}}}' is not a valid placeholder"),
                        ));
                    }
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Variable(name.to_string()));
                }
            }
        }
        literal.push_str(&text[last..]);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Ok(Self { segments })
    }

    fn variables(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Variable(name) => Some(name.as_str()),
            Segment::Literal(_) => None,
        })
    }

    fn render(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<String, String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Variable(name) => {
                    let value = lookup(name).ok_or_else(|| format!("missing variable '{name}'"))?;
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Resolves template variables from a stage input.
///
/// An object input binds by key. Any other input binds to the single open
/// variable, if there is exactly one.
struct Bindings<'a> {
    input: &'a Value,
    partials: &'a BTreeMap<String, String>,
    single: Option<&'a str>,
}

impl Bindings<'_> {
    fn get(&self, name: &str) -> Option<String> {
        if let Value::Object(map) = self.input {
            if let Some(value) = map.get(name) {
                return Some(render_value(value));
            }
        } else if self.single == Some(name) {
            return Some(render_value(self.input));
        }
        self.partials.get(name).cloned()
    }
}

fn input_shape_for(open: &BTreeSet<String>) -> Shape {
    match open.len() {
        0 => Shape::Any,
        1 => Shape::one_of(vec![Shape::String, Shape::object(open.iter().cloned())]),
        _ => Shape::object(open.iter().cloned()),
    }
}

fn check_bindable(stage: &str, input: &Value, open: &BTreeSet<String>) -> Result<(), StageExecutionError> {
    match input {
        Value::Object(_) => Ok(()),
        _ if open.len() == 1 => Ok(()),
        _ if open.is_empty() => Ok(()),
        other => Err(StageExecutionError::input_contract(
            stage,
            format!(
                "template needs variables {:?} but received {other}",
                open.iter().collect::<Vec<_>>()
            ),
        )),
    }
}

/// Renders a string template from the input.
#[derive(Debug, Clone)]
pub struct PromptTemplate {
    id: String,
    template: Template,
    partials: BTreeMap<String, String>,
}

impl PromptTemplate {
    /// Parses `template` into a prompt stage.
    pub fn new(id: impl Into<String>, template: &str) -> Result<Self, CompositionError> {
        let id = id.into();
        let template = Template::parse(&id, template)?;
        Ok(Self {
            id,
            template,
            partials: BTreeMap::new(),
        })
    }

    /// Pre-fills a variable; the input may still override it.
    #[must_use]
    pub fn partial(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.partials.insert(name.into(), value.into());
        self
    }

    /// Returns the distinct variables of the template, sorted.
    #[must_use]
    pub fn variables(&self) -> BTreeSet<String> {
        self.template.variables().map(str::to_string).collect()
    }

    /// Returns the variables the input must supply.
    #[must_use]
    pub fn open_variables(&self) -> BTreeSet<String> {
        self.template
            .variables()
            .filter(|name| !self.partials.contains_key(*name))
            .map(str::to_string)
            .collect()
    }

    /// Renders the template against an input value.
    pub fn format(&self, input: &Value) -> Result<String, StageExecutionError> {
        let open = self.open_variables();
        check_bindable(&self.id, input, &open)?;
        let bindings = Bindings {
            input,
            partials: &self.partials,
            single: open.iter().next().filter(|_| open.len() == 1).map(String::as_str),
        };
        self.template
            .render(|name| bindings.get(name))
            .map_err(|e| StageExecutionError::input_contract(&self.id, e))
    }
}

#[async_trait]
impl Stage for PromptTemplate {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Prompt
    }

    fn input_shape(&self) -> Shape {
        input_shape_for(&self.open_variables())
    }

    fn output_shape(&self) -> Shape {
        Shape::String
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        Ok(Value::String(self.format(input)?))
    }
}

/// Renders a list of role-tagged templates into chat messages.
#[derive(Debug, Clone)]
pub struct ChatPromptTemplate {
    id: String,
    messages: Vec<(Role, Template)>,
    partials: BTreeMap<String, String>,
}

impl ChatPromptTemplate {
    /// Parses every message template.
    pub fn new(id: impl Into<String>, messages: &[(Role, &str)]) -> Result<Self, CompositionError> {
        let id = id.into();
        if messages.is_empty() {
            return Err(CompositionError::empty(format!("chat prompt '{id}'")));
        }
        let messages = messages
            .iter()
            .map(|(role, text)| Template::parse(&id, text).map(|t| (*role, t)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            id,
            messages,
            partials: BTreeMap::new(),
        })
    }

    /// Pre-fills a variable; the input may still override it.
    #[must_use]
    pub fn partial(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.partials.insert(name.into(), value.into());
        self
    }

    /// Returns the variables the input must supply.
    #[must_use]
    pub fn open_variables(&self) -> BTreeSet<String> {
        self.messages
            .iter()
            .flat_map(|(_, t)| t.variables())
            .filter(|name| !self.partials.contains_key(*name))
            .map(str::to_string)
            .collect()
    }

    /// Renders every message against an input value.
    pub fn format_messages(&self, input: &Value) -> Result<Vec<ChatMessage>, StageExecutionError> {
        let open = self.open_variables();
        check_bindable(&self.id, input, &open)?;
        let bindings = Bindings {
            input,
            partials: &self.partials,
            single: open.iter().next().filter(|_| open.len() == 1).map(String::as_str),
        };
        self.messages
            .iter()
            .map(|(role, template)| {
                template
                    .render(|name| bindings.get(name))
                    .map(|content| ChatMessage::new(*role, content))
                    .map_err(|e| StageExecutionError::input_contract(&self.id, e))
            })
            .collect()
    }
}

#[async_trait]
impl Stage for ChatPromptTemplate {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Prompt
    }

    fn input_shape(&self) -> Shape {
        input_shape_for(&self.open_variables())
    }

    fn output_shape(&self) -> Shape {
        Shape::array_of(Shape::object(["role", "content"]))
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let messages = self.format_messages(input)?;
        serde_json::to_value(messages)
            .map_err(|e| StageExecutionError::function(&self.id, e.to_string()).into())
    }
}

/// Joins retrieved documents into one prompt variable, then formats.
///
/// The input is an object whose `document_variable` key holds an array of
/// `{page_content}` documents (or plain strings); every other template
/// variable is read from the same object.
#[derive(Debug, Clone)]
pub struct StuffDocuments {
    prompt: PromptTemplate,
    document_variable: String,
    separator: String,
}

impl StuffDocuments {
    /// Stuffs documents into `document_variable` of `prompt`.
    pub fn new(prompt: PromptTemplate, document_variable: impl Into<String>) -> Result<Self, CompositionError> {
        let document_variable = document_variable.into();
        if !prompt.variables().contains(&document_variable) {
            return Err(CompositionError::template(
                &prompt.id,
                format!("template has no '{{{document_variable}}}' placeholder for documents"),
            ));
        }
        Ok(Self {
            prompt,
            document_variable,
            separator: "\n\n".to_string(),
        })
    }

    /// Sets the separator placed between documents.
    #[must_use]
    pub fn with_separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    fn join_documents(&self, docs: &Value) -> Result<String, StageExecutionError> {
        let items = docs.as_array().ok_or_else(|| {
            StageExecutionError::input_contract(
                &self.prompt.id,
                format!("'{}' must be an array of documents", self.document_variable),
            )
        })?;
        let texts = items
            .iter()
            .map(|doc| match doc {
                Value::String(text) => Some(text.as_str()),
                other => other.get("page_content").and_then(Value::as_str),
            })
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                StageExecutionError::input_contract(
                    &self.prompt.id,
                    "documents must be strings or carry a string 'page_content'",
                )
            })?;
        Ok(texts.join(&self.separator))
    }
}

#[async_trait]
impl Stage for StuffDocuments {
    fn id(&self) -> &str {
        &self.prompt.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Prompt
    }

    fn input_shape(&self) -> Shape {
        let mut required = self.prompt.open_variables();
        required.insert(self.document_variable.clone());
        Shape::object(required)
    }

    fn output_shape(&self) -> Shape {
        Shape::String
    }

    async fn apply(&self, _ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let map = input.as_object().ok_or_else(|| {
            StageExecutionError::input_contract(&self.prompt.id, "expected an object input")
        })?;
        let docs = map.get(&self.document_variable).ok_or_else(|| {
            StageExecutionError::input_contract(
                &self.prompt.id,
                format!("missing key '{}'", self.document_variable),
            )
        })?;

        let mut bound: Map<String, Value> = map.clone();
        bound.insert(
            self.document_variable.clone(),
            Value::String(self.join_documents(docs)?),
        );
        Ok(Value::String(self.prompt.format(&Value::Object(bound))?))
    }
}
