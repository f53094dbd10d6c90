//! Threading new keys into an object alongside what it already carries.

use super::failure::MergePolicy;
use super::parallel::ParallelGroup;
use crate::context::InvocationContext;
use crate::contracts::{ObjectShape, Shape};
use crate::core::StageKind;
use crate::errors::{CompositionError, InvocationError, StageExecutionError};
use crate::stages::Stage;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Runs a parallel group over an object and merges the branch outputs into
/// a copy of that object.
///
/// This is how later stages get at earlier results: instead of reaching for
/// a variable outside the pipeline, each step adds its result under a new
/// key and every later step reads it from its input.
///
/// A branch output replaces an input key of the same name.
#[derive(Debug, Clone)]
pub struct Assign {
    group: ParallelGroup,
}

impl Assign {
    /// Wraps `group`; its branches must accept an object input.
    pub fn new(group: ParallelGroup) -> Result<Self, CompositionError> {
        let shape = group.input_shape();
        if shape.is_any() || object_input(&shape).is_some() {
            Ok(Self { group })
        } else {
            Err(CompositionError::shape_mismatch(
                group.id(),
                group.id(),
                format!("assign needs object inputs but its branches expect {shape}"),
            ))
        }
    }

    /// Builds an assign from `(key, stage)` pairs with fail-fast merging.
    pub fn from_keys<I, S>(id: impl Into<String>, keys: I) -> Result<Self, CompositionError>
    where
        I: IntoIterator<Item = (S, Arc<dyn Stage>)>,
        S: Into<String>,
    {
        Self::new(ParallelGroup::from_branches(id, keys)?)
    }

    fn merged_shape(&self, base: ObjectShape) -> Shape {
        let ObjectShape {
            mut required,
            mut optional,
        } = base;
        for name in self.group.branch_names() {
            match self.group.policy() {
                MergePolicy::FailFast => {
                    optional.remove(name);
                    required.insert(name.to_string());
                }
                MergePolicy::CollectAll => {
                    if !required.contains(name) {
                        optional.insert(name.to_string());
                    }
                }
            }
        }
        Shape::Object(ObjectShape { required, optional })
    }
}

/// The object alternative of a branch input contract, if it has one.
fn object_input(shape: &Shape) -> Option<ObjectShape> {
    match shape {
        Shape::Object(known) => Some(known.clone()),
        Shape::OneOf { variants } => variants.iter().find_map(|v| match v {
            Shape::Object(known) => Some(known.clone()),
            _ => None,
        }),
        _ => None,
    }
}

#[async_trait]
impl Stage for Assign {
    fn id(&self) -> &str {
        self.group.id()
    }

    fn kind(&self) -> StageKind {
        StageKind::Assign
    }

    fn input_shape(&self) -> Shape {
        Shape::Object(object_input(&self.group.input_shape()).unwrap_or_default())
    }

    /// Without a known input object the carried-over keys are unknown, so
    /// nothing is promised.
    fn output_shape(&self) -> Shape {
        match object_input(&self.group.input_shape()) {
            Some(known) => self.merged_shape(known),
            None => Shape::Any,
        }
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        match input {
            Shape::Object(known) => self.merged_shape(known.clone()),
            _ => self.output_shape(),
        }
    }

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        self.group.children()
    }

    async fn apply(&self, ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let Value::Object(base) = input else {
            return Err(StageExecutionError::input_contract(
                self.id(),
                "assign expects an object input",
            )
            .into());
        };

        let added = self.group.apply(ctx, input).await?;

        let mut output = base.clone();
        if let Value::Object(added) = added {
            output.extend(added);
        }
        Ok(Value::Object(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::Sequence;
    use crate::stages::{pluck, FnStage, PromptTemplate};
    use crate::testing::FailingStage;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn word_count() -> Arc<dyn Stage> {
        Arc::new(
            FnStage::new("count", |v: &Value| {
                let text = v["text"].as_str().unwrap_or_default();
                Ok(json!(text.split_whitespace().count()))
            })
            .with_input_shape(Shape::object(["text"]))
            .with_output_shape(Shape::Number),
        )
    }

    #[tokio::test]
    async fn test_assign_keeps_input_keys() {
        let assign = Assign::from_keys("stats", [("words", word_count())]).unwrap();
        let ctx = InvocationContext::detached();

        let output = assign
            .apply(&ctx, &json!({"text": "one two three", "lang": "en"}))
            .await
            .unwrap();
        assert_eq!(output, json!({"text": "one two three", "lang": "en", "words": 3}));
        assert_eq!(assign.kind(), StageKind::Assign);
        assert_eq!(assign.output_shape(), Shape::object(["text", "words"]));
    }

    #[tokio::test]
    async fn test_assign_rejects_non_objects() {
        let assign = Assign::from_keys("stats", [("words", word_count())]).unwrap();
        let ctx = InvocationContext::detached();

        let err = assign.apply(&ctx, &json!("text")).await.unwrap_err();
        assert!(err.to_string().contains("object input"));

        let two_vars: Arc<dyn Stage> = Arc::new(PromptTemplate::new("p", "{a} {b}").unwrap());
        assert!(Assign::from_keys("ok", [("x", two_vars)]).is_ok());

        let number: Arc<dyn Stage> =
            Arc::new(FnStage::new("n", |v: &Value| Ok(v.clone())).with_input_shape(Shape::Number));
        assert!(Assign::from_keys("bad", [("x", number)]).is_err());
    }

    #[test]
    fn test_accumulated_keys_reach_later_stages() {
        let first = Assign::from_keys("first", [("words", word_count())]).unwrap();
        let second = Assign::from_keys("second", [("copy", pluck("copy", "words"))]).unwrap();

        let seq = Sequence::new(vec![
            Arc::new(first) as Arc<dyn Stage>,
            Arc::new(second) as Arc<dyn Stage>,
            pluck("lang", "text"),
        ])
        .unwrap();
        assert_eq!(seq.output_shape_for(&Shape::object(["text", "lang"])), Shape::Any);

        let missing = Assign::from_keys("first", [("words", word_count())]).unwrap();
        let err = Sequence::new(vec![Arc::new(missing) as Arc<dyn Stage>, pluck("x", "summary")])
            .unwrap_err();
        assert!(err.message.contains("summary"));
    }

    #[tokio::test]
    async fn test_collect_all_assign_marks_keys_optional() {
        let group = ParallelGroup::builder("enrich")
            .branch("words", word_count())
            .unwrap()
            .branch("topic", Arc::new(FailingStage::new("topic", "down")))
            .unwrap()
            .collect_all()
            .build()
            .unwrap();
        let assign = Assign::new(group).unwrap();
        let ctx = InvocationContext::detached();

        let output = assign.apply(&ctx, &json!({"text": "a b"})).await.unwrap();
        assert_eq!(output, json!({"text": "a b", "words": 2}));
        assert_eq!(ctx.take_branch_failures().len(), 1);

        match assign.output_shape() {
            Shape::Object(shape) => {
                assert!(shape.required.contains("text"));
                assert!(shape.optional.contains("words"));
                assert!(shape.optional.contains("topic"));
            }
            other => panic!("unexpected shape {other}"),
        }
    }
}
