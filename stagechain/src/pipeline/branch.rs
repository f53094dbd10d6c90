//! Predicate routing between alternative stages.

use crate::context::InvocationContext;
use crate::contracts::Shape;
use crate::core::StageKind;
use crate::errors::{CompositionError, InvocationError, StageExecutionError};
use crate::stages::{run_stage, Stage};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// A routing predicate over the branch input.
pub type Predicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

struct Case {
    predicate: Predicate,
    stage: Arc<dyn Stage>,
}

/// Routes its input to the first case whose predicate holds, or to the
/// default stage.
///
/// Errors raised inside a case are prefixed `case:<index>` (or `default`).
pub struct Branch {
    id: String,
    cases: Vec<Case>,
    default: Option<Arc<dyn Stage>>,
}

impl Branch {
    /// Starts building a branch.
    #[must_use]
    pub fn builder(id: impl Into<String>) -> BranchBuilder {
        BranchBuilder {
            id: id.into(),
            cases: Vec::new(),
            default: None,
        }
    }

    fn routes(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.cases.iter().map(|c| &c.stage).chain(self.default.iter())
    }

    fn select(&self, input: &Value) -> Option<(String, &Arc<dyn Stage>)> {
        self.cases
            .iter()
            .enumerate()
            .find(|(_, case)| (case.predicate)(input))
            .map(|(index, case)| (format!("case:{index}"), &case.stage))
            .or_else(|| self.default.as_ref().map(|stage| ("default".to_string(), stage)))
    }

    fn merge_outputs(shapes: Vec<Shape>) -> Shape {
        let mut distinct: Vec<Shape> = Vec::new();
        for shape in shapes {
            if shape.is_any() {
                return Shape::Any;
            }
            if !distinct.contains(&shape) {
                distinct.push(shape);
            }
        }
        match distinct.len() {
            1 => distinct.remove(0),
            _ => Shape::one_of(distinct),
        }
    }
}

impl fmt::Debug for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Branch")
            .field("id", &self.id)
            .field("cases", &self.cases.iter().map(|c| c.stage.id()).collect::<Vec<_>>())
            .field("default", &self.default.as_ref().map(|s| s.id()))
            .finish()
    }
}

#[async_trait]
impl Stage for Branch {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> StageKind {
        StageKind::Branch
    }

    fn input_shape(&self) -> Shape {
        let shapes: Vec<Shape> = self.routes().map(|s| s.input_shape()).collect();
        Shape::combine_inputs(shapes.iter()).unwrap_or_default()
    }

    fn output_shape(&self) -> Shape {
        Self::merge_outputs(self.routes().map(|s| s.output_shape()).collect())
    }

    fn output_shape_for(&self, input: &Shape) -> Shape {
        Self::merge_outputs(self.routes().map(|s| s.output_shape_for(input)).collect())
    }

    fn children(&self) -> Vec<Arc<dyn Stage>> {
        self.routes().cloned().collect()
    }

    async fn apply(&self, ctx: &InvocationContext, input: &Value) -> Result<Value, InvocationError> {
        let Some((route, stage)) = self.select(input) else {
            return Err(StageExecutionError::input_contract(
                &self.id,
                "no case matched and there is no default",
            )
            .into());
        };

        debug!(branch = %self.id, route = %route, stage = stage.id(), "Routing input");
        run_stage(stage.as_ref(), &ctx.child(route.clone()), input)
            .await
            .map_err(|e| e.within(route))
    }
}

/// Builder for [`Branch`].
pub struct BranchBuilder {
    id: String,
    cases: Vec<Case>,
    default: Option<Arc<dyn Stage>>,
}

impl BranchBuilder {
    /// Adds a case; cases are tried in the order they are added.
    #[must_use]
    pub fn when<P>(mut self, predicate: P, stage: Arc<dyn Stage>) -> Self
    where
        P: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.cases.push(Case {
            predicate: Arc::new(predicate),
            stage,
        });
        self
    }

    /// Sets the stage used when no case matches.
    #[must_use]
    pub fn otherwise(mut self, stage: Arc<dyn Stage>) -> Self {
        self.default = Some(stage);
        self
    }

    /// Builds the branch.
    pub fn build(self) -> Result<Branch, CompositionError> {
        if self.cases.is_empty() && self.default.is_none() {
            return Err(CompositionError::empty(format!("branch '{}'", self.id)));
        }

        let branch = Branch {
            id: self.id,
            cases: self.cases,
            default: self.default,
        };

        let shapes: Vec<Shape> = branch.routes().map(|s| s.input_shape()).collect();
        Shape::combine_inputs(shapes.iter()).map_err(|e| {
            CompositionError::shape_mismatch(&branch.id, &branch.id, e.to_string())
                .with_stages(branch.routes().map(|s| s.id().to_string()).collect())
        })?;

        Ok(branch)
    }
}

impl fmt::Debug for BranchBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BranchBuilder")
            .field("id", &self.id)
            .field("cases", &self.cases.len())
            .field("has_default", &self.default.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::CompositionErrorKind;
    use crate::stages::{constant, FnStage};
    use crate::testing::{assert_failed_at, FailingStage};
    use serde_json::json;

    fn router() -> Branch {
        Branch::builder("route")
            .when(|v| v["lang"] == "fr", constant("french", json!("bonjour")))
            .when(|v| v["lang"] == "de", Arc::new(FailingStage::new("german", "unsupported")))
            .otherwise(constant("english", json!("hello")))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_first_matching_case_wins() {
        let branch = router();
        let ctx = InvocationContext::detached();

        assert_eq!(branch.apply(&ctx, &json!({"lang": "fr"})).await.unwrap(), json!("bonjour"));
        assert_eq!(branch.apply(&ctx, &json!({"lang": "es"})).await.unwrap(), json!("hello"));
        assert_eq!(branch.children().len(), 3);
        assert_eq!(branch.output_shape(), Shape::Any);
    }

    #[tokio::test]
    async fn test_case_errors_are_prefixed() {
        let branch = router();
        let ctx = InvocationContext::detached();

        let err = branch.apply(&ctx, &json!({"lang": "de"})).await.unwrap_err();
        assert_failed_at(&err, &["case:1", "german"]);
    }

    #[tokio::test]
    async fn test_no_match_without_default() {
        let branch = Branch::builder("only")
            .when(|v| v.is_string(), constant("s", json!(1)))
            .build()
            .unwrap();
        let ctx = InvocationContext::detached();

        let err = branch.apply(&ctx, &json!(3)).await.unwrap_err();
        assert!(err.to_string().contains("no case matched"));
        assert_eq!(branch.output_shape(), Shape::Number);
    }

    #[test]
    fn test_build_errors() {
        let err = Branch::builder("empty").build().unwrap_err();
        assert_eq!(err.kind, CompositionErrorKind::Empty);

        let number: Arc<dyn Stage> =
            Arc::new(FnStage::new("n", |v: &Value| Ok(v.clone())).with_input_shape(Shape::Number));
        let string: Arc<dyn Stage> =
            Arc::new(FnStage::new("s", |v: &Value| Ok(v.clone())).with_input_shape(Shape::String));
        let err = Branch::builder("mixed")
            .when(|_| true, number)
            .otherwise(string)
            .build()
            .unwrap_err();
        assert_eq!(err.kind, CompositionErrorKind::ShapeMismatch);
    }
}
