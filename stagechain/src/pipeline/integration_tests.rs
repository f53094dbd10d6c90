//! End-to-end tests across composers and the invoker.

use super::*;
use crate::capabilities::RetryConfig;
use crate::config::InvokerConfig;
use crate::contracts::Shape;
use crate::errors::{CapabilityError, InvocationError, StageFailure};
use crate::events::CollectingEventSink;
use crate::stages::{
    constant, passthrough, pluck, CapabilityStage, FnStage, JsonOutputParser, ModelStage,
    PromptTemplate, RetrieverStage, Stage, StrOutputParser, StuffDocuments,
};
use crate::testing::{
    assert_branch_failed, assert_failed_at, assert_not_partial, CountingStage, EchoCapability,
    FailingStage, MockChatModel, SlowStage, StaticRetriever,
};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn append(id: &str, suffix: &'static str) -> Arc<dyn Stage> {
    Arc::new(
        FnStage::new(id, move |v: &Value| {
            Ok(json!(format!("{}{suffix}", v.as_str().unwrap_or_default())))
        })
        .with_input_shape(Shape::String)
        .with_output_shape(Shape::String),
    )
}

fn prompt(id: &str, template: &str) -> Arc<dyn Stage> {
    Arc::new(PromptTemplate::new(id, template).unwrap())
}

#[tokio::test]
async fn test_format_then_stub_model() {
    let stub: Arc<dyn Stage> = Arc::new(CapabilityStage::new(
        "model",
        Arc::new(EchoCapability::new("stub", "STUB:")),
    ));
    let pipeline = PipelineBuilder::new("essay")
        .then(prompt("format", "Write about {topic}"))
        .unwrap()
        .then(stub)
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.invoke(json!({"topic": "AI"})).await.unwrap();
    assert_eq!(result.output, json!("STUB:Write about AI"));
    assert_not_partial(&result);
}

#[tokio::test]
async fn test_format_model_parser_chain() {
    let model = Arc::new(MockChatModel::echo("STUB:"));
    let pipeline = PipelineBuilder::new("essay")
        .then(prompt("format", "Write about {topic}"))
        .unwrap()
        .then(Arc::new(ModelStage::new("llm", model.clone())))
        .unwrap()
        .then(Arc::new(StrOutputParser::default()))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.invoke(json!({"topic": "AI"})).await.unwrap();
    assert_eq!(result.parse_as::<String>().unwrap(), "STUB:Write about AI");
    assert_eq!(model.call_count(), 1);
}

#[tokio::test]
async fn test_fail_fast_group_merges_by_name() {
    let group = ParallelGroup::from_branches(
        "analyze",
        [
            ("summary", constant("summarize", json!("S"))),
            ("sentiment", constant("classify", json!("positive"))),
            ("hashtags", constant("tag", json!("#ai"))),
        ],
    )
    .unwrap();
    let pipeline = Pipeline::new("social", Arc::new(group)).unwrap();

    let result = pipeline.invoke(json!({"text": "x"})).await.unwrap();
    assert_eq!(
        result.output,
        json!({"summary": "S", "sentiment": "positive", "hashtags": "#ai"})
    );
}

#[tokio::test]
async fn test_sequence_grouping_is_unobservable() {
    let left = Sequence::new(vec![
        Arc::new(Sequence::chain(append("a", "-a"), append("b", "-b")).unwrap()) as Arc<dyn Stage>,
        append("c", "-c"),
    ])
    .unwrap();
    let right = Sequence::new(vec![
        append("a", "-a"),
        Arc::new(Sequence::chain(append("b", "-b"), append("c", "-c")).unwrap()) as Arc<dyn Stage>,
    ])
    .unwrap();

    assert_eq!(left.id(), right.id());
    assert_eq!(left.len(), 3);

    let left = Pipeline::new("p", Arc::new(left)).unwrap();
    let right = Pipeline::new("p", Arc::new(right)).unwrap();
    assert_eq!(
        left.invoke(json!("x")).await.unwrap().output,
        right.invoke(json!("x")).await.unwrap().output
    );
    assert_eq!(left.invoke(json!("x")).await.unwrap().output, json!("x-a-b-c"));
}

#[tokio::test]
async fn test_sequence_grouping_keeps_error_location() {
    let boom = || Arc::new(FailingStage::new("boom", "exploded")) as Arc<dyn Stage>;

    let left = Sequence::new(vec![
        Arc::new(Sequence::chain(append("a", "-a"), append("b", "-b")).unwrap()) as Arc<dyn Stage>,
        boom(),
    ])
    .unwrap();
    let right = Sequence::new(vec![
        append("a", "-a"),
        Arc::new(Sequence::chain(append("b", "-b"), boom()).unwrap()) as Arc<dyn Stage>,
    ])
    .unwrap();

    let left_err = Pipeline::new("p", Arc::new(left)).unwrap().invoke(json!("x")).await.unwrap_err();
    let right_err = Pipeline::new("p", Arc::new(right)).unwrap().invoke(json!("x")).await.unwrap_err();

    assert_eq!(left_err.path(), right_err.path());
    assert_eq!(left_err.position(), Some(2));
    assert_eq!(right_err.position(), Some(2));
    assert_failed_at(&left_err, &["boom"]);
}

#[tokio::test]
async fn test_failure_short_circuits_the_sequence() {
    let spy = Arc::new(CountingStage::new("spy"));
    let pipeline = PipelineBuilder::new("short")
        .then(Arc::new(FailingStage::new("first", "nope")))
        .unwrap()
        .then(spy.clone())
        .unwrap()
        .build()
        .unwrap();

    let err = pipeline.invoke(json!(1)).await.unwrap_err();
    assert_eq!(err.stage_id(), "first");
    assert_eq!(err.position(), Some(0));
    assert_eq!(err.pipeline(), Some("short"));
    assert_eq!(spy.calls(), 0);
}

#[tokio::test]
async fn test_fail_fast_returns_no_partial_output() {
    let group = ParallelGroup::builder("analyze")
        .branch("summary", Arc::new(SlowStage::with_delay_ms("summarize", 5_000)))
        .unwrap()
        .branch("sentiment", Arc::new(FailingStage::new("classify", "model down")))
        .unwrap()
        .build()
        .unwrap();
    let pipeline = Pipeline::new("social", Arc::new(group)).unwrap();

    let err = tokio::time::timeout(Duration::from_secs(2), pipeline.invoke(json!({"text": "x"})))
        .await
        .expect("fail-fast must not wait for the slow branch")
        .unwrap_err();

    assert!(matches!(err, InvocationError::StageExecution(_)));
    assert_failed_at(&err, &["branch:sentiment", "classify"]);
}

#[tokio::test]
async fn test_collect_all_surfaces_branch_failures() {
    let sink = Arc::new(CollectingEventSink::new());
    let group = ParallelGroup::builder("analyze")
        .branch("summary", constant("summarize", json!("S")))
        .unwrap()
        .branch("sentiment", Arc::new(FailingStage::new("classify", "model down")))
        .unwrap()
        .branch("hashtags", constant("tag", json!("#ai")))
        .unwrap()
        .collect_all()
        .build()
        .unwrap();
    let pipeline = Pipeline::new("social", Arc::new(group))
        .unwrap()
        .with_event_sink(sink.clone());

    let result = pipeline.invoke(json!({"text": "x"})).await.unwrap();
    assert_eq!(result.output, json!({"summary": "S", "hashtags": "#ai"}));
    assert!(result.is_partial());
    assert_branch_failed(&result, "sentiment");
    assert_eq!(result.branch_failures[0].path, ["branch:sentiment", "classify"]);
    assert_eq!(result.branch_failures[0].stage_id(), "classify");

    let events = sink.events_of_type("branch.failed");
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].1.as_ref().unwrap()["branch"], "sentiment");
}

#[tokio::test]
async fn test_collect_all_fails_when_every_branch_fails() {
    let group = ParallelGroup::builder("analyze")
        .branch("a", Arc::new(FailingStage::new("x", "one")))
        .unwrap()
        .branch("b", Arc::new(FailingStage::new("y", "two")))
        .unwrap()
        .collect_all()
        .build()
        .unwrap();
    let pipeline = Pipeline::new("social", Arc::new(group)).unwrap();

    let err = pipeline.invoke(json!({})).await.unwrap_err();
    let InvocationError::Merge(merge) = &err else {
        panic!("expected a merge error, got {err}");
    };
    assert_eq!(merge.branch_names(), vec!["a", "b"]);
    assert_eq!(err.stage_id(), "analyze");
    assert_eq!(err.pipeline(), Some("social"));
}

#[tokio::test]
async fn test_nested_collect_all_records_full_path() {
    let inner = ParallelGroup::builder("inner")
        .branch("ok", passthrough("keep"))
        .unwrap()
        .branch("bad", Arc::new(FailingStage::new("leaf", "down")))
        .unwrap()
        .collect_all()
        .build()
        .unwrap();
    let outer = ParallelGroup::from_branches(
        "outer",
        [
            ("nested", Arc::new(inner) as Arc<dyn Stage>),
            ("plain", constant("c", json!(1))),
        ],
    )
    .unwrap();
    let pipeline = Pipeline::new("deep", Arc::new(outer)).unwrap();

    let result = pipeline.invoke(json!("in")).await.unwrap();
    assert_eq!(result.output, json!({"nested": {"ok": "in"}, "plain": 1}));
    assert_eq!(
        result.branch_failures[0].path,
        ["branch:nested", "branch:bad", "leaf"]
    );
}

#[tokio::test]
async fn test_invoke_many_isolates_failures() {
    let picky: Arc<dyn Stage> = Arc::new(FnStage::new("picky", |v: &Value| {
        if v == &json!(2) {
            anyhow::bail!("two is not allowed");
        }
        Ok(json!(v.as_i64().unwrap_or_default() * 10))
    }));
    let pipeline = Pipeline::new("batch", picky)
        .unwrap()
        .with_config(InvokerConfig::new().with_batch_concurrency(3));

    let outcome = pipeline
        .invoke_many((0..5).map(|i| json!(i)).collect())
        .await;

    let summary = outcome.summary();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.failed, 1);
    assert_eq!(
        outcome.outputs(),
        vec![Some(&json!(0)), Some(&json!(10)), None, Some(&json!(30)), Some(&json!(40))]
    );

    let (index, err) = outcome.failures()[0];
    assert_eq!(index, 2);
    assert!(err.to_string().contains("two is not allowed"));
}

#[test]
fn test_repeated_invocations_agree() {
    let pipeline = PipelineBuilder::new("stable")
        .then(prompt("format", "Hello {name}"))
        .unwrap()
        .then(append("bang", "!"))
        .unwrap()
        .build()
        .unwrap();

    let first = tokio_test::block_on(pipeline.invoke(json!({"name": "Ada"}))).unwrap();
    let second = tokio_test::block_on(pipeline.invoke(json!({"name": "Ada"}))).unwrap();
    assert_eq!(first.output, second.output);
    assert_ne!(first.run_id, second.run_id);
}

#[tokio::test]
async fn test_batch_results_do_not_depend_on_order() {
    let pipeline = PipelineBuilder::new("greet")
        .then(prompt("format", "Hello {name}"))
        .unwrap()
        .then(append("bang", "!"))
        .unwrap()
        .build()
        .unwrap()
        .with_config(InvokerConfig::new().with_batch_concurrency(2));
    let names = ["Ada", "Grace", "Linus", "Barbara"];

    let mut standalone = Vec::new();
    for name in names {
        standalone.push(pipeline.invoke(json!({"name": name})).await.unwrap().output);
    }

    let permutation = [2, 0, 3, 1];
    let outcome = pipeline
        .invoke_many(permutation.iter().map(|&i| json!({"name": names[i]})).collect())
        .await;

    for (slot, &i) in permutation.iter().enumerate() {
        assert_eq!(outcome.outputs()[slot], Some(&standalone[i]));
    }
}

#[tokio::test]
async fn test_summary_and_article_share_one_object_input() {
    let branches = || {
        [
            ("summary", prompt("summarize", "Summarize '{title}'")),
            ("article", prompt("write", "Write '{title}' about {topic}")),
        ]
    };

    let group = ParallelGroup::from_branches("step_b", branches()).unwrap();
    assert_eq!(group.input_shape(), Shape::object(["title", "topic"]));

    let assign = Assign::from_keys("step_b", branches()).unwrap();
    let pipeline = PipelineBuilder::new("blog")
        .then(Arc::new(assign))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline
        .invoke(json!({"title": "Rust", "topic": "ownership"}))
        .await
        .unwrap();
    assert_eq!(
        result.output,
        json!({
            "title": "Rust",
            "topic": "ownership",
            "summary": "Summarize 'Rust'",
            "article": "Write 'Rust' about ownership",
        })
    );
}

#[tokio::test]
async fn test_retrieval_augmented_answer() {
    let retrieve = Sequence::chain(
        pluck("question", "question"),
        Arc::new(RetrieverStage::new(
            "search",
            Arc::new(StaticRetriever::new(["Rust has no GC.", "Cargo builds crates."])),
        )),
    )
    .unwrap();
    let context = Assign::from_keys("retrieve", [("context", Arc::new(retrieve) as Arc<dyn Stage>)])
        .unwrap();
    let stuff = StuffDocuments::new(
        PromptTemplate::new("answer_prompt", "Q: {question}\n{context}").unwrap(),
        "context",
    )
    .unwrap();

    let pipeline = PipelineBuilder::new("rag")
        .assign(context)
        .unwrap()
        .then(Arc::new(stuff))
        .unwrap()
        .then(Arc::new(ModelStage::new("llm", Arc::new(MockChatModel::echo("")))))
        .unwrap()
        .then(Arc::new(StrOutputParser::default()))
        .unwrap()
        .build()
        .unwrap();

    assert_eq!(pipeline.input_shape(), Shape::object(["question"]));
    let result = pipeline.invoke(json!({"question": "GC?"})).await.unwrap();
    assert_eq!(
        result.output,
        json!("Q: GC?\nRust has no GC.\n\nCargo builds crates.")
    );

    let err = pipeline.invoke(json!({"query": "GC?"})).await.unwrap_err();
    assert_eq!(err.stage_id(), "retrieve");
}

#[tokio::test]
async fn test_assign_accumulates_across_steps() {
    let title = Assign::from_keys(
        "title",
        [("title", prompt("title_prompt", "About {topic}"))],
    )
    .unwrap();
    let outline = Assign::from_keys(
        "outline",
        [("outline", prompt("outline_prompt", "{title}: intro, body"))],
    )
    .unwrap();

    let pipeline = PipelineBuilder::new("writer")
        .assign(title)
        .unwrap()
        .assign(outline)
        .unwrap()
        .then(prompt("final", "{topic} / {title} / {outline}"))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.invoke(json!({"topic": "Rust"})).await.unwrap();
    assert_eq!(
        result.output,
        json!("Rust / About Rust / About Rust: intro, body")
    );
}

#[test]
fn test_missing_key_is_a_composition_error() {
    let summarize = Assign::from_keys("s", [("summary", constant("sum", json!("S")))]).unwrap();
    let err = PipelineBuilder::new("broken")
        .then(constant("text", json!("plain")))
        .unwrap()
        .assign(summarize)
        .unwrap_err();
    assert!(err.message.contains("object"));
}

#[tokio::test]
async fn test_branch_routes_inside_pipeline() {
    let router = Branch::builder("route")
        .when(|v| v["lang"] == "fr", prompt("fr", "Bonjour {name}"))
        .otherwise(prompt("en", "Hello {name}"))
        .build()
        .unwrap();
    let pipeline = Pipeline::new("greet", Arc::new(router)).unwrap();

    let fr = pipeline.invoke(json!({"lang": "fr", "name": "Ada"})).await.unwrap();
    assert_eq!(fr.output, json!("Bonjour Ada"));
    let en = pipeline.invoke(json!({"lang": "de", "name": "Ada"})).await.unwrap();
    assert_eq!(en.output, json!("Hello Ada"));
}

#[tokio::test]
async fn test_nested_pipeline_errors_name_the_outer_pipeline() {
    let inner = PipelineBuilder::new("inner")
        .then(passthrough("p"))
        .unwrap()
        .then(Arc::new(FailingStage::new("boom", "x")))
        .unwrap()
        .build()
        .unwrap();
    let outer = ParallelGroup::from_branches("outer", [("sub", Arc::new(inner) as Arc<dyn Stage>)])
        .unwrap();
    let pipeline = Pipeline::new("main", Arc::new(outer)).unwrap();

    let err = pipeline.invoke(json!(1)).await.unwrap_err();
    assert_eq!(err.pipeline(), Some("main"));
    assert_failed_at(&err, &["branch:sub", "boom"]);
    assert_eq!(err.position(), Some(1));
}

#[tokio::test]
async fn test_capability_errors_keep_their_kind() {
    let model = Arc::new(MockChatModel::failing(CapabilityError::rate_limited("mock")));
    let pipeline = Pipeline::new("llm", Arc::new(ModelStage::new("llm", model))).unwrap();

    let err = pipeline.invoke(json!("hi")).await.unwrap_err();
    let InvocationError::StageExecution(stage_err) = &err else {
        panic!("expected a stage error, got {err}");
    };
    assert!(matches!(
        stage_err.cause,
        StageFailure::Capability(CapabilityError::RateLimited { .. })
    ));
}

#[tokio::test]
async fn test_retrying_model_recovers_inside_pipeline() {
    use crate::capabilities::RetryingChatModel;

    let flaky = Arc::new(MockChatModel::flaky(
        1,
        CapabilityError::timeout("mock-model", 50),
        "{\"score\": 5}",
    ));
    let retrying = RetryingChatModel::new(
        flaky.clone(),
        RetryConfig {
            max_attempts: 2,
            base_delay_ms: 1,
            ..RetryConfig::default()
        },
    );
    let pipeline = PipelineBuilder::new("score")
        .then(Arc::new(ModelStage::new("llm", Arc::new(retrying))))
        .unwrap()
        .then(Arc::new(JsonOutputParser::new("json").with_required_keys(["score"])))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.invoke(json!("rate this")).await.unwrap();
    assert_eq!(result.output, json!({"score": 5}));
    assert_eq!(flaky.call_count(), 2);
}

#[tokio::test]
async fn test_lifecycle_events_follow_execution_order() {
    let sink = Arc::new(CollectingEventSink::new());
    let pipeline = PipelineBuilder::new("events")
        .then(prompt("format", "{x}"))
        .unwrap()
        .then(append("tail", "!"))
        .unwrap()
        .with_event_sink(sink.clone())
        .build()
        .unwrap();

    pipeline.invoke(json!("v")).await.unwrap();
    assert_eq!(
        sink.event_types(),
        vec![
            "pipeline.started",
            "stage.started",
            "stage.completed",
            "stage.started",
            "stage.completed",
            "pipeline.completed",
        ]
    );
    assert_eq!(sink.stage_ids("stage.completed"), ["format", "tail"]);
}

#[tokio::test]
async fn test_fan_out_then_stuff_documents() {
    let search = Sequence::chain(
        pluck("query", "question"),
        Arc::new(RetrieverStage::new(
            "search",
            Arc::new(StaticRetriever::new(["doc one", "doc two"])),
        )),
    )
    .unwrap();
    let gather = ParallelGroup::from_branches(
        "gather",
        [
            ("context", Arc::new(search) as Arc<dyn Stage>),
            ("question", pluck("question", "question")),
        ],
    )
    .unwrap();
    let stuff = StuffDocuments::new(
        PromptTemplate::new("prompt", "{context} => {question}").unwrap(),
        "context",
    )
    .unwrap()
    .with_separator(" | ");

    let pipeline = PipelineBuilder::new("rag")
        .parallel(gather)
        .unwrap()
        .then(Arc::new(stuff))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.invoke(json!({"question": "why?"})).await.unwrap();
    assert_eq!(result.output, json!("doc one | doc two => why?"));
}

#[tokio::test]
async fn test_generator_feeds_evaluator() {
    let generator = PipelineBuilder::new("generate")
        .then(prompt("draft_prompt", "Write about {topic}"))
        .unwrap()
        .then(Arc::new(ModelStage::new("writer", Arc::new(MockChatModel::echo("draft:")))))
        .unwrap()
        .then(Arc::new(StrOutputParser::new("draft")))
        .unwrap()
        .build()
        .unwrap();

    let pipeline = PipelineBuilder::new("review")
        .then(Arc::new(generator))
        .unwrap()
        .then(prompt("judge_prompt", "Evaluate: {text}"))
        .unwrap()
        .then(Arc::new(ModelStage::new("judge", Arc::new(MockChatModel::echo("score:")))))
        .unwrap()
        .then(Arc::new(StrOutputParser::new("verdict")))
        .unwrap()
        .build()
        .unwrap();

    let result = pipeline.invoke(json!({"topic": "tides"})).await.unwrap();
    assert_eq!(
        result.output,
        json!("score:Evaluate: draft:Write about tides")
    );
    assert_eq!(pipeline.describe().leaf_count(), 6);
}
