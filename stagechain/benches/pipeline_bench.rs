//! Benchmarks for pipeline construction and invocation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;
use stagechain::prelude::*;
use stagechain::stages::FnStage;
use std::sync::Arc;

fn upper() -> Arc<dyn Stage> {
    Arc::new(
        FnStage::new("upper", |v: &Value| {
            Ok(json!(v.as_str().unwrap_or_default().to_uppercase()))
        })
        .with_output_shape(Shape::String),
    )
}

fn essay_pipeline() -> Pipeline {
    PipelineBuilder::new("bench")
        .then(Arc::new(
            PromptTemplate::new("prompt", "Write about {topic}").expect("valid template"),
        ))
        .and_then(|b| b.then(upper()))
        .and_then(|b| b.then(Arc::new(StrOutputParser::default())))
        .and_then(PipelineBuilder::build)
        .expect("valid pipeline")
}

fn fan_out_pipeline(width: usize) -> Pipeline {
    let mut group = ParallelGroup::builder("fan");
    for i in 0..width {
        group = group
            .branch(format!("b{i}"), passthrough(format!("p{i}")))
            .expect("unique branch");
    }
    Pipeline::new("fan", Arc::new(group.build().expect("valid group"))).expect("valid pipeline")
}

fn pipeline_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().expect("tokio runtime");

    c.bench_function("compose_three_stages", |b| b.iter(|| black_box(essay_pipeline())));

    let essay = essay_pipeline();
    c.bench_function("invoke_sequence", |b| {
        b.iter(|| rt.block_on(essay.invoke(black_box(json!({"topic": "AI"})))))
    });

    let fan = fan_out_pipeline(8);
    c.bench_function("invoke_parallel_8", |b| {
        b.iter(|| rt.block_on(fan.invoke(black_box(json!("x")))))
    });

    let inputs: Vec<Value> = (0..32).map(|i| json!({"topic": i.to_string()})).collect();
    c.bench_function("invoke_many_32", |b| {
        b.iter(|| rt.block_on(essay.invoke_many(black_box(inputs.clone()))))
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
