use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures::StreamExt;
use serde_json::json;

use graph_engine::{
    EngineConfig, Graph, GraphBuilder, GraphEngine, GraphRuntimeState, InMemoryReadyQueue, Node,
    NodeKind, NodeRegistry, ReadyQueue, ResponseStreamCoordinator, Selector, Template, VariablePool,
};

fn bench_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("tokio runtime")
}

/// start -> answer_0 .. answer_{width-1}, all built-in nodes
fn fan_out(width: usize) -> Arc<Graph> {
    let mut builder = GraphBuilder::new().node(Node::new("start", NodeKind::Start));
    for i in 0..width {
        let id = format!("answer_{}", i);
        builder = builder
            .node(Node::new(id.as_str(), NodeKind::Answer).with_config(json!({"answer": "{{#start.q#}}"})))
            .edge("start", id.as_str());
    }
    Arc::new(builder.build().expect("valid graph"))
}

fn linear(length: usize) -> Arc<Graph> {
    let mut builder = GraphBuilder::new().node(Node::new("start", NodeKind::Start));
    let mut previous = "start".to_string();
    for i in 0..length {
        let id = format!("answer_{}", i);
        builder = builder
            .node(Node::new(id.as_str(), NodeKind::Answer).with_config(json!({"answer": "."})))
            .edge(previous.as_str(), id.as_str());
        previous = id;
    }
    Arc::new(builder.build().expect("valid graph"))
}

async fn run_once(graph: Arc<Graph>, config: EngineConfig) {
    let mut inputs = serde_json::Map::new();
    inputs.insert("q".into(), json!("bench"));
    let engine = GraphEngine::builder("bench", graph, GraphRuntimeState::new(VariablePool::with_user_inputs(inputs)))
        .config(config)
        .registry(NodeRegistry::with_builtins())
        .build()
        .await
        .expect("engine");
    let events = engine.run().collect::<Vec<_>>().await;
    black_box(events);
}

// =============================================================================
// Whole runs
// =============================================================================

fn bench_engine_runs(c: &mut Criterion) {
    let rt = bench_runtime();
    let config = EngineConfig::default().with_poll_interval(std::time::Duration::from_micros(200));

    for size in [5usize, 20] {
        let graph = linear(size);
        let config = config.clone();
        c.bench_function(&format!("engine_linear_{}", size), |b| {
            b.to_async(&rt).iter(|| run_once(Arc::clone(&graph), config.clone()));
        });
    }

    for width in [4usize, 16] {
        let graph = fan_out(width);
        let config = config.clone().with_workers(1, 8);
        c.bench_function(&format!("engine_fan_out_{}", width), |b| {
            b.to_async(&rt).iter(|| run_once(Arc::clone(&graph), config.clone()));
        });
    }
}

// =============================================================================
// Building blocks
// =============================================================================

fn bench_coordinator(c: &mut Criterion) {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("llm2", NodeKind::Llm))
            .node(Node::new("llm3", NodeKind::Llm))
            .node(
                Node::new("answer", NodeKind::Answer)
                    .with_config(json!({"answer": "c{{#llm3.text#}}da{{#llm2.text#}}b"})),
            )
            .edge("start", "llm2")
            .edge("start", "llm3")
            .edge("llm2", "answer")
            .edge("llm3", "answer")
            .build()
            .expect("valid graph"),
    );
    let llm2 = Selector::new("llm2", "text");
    let llm3 = Selector::new("llm3", "text");
    let pool = VariablePool::new();

    c.bench_function("coordinator_interleaved_200_chunks", |b| {
        b.iter(|| {
            let mut coordinator = ResponseStreamCoordinator::new(&graph);
            let mut emitted = coordinator.on_graph_start(&pool).len();
            for i in 0..100 {
                emitted += coordinator.on_stream_chunk(&llm2, "tok ", i == 99, &pool).len();
                emitted += coordinator.on_stream_chunk(&llm3, "tok ", i == 99, &pool).len();
            }
            black_box(emitted)
        });
    });

    c.bench_function("template_parse", |b| {
        b.iter(|| Template::parse(black_box("Hello {{#start.name#}}, {{#llm.text#}} and {{#sys.query#}}!")));
    });
}

fn bench_ready_queue(c: &mut Criterion) {
    let ids: Vec<String> = (0..256).map(|i| format!("node_{}", i)).collect();

    c.bench_function("ready_queue_push_pop_256", |b| {
        b.iter(|| {
            let mut queue = InMemoryReadyQueue::new();
            for id in &ids {
                queue.push(id.as_str().into());
            }
            // Duplicates are rejected
            for id in ids.iter().take(32) {
                queue.push(id.as_str().into());
            }
            let mut popped = 0;
            while queue.pop().is_some() {
                popped += 1;
            }
            black_box(popped)
        });
    });
}

criterion_group!(benches, bench_engine_runs, bench_coordinator, bench_ready_queue);
criterion_main!(benches);
