//! Integration tests for node failures
//!
//! Covers retries, the three error strategies, join policies after a failed
//! prerequisite, panics, and nodes without an executor.

mod common;

use serde_json::{json, Map};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use graph_engine::graph::FAIL_BRANCH_HANDLE;
use graph_engine::{
    ErrorStrategy, FailureKind, GraphBuilder, GraphEngine, GraphEngineEvent, GraphRuntimeState,
    JoinPolicy, Node, NodeKind, NodeRegistry, RetryPolicy,
};

fn failed_node_id(events: &[GraphEngineEvent]) -> Option<String> {
    match terminal(events) {
        GraphEngineEvent::GraphRunFailed { node_id, kind, .. } => {
            assert_eq!(*kind, FailureKind::Node);
            node_id.as_ref().map(|id| id.to_string())
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

// =============================================================================
// Unhandled failures
// =============================================================================

#[tokio::test]
async fn test_failure_waits_for_unrelated_branch() {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("bad", NodeKind::Tool))
            .node(Node::new("bad_next", NodeKind::Code))
            .node(Node::new("slow", NodeKind::Tool))
            .node(Node::new("slow_next", NodeKind::Code))
            .edge("start", "bad")
            .edge("bad", "bad_next")
            .edge("start", "slow")
            .edge("slow", "slow_next")
            .build()
            .unwrap(),
    );
    let counter = CountingNode::default();
    let registry = NodeRegistry::with_builtins()
        .register_node("bad", FailingNode::always("kaboom"))
        .register_node("slow", SlowNode::new(Duration::from_millis(40)))
        .register_kind(NodeKind::Code, counter.clone());

    let engine = GraphEngine::builder("fail", graph, GraphRuntimeState::default())
        .config(fast_config())
        .registry(registry)
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    assert_eq!(failed_node_id(&events).as_deref(), Some("bad"));
    match terminal(&events) {
        GraphEngineEvent::GraphRunFailed { error, .. } => assert_eq!(error, "kaboom"),
        _ => unreachable!(),
    }

    // The failing branch stops; the other one finishes
    assert_eq!(counter.count("bad_next"), 0);
    assert_eq!(counter.count("slow_next"), 1);
    assert_eq!(node_event_names(&events, "slow"), vec!["node_run_started", "node_run_succeeded"]);
    assert_eq!(node_event_names(&events, "bad"), vec!["node_run_started", "node_run_failed"]);
    match events.iter().find(|e| e.name() == "node_run_failed") {
        Some(GraphEngineEvent::NodeRunFailed { error_type, .. }) => assert_eq!(error_type, "MockFailure"),
        other => panic!("expected node failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_panic_is_reported_as_failure() {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("boom", NodeKind::Tool))
            .edge("start", "boom")
            .build()
            .unwrap(),
    );
    let engine = GraphEngine::builder("panic", graph, GraphRuntimeState::default())
        .config(fast_config())
        .registry(NodeRegistry::with_builtins().register_kind(NodeKind::Tool, PanickingNode))
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    assert_eq!(failed_node_id(&events).as_deref(), Some("boom"));
    let failure = events.iter().find_map(|e| match e {
        GraphEngineEvent::NodeRunFailed { error, error_type, .. } => Some((error.clone(), error_type.clone())),
        _ => None,
    });
    let (error, error_type) = failure.unwrap();
    assert_eq!(error_type, "Panic");
    assert!(error.contains("mock node exploded"), "{}", error);
}

#[tokio::test]
async fn test_missing_executor_fails_node() {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("mystery", NodeKind::Custom("quantum".into())))
            .edge("start", "mystery")
            .build()
            .unwrap(),
    );
    let engine = GraphEngine::builder("missing", graph, GraphRuntimeState::default())
        .config(fast_config())
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    assert_eq!(failed_node_id(&events).as_deref(), Some("mystery"));
    let error_type = events.iter().find_map(|e| match e {
        GraphEngineEvent::NodeRunFailed { error_type, .. } => Some(error_type.clone()),
        _ => None,
    });
    assert_eq!(error_type.as_deref(), Some("NoExecutor"));
}

// =============================================================================
// Retries
// =============================================================================

#[tokio::test]
async fn test_retry_then_succeed() {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(
                Node::new("flaky", NodeKind::Tool)
                    .with_retry(RetryPolicy::new(3).with_backoff_base(Duration::from_millis(2))),
            )
            .edge("start", "flaky")
            .build()
            .unwrap(),
    );
    let flaky = FailingNode::times("transient", 2);
    let calls = Arc::clone(&flaky.calls);

    let engine = GraphEngine::builder("retry", graph, GraphRuntimeState::default())
        .config(fast_config())
        .registry(NodeRegistry::with_builtins().register_kind(NodeKind::Tool, flaky))
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    assert!(matches!(terminal(&events), GraphEngineEvent::GraphRunSucceeded { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        node_event_names(&events, "flaky"),
        vec!["node_run_started", "node_run_retry", "node_run_retry", "node_run_succeeded"]
    );

    let retry_indexes: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::NodeRunRetry { retry_index, .. } => Some(*retry_index),
            _ => None,
        })
        .collect();
    assert_eq!(retry_indexes, vec![1, 2]);

    // Retries keep the execution id and do not count as new steps
    let flaky_executions: std::collections::HashSet<&str> = events
        .iter()
        .filter_map(|e| e.node_base())
        .filter(|b| b.node_id.as_str() == "flaky")
        .map(|b| b.execution_id.as_str())
        .collect();
    assert_eq!(flaky_executions.len(), 1);
    match terminal(&events) {
        GraphEngineEvent::GraphRunSucceeded { total_steps, .. } => assert_eq!(*total_steps, 2),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn test_retries_exhausted() {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(
                Node::new("flaky", NodeKind::Tool)
                    .with_retry(RetryPolicy::new(1).with_backoff_base(Duration::from_millis(1))),
            )
            .edge("start", "flaky")
            .build()
            .unwrap(),
    );
    let flaky = FailingNode::always("still down");
    let calls = Arc::clone(&flaky.calls);

    let engine = GraphEngine::builder("exhausted", graph, GraphRuntimeState::default())
        .config(fast_config())
        .registry(NodeRegistry::with_builtins().register_kind(NodeKind::Tool, flaky))
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    assert_eq!(failed_node_id(&events).as_deref(), Some("flaky"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(count_events(&events, "node_run_retry"), 1);
}

// =============================================================================
// Error strategies
// =============================================================================

#[tokio::test]
async fn test_fail_branch_routes_to_fallback() {
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("tool", NodeKind::Tool).with_error_strategy(ErrorStrategy::FailBranch))
            .node(Node::new("happy", NodeKind::Code))
            .node(Node::new("fallback", NodeKind::Answer).with_config(json!({
                "answer": "sorry: {{#tool.error_message#}}"
            })))
            .edge("start", "tool")
            .edge("tool", "happy")
            .edge_with_handle("tool", "fallback", FAIL_BRANCH_HANDLE)
            .build()
            .unwrap(),
    );
    let counter = CountingNode::default();
    let registry = NodeRegistry::with_builtins()
        .register_kind(NodeKind::Tool, FailingNode::always("api timeout"))
        .register_kind(NodeKind::Code, counter.clone());

    let engine = GraphEngine::builder("fail-branch", graph, GraphRuntimeState::default())
        .config(fast_config())
        .registry(registry)
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    match terminal(&events) {
        GraphEngineEvent::GraphRunSucceeded { outputs, .. } => {
            assert_eq!(outputs["answer"], json!("sorry: api timeout"));
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(counter.count("happy"), 0);
    assert_eq!(streamed_text(&events, "fallback"), "sorry: api timeout");

    let exception = events.iter().find_map(|e| match e {
        GraphEngineEvent::NodeRunException { strategy, outputs, .. } => Some((strategy.clone(), outputs.clone())),
        _ => None,
    });
    let (strategy, outputs) = exception.unwrap();
    assert_eq!(strategy, "fail-branch");
    assert_eq!(outputs["error_type"], json!("MockFailure"));
}

#[tokio::test]
async fn test_default_value_continues() {
    let mut defaults = Map::new();
    defaults.insert("text".into(), json!("fallback text"));
    let graph = Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(
                Node::new("tool", NodeKind::Tool)
                    .with_error_strategy(ErrorStrategy::DefaultValue { values: defaults }),
            )
            .node(Node::new("end", NodeKind::End).with_config(json!({
                "outputs": [{"variable": "result", "value_selector": ["tool", "text"]}]
            })))
            .edge("start", "tool")
            .edge("tool", "end")
            .build()
            .unwrap(),
    );
    let engine = GraphEngine::builder("default", graph, GraphRuntimeState::default())
        .config(fast_config())
        .registry(NodeRegistry::with_builtins().register_kind(NodeKind::Tool, FailingNode::always("nope")))
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    match terminal(&events) {
        GraphEngineEvent::GraphRunSucceeded { outputs, .. } => {
            assert_eq!(outputs["result"], json!("fallback text"));
        }
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(node_event_names(&events, "tool"), vec!["node_run_started", "node_run_exception"]);
}

// =============================================================================
// Join policies
// =============================================================================

fn join_graph(policy: JoinPolicy) -> Arc<graph_engine::Graph> {
    Arc::new(
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("good", NodeKind::Code))
            .node(Node::new("bad", NodeKind::Tool))
            .node(Node::new("join", NodeKind::Code).with_join_policy(policy))
            .edge("start", "good")
            .edge("start", "bad")
            .edge("good", "join")
            .edge("bad", "join")
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn test_all_succeeded_join_does_not_run() {
    let counter = CountingNode::default();
    let engine = GraphEngine::builder("all", join_graph(JoinPolicy::AllSucceeded), GraphRuntimeState::default())
        .config(fast_config())
        .registry(
            NodeRegistry::with_builtins()
                .register_kind(NodeKind::Tool, FailingNode::always("bad input"))
                .register_kind(NodeKind::Code, counter.clone()),
        )
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    assert_eq!(failed_node_id(&events).as_deref(), Some("bad"));
    assert_eq!(counter.count("good"), 1);
    assert_eq!(counter.count("join"), 0);
}

#[tokio::test]
async fn test_any_succeeded_join_runs() {
    let counter = CountingNode::default();
    let engine = GraphEngine::builder("any", join_graph(JoinPolicy::AnySucceeded), GraphRuntimeState::default())
        .config(fast_config())
        .registry(
            NodeRegistry::with_builtins()
                .register_kind(NodeKind::Tool, FailingNode::always("bad input"))
                .register_kind(NodeKind::Code, counter.clone()),
        )
        .build()
        .await
        .unwrap();
    let events = collect(engine).await;

    // The join ran, but the failure is still reported
    assert_eq!(counter.count("join"), 1);
    assert_eq!(failed_node_id(&events).as_deref(), Some("bad"));
}
