//! Shared mock nodes and helpers for the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use graph_engine::{
    EngineConfig, EventStream, GraphEngine, GraphEngineEvent, NodeContext, NodeError, NodeExecutor, NodeId,
    NodeRunResult,
};

// =============================================================================
// Mock nodes
// =============================================================================

/// Streams scripted chunks on `text`, sleeping before each one
pub struct ScriptedLlm {
    pub script: Vec<(Duration, String)>,
    pub tokens: u64,
}

impl ScriptedLlm {
    pub fn new(chunks: &[&str], delay: Duration) -> Self {
        Self {
            script: chunks.iter().map(|c| (delay, c.to_string())).collect(),
            tokens: 0,
        }
    }

    /// Each chunk with its own delay
    pub fn timed(script: &[(u64, &str)]) -> Self {
        Self {
            script: script
                .iter()
                .map(|(ms, c)| (Duration::from_millis(*ms), c.to_string()))
                .collect(),
            tokens: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens = tokens;
        self
    }
}

#[async_trait]
impl NodeExecutor for ScriptedLlm {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let mut text = String::new();
        for (delay, chunk) in &self.script {
            tokio::time::sleep(*delay).await;
            ctx.stream("text", chunk.as_str());
            text.push_str(chunk);
        }
        ctx.finish_stream("text");
        Ok(NodeRunResult::success(json!({ "text": text })).with_tokens(self.tokens))
    }
}

/// Fails its first `failures` runs, then succeeds
pub struct FailingNode {
    pub message: String,
    pub failures: usize,
    pub calls: Arc<AtomicUsize>,
}

impl FailingNode {
    pub fn always(message: &str) -> Self {
        Self::times(message, usize::MAX)
    }

    pub fn times(message: &str, failures: usize) -> Self {
        Self {
            message: message.to_string(),
            failures,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl NodeExecutor for FailingNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(NodeError::typed("MockFailure", self.message.clone()));
        }
        Ok(NodeRunResult::success(json!({ "attempt": ctx.attempt })))
    }
}

/// Panics when run
pub struct PanickingNode;

#[async_trait]
impl NodeExecutor for PanickingNode {
    async fn run(&self, _ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        panic!("mock node exploded");
    }
}

/// Sleeps for `duration` unless cancelled first
pub struct SlowNode {
    pub duration: Duration,
    pub cancelled: Arc<AtomicBool>,
    pub started: Arc<AtomicUsize>,
}

impl SlowNode {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            cancelled: Arc::new(AtomicBool::new(false)),
            started: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl NodeExecutor for SlowNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::select! {
            _ = ctx.cancel.cancelled() => {
                self.cancelled.store(true, Ordering::SeqCst);
                Err(NodeError::cancelled())
            }
            _ = tokio::time::sleep(self.duration) => {
                Ok(NodeRunResult::success(json!({ "slept_ms": self.duration.as_millis() as u64 })))
            }
        }
    }
}

/// Records how often each node ran
#[derive(Clone, Default)]
pub struct CountingNode {
    pub runs: Arc<Mutex<HashMap<NodeId, usize>>>,
}

impl CountingNode {
    pub fn count(&self, node_id: &str) -> usize {
        self.runs.lock().get(node_id).copied().unwrap_or(0)
    }
}

#[async_trait]
impl NodeExecutor for CountingNode {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        *self.runs.lock().entry(ctx.node.id.clone()).or_insert(0) += 1;
        tokio::time::sleep(Duration::from_millis(2)).await;
        Ok(NodeRunResult::success(json!({ "text": ctx.node.id.to_string() })))
    }
}

/// Tracks how many nodes run at the same time
#[derive(Clone, Default)]
pub struct ConcurrencyProbe {
    pub current: Arc<AtomicUsize>,
    pub max: Arc<AtomicUsize>,
}

impl ConcurrencyProbe {
    pub fn max_seen(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NodeExecutor for ConcurrencyProbe {
    async fn run(&self, _ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(30)).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeRunResult::default())
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Config with a short poll interval for tests
pub fn fast_config() -> EngineConfig {
    EngineConfig::default().with_poll_interval(Duration::from_millis(1))
}

pub fn inputs(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

/// Run to completion and collect every event
pub async fn collect(engine: GraphEngine) -> Vec<GraphEngineEvent> {
    drain(engine.run()).await
}

/// Drain an event stream, failing the test if it does not end
pub async fn drain(stream: EventStream) -> Vec<GraphEngineEvent> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect::<Vec<_>>())
        .await
        .expect("run did not finish in time")
}

pub fn terminal(events: &[GraphEngineEvent]) -> &GraphEngineEvent {
    let last = events.last().expect("no events");
    assert!(last.is_terminal(), "last event is not terminal: {:?}", last);
    last
}

/// Concatenated stream chunks attributed to a node
pub fn streamed_text(events: &[GraphEngineEvent], node_id: &str) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            GraphEngineEvent::NodeRunStreamChunk { base, chunk, .. } if base.node_id.as_str() == node_id => {
                Some(chunk.as_str())
            }
            _ => None,
        })
        .collect()
}

/// Names of the events for one node, in order
pub fn node_event_names(events: &[GraphEngineEvent], node_id: &str) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| e.node_id().map(|id| id.as_str()) == Some(node_id))
        .filter(|e| !matches!(e, GraphEngineEvent::NodeRunStreamChunk { .. }))
        .map(|e| e.name())
        .collect()
}

pub fn count_events(events: &[GraphEngineEvent], name: &str) -> usize {
    events.iter().filter(|e| e.name() == name).count()
}
