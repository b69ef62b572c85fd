//! Node executors
//!
//! The engine runs every node through the same [`NodeExecutor`] interface:
//! an executor receives a [`NodeContext`], may stream partial output through
//! it, and returns a [`NodeRunResult`] or a [`NodeError`]. Executors are looked
//! up in a [`NodeRegistry`], first by node id, then by kind.
//!
//! # Example
//!
//! ```ignore
//! struct Echo;
//!
//! #[async_trait]
//! impl NodeExecutor for Echo {
//!     async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError> {
//!         ctx.stream("text", "hel");
//!         ctx.stream("text", "lo");
//!         ctx.finish_stream("text");
//!         Ok(NodeRunResult::success(json!({"text": "hello"})))
//!     }
//! }
//!
//! let registry = NodeRegistry::with_builtins().register_kind(NodeKind::Llm, Echo);
//! ```

pub mod builtin;
pub mod template;

pub use builtin::{AnswerNode, EndNode, HumanInputNode, IfElseNode, StartNode};
pub use template::{Segment, Template};

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::NodeError;
use crate::graph::{Node, NodeId, NodeKind};
use crate::pause::PauseReason;
use crate::state::{Selector, VariablePool};

/// A piece of streamed node output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeChunk {
    /// Output field the chunk belongs to
    pub field: String,
    pub chunk: String,
    /// The field's stream is complete
    pub is_final: bool,
}

type ChunkSink = Arc<dyn Fn(NodeChunk) + Send + Sync>;

/// Everything a node sees while it runs
#[derive(Clone)]
pub struct NodeContext {
    pub node: Arc<Node>,
    /// Pool snapshot taken at dispatch
    pub variables: Arc<VariablePool>,
    /// Cancelled when the run aborts
    pub cancel: CancellationToken,
    /// 0 on the first attempt
    pub attempt: usize,
    pub execution_id: String,
    sink: ChunkSink,
}

impl std::fmt::Debug for NodeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeContext")
            .field("node", &self.node.id)
            .field("attempt", &self.attempt)
            .field("execution_id", &self.execution_id)
            .finish()
    }
}

impl NodeContext {
    /// Context with a discarding chunk sink, useful outside the engine
    pub fn new(node: Arc<Node>, variables: Arc<VariablePool>) -> Self {
        Self {
            node,
            variables,
            cancel: CancellationToken::new(),
            attempt: 0,
            execution_id: uuid::Uuid::new_v4().to_string(),
            sink: Arc::new(|_| {}),
        }
    }

    /// Replace the chunk sink
    pub fn with_chunk_sink(mut self, sink: impl Fn(NodeChunk) + Send + Sync + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_execution_id(mut self, execution_id: impl Into<String>) -> Self {
        self.execution_id = execution_id.into();
        self
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    /// Emit a partial value for an output field
    pub fn stream(&self, field: impl Into<String>, chunk: impl Into<String>) {
        (self.sink)(NodeChunk {
            field: field.into(),
            chunk: chunk.into(),
            is_final: false,
        });
    }

    /// Close the stream of an output field
    pub fn finish_stream(&self, field: impl Into<String>) {
        (self.sink)(NodeChunk {
            field: field.into(),
            chunk: String::new(),
            is_final: true,
        });
    }

    /// Look up a pool value
    pub fn get(&self, selector: &Selector) -> Option<&Value> {
        self.variables.get(selector)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Terminal result of a node run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeRunResult {
    pub outputs: Map<String, Value>,
    /// Handle selected by a branch node
    pub edge_source_handle: Option<String>,
    /// The node asks the run to pause here
    pub pause: Option<PauseReason>,
    pub total_tokens: u64,
}

impl NodeRunResult {
    /// Successful result; non-object values become `{"output": value}`
    pub fn success(outputs: Value) -> Self {
        let outputs = match outputs {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("output".to_string(), other);
                map
            }
        };
        Self {
            outputs,
            ..Default::default()
        }
    }

    /// Successful branch result selecting a handle
    pub fn branch(handle: impl Into<String>, outputs: Value) -> Self {
        Self {
            edge_source_handle: Some(handle.into()),
            ..Self::success(outputs)
        }
    }

    /// Pause request
    pub fn paused(reason: PauseReason) -> Self {
        Self {
            pause: Some(reason),
            ..Default::default()
        }
    }

    pub fn with_tokens(mut self, total_tokens: u64) -> Self {
        self.total_tokens = total_tokens;
        self
    }
}

/// Executes one kind of node
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn run(&self, ctx: NodeContext) -> Result<NodeRunResult, NodeError>;
}

/// Executor lookup by node id and by kind
#[derive(Clone, Default)]
pub struct NodeRegistry {
    by_kind: HashMap<NodeKind, Arc<dyn NodeExecutor>>,
    by_node: HashMap<NodeId, Arc<dyn NodeExecutor>>,
}

impl std::fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("kinds", &self.by_kind.keys().collect::<Vec<_>>())
            .field("nodes", &self.by_node.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl NodeRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with Start, End, Answer, IfElse and HumanInput executors
    pub fn with_builtins() -> Self {
        Self::new()
            .register_kind(NodeKind::Start, StartNode)
            .register_kind(NodeKind::End, EndNode)
            .register_kind(NodeKind::Answer, AnswerNode)
            .register_kind(NodeKind::IfElse, IfElseNode)
            .register_kind(NodeKind::HumanInput, HumanInputNode)
    }

    /// Executor for every node of a kind
    pub fn register_kind(mut self, kind: NodeKind, executor: impl NodeExecutor + 'static) -> Self {
        self.by_kind.insert(kind, Arc::new(executor));
        self
    }

    /// Executor for one node, taking precedence over its kind
    pub fn register_node(
        mut self,
        node_id: impl Into<NodeId>,
        executor: impl NodeExecutor + 'static,
    ) -> Self {
        self.by_node.insert(node_id.into(), Arc::new(executor));
        self
    }

    /// Executor for a node
    pub fn resolve(&self, node: &Node) -> Option<Arc<dyn NodeExecutor>> {
        self.by_node
            .get(&node.id)
            .or_else(|| self.by_kind.get(&node.kind))
            .cloned()
    }
}
