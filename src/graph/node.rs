//! Node and edge definitions
//!
//! Nodes are a closed set of kinds behind one executor interface. The engine
//! only looks at a node's [`ExecutionType`] to decide how outgoing edges are
//! resolved; concrete behavior lives in [`crate::nodes`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Borrow;

use crate::config::RetryPolicy;

/// Handle used by edges that carry no explicit condition
pub const DEFAULT_HANDLE: &str = "source";

/// Handle selected when a node with [`ErrorStrategy::FailBranch`] fails
pub const FAIL_BRANCH_HANDLE: &str = "fail-branch";

/// Unique identifier for a node in the workflow graph
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub String);

impl NodeId {
    /// Create a new NodeId
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&NodeId> for NodeId {
    fn from(id: &NodeId) -> Self {
        id.clone()
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of a node
///
/// Serialized in kebab-case; anything unrecognized becomes `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeKind {
    Start,
    End,
    Answer,
    IfElse,
    HumanInput,
    Llm,
    Tool,
    Code,
    Iteration,
    Loop,
    #[serde(untagged)]
    Custom(String),
}

impl NodeKind {
    /// Stable string form
    pub fn as_str(&self) -> &str {
        match self {
            NodeKind::Start => "start",
            NodeKind::End => "end",
            NodeKind::Answer => "answer",
            NodeKind::IfElse => "if-else",
            NodeKind::HumanInput => "human-input",
            NodeKind::Llm => "llm",
            NodeKind::Tool => "tool",
            NodeKind::Code => "code",
            NodeKind::Iteration => "iteration",
            NodeKind::Loop => "loop",
            NodeKind::Custom(name) => name,
        }
    }

    /// How the engine treats this kind when routing
    pub fn execution_type(&self) -> ExecutionType {
        match self {
            NodeKind::Start => ExecutionType::Root,
            NodeKind::IfElse => ExecutionType::Branch,
            NodeKind::Answer | NodeKind::End => ExecutionType::Response,
            NodeKind::Iteration | NodeKind::Loop => ExecutionType::Container,
            _ => ExecutionType::Executable,
        }
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing class of a node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionType {
    /// Entry point of the graph
    Root,
    /// Selects exactly one outgoing handle
    Branch,
    /// Contributes to the run's outputs
    Response,
    /// Runs an inner region (iteration, loop)
    Container,
    /// Everything else
    Executable,
}

/// What happens when a node fails after its retries are exhausted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ErrorStrategy {
    /// The failure is branch-local: dependants are resolved by their join policy
    #[default]
    None,
    /// Route through the `fail-branch` handle with error outputs
    FailBranch,
    /// Continue as if the node succeeded with the given outputs
    DefaultValue {
        #[serde(default)]
        values: Map<String, Value>,
    },
}

/// How a node with several prerequisites reacts to a failed prerequisite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// Any failed prerequisite propagates the failure; the node does not run
    #[default]
    AllSucceeded,
    /// Failed prerequisites count as skipped; the node runs if any was taken
    AnySucceeded,
}

/// A node in the workflow graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node identifier, unique within the graph
    pub id: NodeId,

    /// Node kind
    #[serde(rename = "type")]
    pub kind: NodeKind,

    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Kind specific configuration, interpreted by the executor
    #[serde(default)]
    pub config: Value,

    /// Failure handling after retries
    #[serde(default)]
    pub error_strategy: ErrorStrategy,

    /// Retry policy; no retries when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Join behavior when a prerequisite failed
    #[serde(default)]
    pub join_policy: JoinPolicy,
}

impl Node {
    /// Create a node with an empty config
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            title: None,
            config: Value::Null,
            error_strategy: ErrorStrategy::None,
            retry: None,
            join_policy: JoinPolicy::AllSucceeded,
        }
    }

    /// Set the kind specific config
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Set the display title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Set the error strategy
    pub fn with_error_strategy(mut self, strategy: ErrorStrategy) -> Self {
        self.error_strategy = strategy;
        self
    }

    /// Set the retry policy
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Set the join policy
    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = policy;
        self
    }

    /// Routing class of this node
    pub fn execution_type(&self) -> ExecutionType {
        self.kind.execution_type()
    }

    /// Whether this node picks among outgoing handles when it runs or fails
    pub fn is_conditional_source(&self) -> bool {
        self.execution_type() == ExecutionType::Branch
            || self.error_strategy == ErrorStrategy::FailBranch
    }
}

/// A directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Edge identifier, unique within the graph
    pub id: String,

    /// Source node
    pub source_node_id: NodeId,

    /// Target node
    pub target_node_id: NodeId,

    /// Run condition: the handle the source must select for this edge to be taken
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
}

impl Edge {
    /// Effective handle of this edge
    pub fn handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_HANDLE)
    }
}
