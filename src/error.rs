//! Error types for the graph engine
//!
//! Each concern has its own error enum. Node-level and control-plane errors are
//! recovered by the engine loop and surfaced only as events; graph validation,
//! configuration, and storage errors reach the caller.

use thiserror::Error;

/// Errors raised while building or validating a [`Graph`](crate::graph::Graph)
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GraphBuildError {
    /// The graph has no nodes at all
    #[error("Graph has no nodes")]
    Empty,

    /// Two nodes share the same id
    #[error("Duplicate node id: {0}")]
    DuplicateNode(String),

    /// Two edges share the same id
    #[error("Duplicate edge id: {0}")]
    DuplicateEdge(String),

    /// An edge points at a node that does not exist
    #[error("Edge {edge_id} references unknown node {node_id}")]
    UnknownNode { edge_id: String, node_id: String },

    /// No node qualifies as the root
    #[error("Graph has no root node")]
    NoRoot,

    /// More than one node qualifies as the root
    #[error("Graph has multiple root candidates: {0:?}")]
    AmbiguousRoot(Vec<String>),

    /// The configured root has incoming edges
    #[error("Root node {0} must not have incoming edges")]
    RootHasIncoming(String),

    /// The graph is not acyclic
    #[error("Cycle detected involving node {0}")]
    CycleDetected(String),

    /// A node cannot be reached from the root
    #[error("Node {0} is not reachable from the root")]
    Unreachable(String),

    /// Parallel groups nest deeper than allowed
    #[error("Parallel group {parallel_id} exceeds {limit} levels of nesting")]
    ParallelDepthExceeded { parallel_id: String, limit: usize },

    /// A node's configuration could not be interpreted
    #[error("Invalid config for node {node_id}: {message}")]
    InvalidNodeConfig { node_id: String, message: String },
}

impl GraphBuildError {
    /// Create an invalid node config error
    pub fn invalid_config(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidNodeConfig {
            node_id: node_id.into(),
            message: message.into(),
        }
    }
}

/// Error produced by a node executor
///
/// Converted by the engine into `NodeRunFailed` (or `NodeRunException` when the
/// node has an error strategy); never propagated out of the engine loop.
#[derive(Debug, Error)]
#[error("{error_type}: {message}")]
pub struct NodeError {
    /// Human readable failure message
    pub message: String,
    /// Short classification, exposed to fail-branch outputs as `error_type`
    pub error_type: String,
    /// Underlying cause, if any
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl NodeError {
    /// Error type used when none is given
    pub const DEFAULT_TYPE: &'static str = "NodeError";

    /// Create a node error with the default type
    pub fn new(message: impl Into<String>) -> Self {
        Self::typed(Self::DEFAULT_TYPE, message)
    }

    /// Create a node error with an explicit type
    pub fn typed(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: error_type.into(),
            source: None,
        }
    }

    /// Create a node error wrapping a source error
    pub fn with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            message: message.into(),
            error_type: Self::DEFAULT_TYPE.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// The node observed the run's cancellation token
    pub fn cancelled() -> Self {
        Self::typed("Cancelled", "node execution cancelled")
    }

    /// The node's future panicked
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::typed("Panic", message)
    }

    /// No executor is registered for the node's kind
    pub fn no_executor(kind: impl std::fmt::Display) -> Self {
        Self::typed("NoExecutor", format!("no executor registered for node kind {}", kind))
    }

    /// Check if this error came from cancellation
    pub fn is_cancelled(&self) -> bool {
        self.error_type == "Cancelled"
    }
}

/// Errors from a command channel backend
#[derive(Debug, Error)]
pub enum CommandChannelError {
    /// Could not reach the backend
    #[error("Command channel connection failed: {0}")]
    Connection(String),

    /// A command could not be encoded
    #[error("Command serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend rejected an operation
    #[error("Command channel backend error: {0}")]
    Backend(String),
}

/// Errors from pause-state content storage
#[derive(Debug, Error)]
pub enum StorageError {
    /// No content stored under the key
    #[error("No content stored at {0}")]
    NotFound(String),

    /// Filesystem failure
    #[error("I/O error for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Content could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// zstd failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Backend specific failure
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// The key cannot name a location inside the store
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),
}

impl StorageError {
    /// Create an I/O error for a key
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }

    /// Check if the error is worth retrying
    pub fn is_recoverable(&self) -> bool {
        matches!(self, StorageError::Io { .. } | StorageError::Backend(_))
    }
}

/// Errors raised by engine layers; logged and swallowed by the engine
#[derive(Debug, Error)]
pub enum LayerError {
    /// The layer reported a failure
    #[error("Layer {layer} failed: {message}")]
    Failed { layer: String, message: String },

    /// The layer did not return within the configured bound
    #[error("Layer {layer} timed out")]
    Timeout { layer: String },
}

impl LayerError {
    /// Create a layer failure
    pub fn failed(layer: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Failed {
            layer: layer.into(),
            message: message.into(),
        }
    }
}

/// Errors returned to callers constructing or resuming an engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Graph validation failed
    #[error(transparent)]
    Graph(#[from] GraphBuildError),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal bookkeeping is inconsistent with the graph
    #[error("Engine invariant violated: {0}")]
    InvariantViolation(String),

    /// Runtime state could not be (de)serialized
    #[error("State serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Pause-state storage failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Command channel failed
    #[error(transparent)]
    CommandChannel(#[from] CommandChannelError),
}

impl EngineError {
    /// Create a config error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Create an invariant violation
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }
}
