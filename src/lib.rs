//! graph-engine: workflow graph execution engine
//!
//! Runs a directed acyclic graph of typed nodes with a dynamically sized
//! worker pool, orders streamed answer output across parallel branches, and
//! can pause a run durably and resume it later.
//!
//! - [`Graph`]: validated nodes and edges with derived parallel groups
//! - [`GraphEngine`]: the run loop, exposed as a lazy event stream
//! - [`NodeExecutor`]: what every node kind implements
//! - [`CommandChannel`]: abort or pause a run from outside
//! - [`ResponseStreamCoordinator`]: deterministic answer streaming
//! - [`GraphEngineLayer`]: observers for logging, limits and persistence
//!
//! # Example
//!
//! ```rust,ignore
//! use futures::StreamExt;
//! use graph_engine::{GraphEngine, GraphRuntimeState, NodeRegistry, VariablePool};
//!
//! let engine = GraphEngine::builder("run-1", graph, GraphRuntimeState::new(VariablePool::new()))
//!     .registry(NodeRegistry::with_builtins().register_kind(NodeKind::Llm, MyLlm))
//!     .build()
//!     .await?;
//!
//! let mut events = engine.run();
//! while let Some(event) = events.next().await {
//!     // forward to the client
//! }
//! ```

pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod layers;
pub mod nodes;
pub mod pause;
pub mod response;
pub mod state;

// Re-exports for convenience
pub use error::{CommandChannelError, EngineError, GraphBuildError, LayerError, NodeError, StorageError};
pub use config::{EngineConfig, RetryPolicy, WorkerPoolConfig};
pub use graph::{
    Edge, ErrorStrategy, ExecutionType, Graph, GraphBuilder, GraphConfig, JoinPolicy, Node, NodeId,
    NodeKind, Parallel,
};
pub use state::{
    EdgeState, ExecutionSnapshot, GraphRuntimeState, NodeStatus, RouteNodeState, Selector,
    VariablePool,
};
pub use events::{FailureKind, GraphEngineEvent, NodeEventBase, ParallelInfo};
pub use engine::{
    EventStream, ExecutionStatus, GraphEngine, GraphEngineBuilder, InMemoryReadyQueue, ReadyQueue,
    WorkerPoolManager,
};
pub use nodes::{NodeChunk, NodeContext, NodeExecutor, NodeRegistry, NodeRunResult, Template};
pub use command::{
    create_command_channel, send_command, CommandChannel, CommandChannelConfig, GraphEngineCommand,
    InMemoryChannel,
};
#[cfg(feature = "command-channel-redis")]
pub use command::RedisChannel;
pub use response::{ResponseChunk, ResponseStreamCoordinator};
pub use pause::{
    load_pause_state, pause_state_key, save_pause_state, ContentStorage, FileContentStorage,
    MemoryContentStorage, PauseReason, PauseStateBlob, ResumeContext, WorkflowPauseEntity,
};

// Layer exports
pub use layers::{
    DebugLoggingLayer, ExecutionLimitsLayer, ExecutionRepository, GraphEngineLayer,
    InMemoryExecutionRepository, LayerContext, PersistenceLayer,
};
