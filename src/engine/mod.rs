//! Graph engine
//!
//! [`GraphEngine`] runs one workflow graph. A run is a lazy event stream:
//! nothing executes until the stream is polled, and dropping the stream
//! cancels every in-flight node.
//!
//! # Example
//!
//! ```ignore
//! let engine = GraphEngine::builder("run-1", graph, GraphRuntimeState::new(pool))
//!     .registry(NodeRegistry::with_builtins().register_kind(NodeKind::Llm, MyLlm))
//!     .layer(Arc::new(DebugLoggingLayer::new()))
//!     .build()
//!     .await?;
//!
//! let mut events = engine.run();
//! while let Some(event) = events.next().await {
//!     println!("{}", event.name());
//! }
//! ```

pub mod edges;
pub mod ready_queue;
pub mod runner;
pub mod worker;
pub mod worker_pool;

pub use ready_queue::{InMemoryReadyQueue, ReadyQueue};
pub use runner::ExecutionStatus;
pub use worker_pool::WorkerPoolManager;

use futures::Stream;
use serde_json::Value;
use std::pin::Pin;
use std::sync::Arc;
use tracing::info;

use crate::command::{create_command_channel, CommandChannel};
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::GraphEngineEvent;
use crate::graph::Graph;
use crate::layers::{GraphEngineLayer, LayerContext, LayerStack};
use crate::nodes::NodeRegistry;
use crate::pause::{ContentStorage, MemoryContentStorage, ResumeContext};
use crate::state::GraphRuntimeState;
use runner::{Runner, RunnerParts};

/// Events of one run, in order; ends after the terminal event
pub type EventStream = Pin<Box<dyn Stream<Item = GraphEngineEvent> + Send>>;

/// Executes a workflow graph
pub struct GraphEngine {
    run_id: String,
    runner: Runner,
    layers: LayerStack,
    channel: Arc<dyn CommandChannel>,
}

impl std::fmt::Debug for GraphEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphEngine")
            .field("run_id", &self.run_id)
            .field("layers", &self.layers)
            .finish()
    }
}

impl GraphEngine {
    /// Start building an engine for one run
    pub fn builder(
        run_id: impl Into<String>,
        graph: Arc<Graph>,
        runtime_state: GraphRuntimeState,
    ) -> GraphEngineBuilder {
        GraphEngineBuilder::new(run_id, graph, runtime_state)
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Channel for sending commands to this run from the same process
    pub fn command_channel(&self) -> Arc<dyn CommandChannel> {
        Arc::clone(&self.channel)
    }

    /// Run the graph from its root
    pub fn run(self) -> EventStream {
        self.into_stream(None)
    }

    /// Continue a paused run
    ///
    /// The runtime state given to the builder must be the one restored from
    /// the run's pause-state blob.
    pub fn resume(self, context: ResumeContext) -> EventStream {
        self.into_stream(Some(context))
    }

    fn into_stream(self, resume: Option<ResumeContext>) -> EventStream {
        let GraphEngine {
            run_id,
            mut runner,
            layers,
            channel,
        } = self;

        Box::pin(async_stream::stream! {
            let ctx = LayerContext {
                run_id: run_id.clone(),
                command_channel: channel,
            };
            layers.initialize(&ctx).await;
            layers.on_graph_start().await;
            runner.start(resume);

            let mut done = false;
            while !done {
                for event in runner.take_events() {
                    layers.on_event(&event).await;
                    if event.is_terminal() {
                        let error = match &event {
                            GraphEngineEvent::GraphRunFailed { error, .. } => Some(error.clone()),
                            GraphEngineEvent::GraphRunAborted { reason, .. } => Some(reason.clone()),
                            _ => None,
                        };
                        layers.on_graph_end(error.as_deref()).await;
                        done = true;
                    }
                    yield event;
                    if done {
                        break;
                    }
                }
                if !done {
                    runner.tick().await;
                }
            }
            info!(run_id = %run_id, status = ?runner.status(), "Event stream closed");
        })
    }
}

/// Builder for [`GraphEngine`]
pub struct GraphEngineBuilder {
    run_id: String,
    graph: Arc<Graph>,
    runtime_state: GraphRuntimeState,
    config: EngineConfig,
    registry: NodeRegistry,
    command_channel: Option<Arc<dyn CommandChannel>>,
    pause_storage: Arc<dyn ContentStorage>,
    generate_entity: Value,
    layers: Vec<Arc<dyn GraphEngineLayer>>,
}

impl GraphEngineBuilder {
    pub fn new(run_id: impl Into<String>, graph: Arc<Graph>, runtime_state: GraphRuntimeState) -> Self {
        Self {
            run_id: run_id.into(),
            graph,
            runtime_state,
            config: EngineConfig::default(),
            registry: NodeRegistry::with_builtins(),
            command_channel: None,
            pause_storage: Arc::new(MemoryContentStorage::new()),
            generate_entity: Value::Null,
            layers: Vec::new(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Node executors; defaults to the built-in nodes only
    pub fn registry(mut self, registry: NodeRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use this channel instead of creating one from the config
    pub fn command_channel(mut self, channel: Arc<dyn CommandChannel>) -> Self {
        self.command_channel = Some(channel);
        self
    }

    /// Where pause-state blobs are written
    pub fn pause_storage(mut self, storage: Arc<dyn ContentStorage>) -> Self {
        self.pause_storage = storage;
        self
    }

    /// Caller context stored alongside the pause state
    pub fn generate_entity(mut self, entity: Value) -> Self {
        self.generate_entity = entity;
        self
    }

    pub fn layer(mut self, layer: Arc<dyn GraphEngineLayer>) -> Self {
        self.layers.push(layer);
        self
    }

    pub async fn build(self) -> Result<GraphEngine, EngineError> {
        self.config.validate()?;

        let channel = match self.command_channel {
            Some(channel) => channel,
            None => create_command_channel(&self.config.command_channel, &self.run_id).await?,
        };

        let mut layers = LayerStack::new(self.config.layer_timeout);
        for layer in self.layers {
            layers.push(layer);
        }

        let runner = Runner::new(RunnerParts {
            run_id: self.run_id.clone(),
            graph: self.graph,
            state: self.runtime_state,
            config: self.config,
            registry: self.registry,
            channel: Arc::clone(&channel),
            storage: self.pause_storage,
            generate_entity: self.generate_entity,
        });

        Ok(GraphEngine {
            run_id: self.run_id,
            runner,
            layers,
            channel,
        })
    }
}
