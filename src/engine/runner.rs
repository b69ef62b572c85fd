//! The run loop
//!
//! [`Runner`] owns every piece of mutable run state. It is driven one
//! [`tick`](Runner::tick) at a time by the event stream: poll commands,
//! dispatch ready nodes, resize the pool, consume worker messages, and check
//! whether the run is over. Events produced along the way are buffered and
//! handed out with [`take_events`](Runner::take_events).

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::edges::{resolve_outgoing, Resolution};
use super::ready_queue::{InMemoryReadyQueue, ReadyQueue};
use super::worker::{WorkItem, WorkerMessage, WorkerPool};
use super::worker_pool::WorkerPoolManager;
use crate::command::{CommandChannel, GraphEngineCommand};
use crate::config::EngineConfig;
use crate::error::NodeError;
use crate::events::{FailureKind, GraphEngineEvent, NodeEventBase, ParallelInfo};
use crate::graph::{ErrorStrategy, ExecutionType, Graph, Node, NodeId};
use crate::nodes::{NodeChunk, NodeRegistry, NodeRunResult};
use crate::pause::{save_pause_state, ContentStorage, PauseReason, PauseStateBlob, ResumeContext};
use crate::response::{ResponseChunk, ResponseStreamCoordinator};
use crate::state::{GraphRuntimeState, NodeStatus, RouteNodeState, Selector};

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Initializing,
    Running,
    Succeeded,
    Failed,
    Paused,
    Aborted,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ExecutionStatus::Initializing | ExecutionStatus::Running)
    }
}

#[derive(Debug, Clone)]
struct InFlight {
    execution_id: String,
    attempt: usize,
}

#[derive(Debug, Clone)]
struct Failure {
    error: String,
    node_id: Option<NodeId>,
}

pub(crate) struct Runner {
    run_id: String,
    graph: Arc<Graph>,
    state: GraphRuntimeState,
    config: EngineConfig,
    registry: NodeRegistry,
    channel: Arc<dyn CommandChannel>,
    storage: Arc<dyn ContentStorage>,
    generate_entity: Value,

    manager: Arc<WorkerPoolManager>,
    workers: WorkerPool,
    inbox: mpsc::UnboundedReceiver<WorkerMessage>,
    outbound: mpsc::UnboundedSender<WorkerMessage>,
    ready: InMemoryReadyQueue,
    executing: HashMap<NodeId, InFlight>,
    pending_retries: HashSet<NodeId>,
    execution_ids: HashMap<NodeId, String>,
    coordinator: ResponseStreamCoordinator,
    cancel: CancellationToken,

    status: ExecutionStatus,
    failure: Option<Failure>,
    pause_requested: Option<String>,
    events: Vec<GraphEngineEvent>,
}

pub(crate) struct RunnerParts {
    pub run_id: String,
    pub graph: Arc<Graph>,
    pub state: GraphRuntimeState,
    pub config: EngineConfig,
    pub registry: NodeRegistry,
    pub channel: Arc<dyn CommandChannel>,
    pub storage: Arc<dyn ContentStorage>,
    pub generate_entity: Value,
}

impl Runner {
    pub fn new(parts: RunnerParts) -> Self {
        let (outbound, inbox) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let manager = Arc::new(WorkerPoolManager::new(parts.config.worker_pool.clone()));
        let workers = WorkerPool::new(outbound.clone(), Arc::clone(&manager), cancel.clone());
        let coordinator = ResponseStreamCoordinator::new(&parts.graph);

        Self {
            run_id: parts.run_id,
            graph: parts.graph,
            state: parts.state,
            config: parts.config,
            registry: parts.registry,
            channel: parts.channel,
            storage: parts.storage,
            generate_entity: parts.generate_entity,
            manager,
            workers,
            inbox,
            outbound,
            ready: InMemoryReadyQueue::new(),
            executing: HashMap::new(),
            pending_retries: HashSet::new(),
            execution_ids: HashMap::new(),
            coordinator,
            cancel,
            status: ExecutionStatus::Initializing,
            failure: None,
            pause_requested: None,
            events: Vec::new(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.status
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Events produced since the last call
    pub fn take_events(&mut self) -> Vec<GraphEngineEvent> {
        std::mem::take(&mut self.events)
    }

    /// Seed the ready queue and start the initial workers
    pub fn start(&mut self, resume: Option<ResumeContext>) {
        let resumed = resume.is_some();
        info!(run_id = %self.run_id, resumed, nodes = self.graph.len(), "Graph run started");
        self.emit(GraphEngineEvent::GraphRunStarted {
            run_id: self.run_id.clone(),
            resumed,
        });

        match resume {
            Some(context) => self.restore(context),
            None => {
                let root = self.graph.root_node_id().clone();
                if !self.state.execution.node_status(root.as_str()).is_terminal() {
                    self.ready.push(root);
                }
            }
        }

        let chunks = self.coordinator.on_graph_start(&self.state.variable_pool);
        self.emit_response_chunks(chunks);

        let initial = self.manager.calculate_initial_workers(&self.graph);
        for _ in 0..initial {
            self.workers.spawn_worker();
        }
        info!(run_id = %self.run_id, workers = initial, queue_depth = self.ready.len(), "Workers started");
        self.status = ExecutionStatus::Running;
    }

    fn restore(&mut self, context: ResumeContext) {
        for (selector, value) in context.inputs {
            debug!(run_id = %self.run_id, selector = %selector, "Applying resume input");
            self.state.variable_pool.set(&selector, value);
        }
        if let Some(snapshot) = self.state.execution.response.take() {
            self.coordinator.restore(snapshot);
        }

        let queued = std::mem::take(&mut self.state.execution.ready_queue);
        let paused = std::mem::take(&mut self.state.paused_node_ids);
        self.state.pause_reasons.clear();

        for node_id in queued {
            self.ready.push(node_id);
        }
        for node_id in paused {
            self.state.execution.route_states.remove(&node_id);
            self.state.execution.retry_attempts.remove(&node_id);
            self.ready.push(node_id);
        }

        let root = self.graph.root_node_id().clone();
        if self.ready.is_empty() && !self.state.execution.route_states.contains_key(&root) {
            self.ready.push(root);
        }
        info!(run_id = %self.run_id, queue_depth = self.ready.len(), "Run resumed");
    }

    /// One iteration of the run loop
    pub async fn tick(&mut self) {
        if self.is_finished() {
            return;
        }

        self.process_commands().await;
        if self.is_finished() {
            return;
        }

        self.dispatch_ready();
        if self.is_finished() {
            return;
        }

        self.scale_workers();
        self.drain_messages().await;
        if self.is_finished() {
            return;
        }

        self.check_completion().await;
    }

    async fn process_commands(&mut self) {
        let commands = match self.channel.fetch_commands().await {
            Ok(commands) => commands,
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Failed to fetch commands");
                return;
            }
        };

        for command in commands {
            let reason = command.reason_or_default();
            match command {
                GraphEngineCommand::Abort { .. } => {
                    self.abort(reason).await;
                    return;
                }
                GraphEngineCommand::Pause { .. } => {
                    if self.pause_requested.is_none() {
                        info!(run_id = %self.run_id, reason = %reason, "Pause requested");
                        self.pause_requested = Some(reason);
                    }
                }
            }
        }
    }

    fn dispatch_ready(&mut self) {
        if self.pause_requested.is_some() {
            return;
        }
        while self.workers.idle_count() > 0 && !self.is_finished() {
            let Some(node_id) = self.ready.pop() else {
                break;
            };
            self.dispatch_node(node_id);
        }
    }

    fn dispatch_node(&mut self, node_id: NodeId) {
        let Some(node) = self.graph.node(node_id.as_str()).cloned() else {
            self.fail_invariant(format!("ready node '{}' is not in the graph", node_id));
            return;
        };
        if self.state.execution.node_status(node_id.as_str()).is_terminal()
            || self.executing.contains_key(&node_id)
        {
            debug!(run_id = %self.run_id, node_id = %node_id, "Node already handled, not dispatching");
            return;
        }

        let attempt = self
            .state
            .execution
            .retry_attempts
            .get(&node_id)
            .copied()
            .unwrap_or(0);
        let execution_id = self.execution_id(&node_id);

        if attempt == 0 {
            self.state.node_run_steps += 1;
            self.state.execution.route_states.insert(
                node_id.clone(),
                RouteNodeState::running(node_id.clone(), self.state.node_run_steps),
            );
            let base = self.base(&node, &execution_id);
            self.emit(GraphEngineEvent::NodeRunStarted { base });
        }

        let Some(executor) = self.registry.resolve(&node) else {
            self.apply_error_strategy(&node, &execution_id, NodeError::no_executor(&node.kind));
            return;
        };

        let item = WorkItem {
            node: Arc::clone(&node),
            executor,
            variables: Arc::new(self.state.variable_pool.clone()),
            attempt,
            execution_id: execution_id.clone(),
        };
        match self.workers.dispatch(item) {
            Ok(worker_id) => {
                debug!(
                    run_id = %self.run_id,
                    node_id = %node_id,
                    worker_id,
                    attempt,
                    "Node dispatched"
                );
                self.executing.insert(node_id, InFlight { execution_id, attempt });
            }
            Err(_) => {
                self.ready.push(node_id);
            }
        }
    }

    fn scale_workers(&mut self) {
        let current = self.workers.len();
        let queue_depth = self.ready.len();
        if self.pause_requested.is_none()
            && self.manager.should_scale_up(current, queue_depth, self.executing.len())
        {
            let worker_id = self.workers.spawn_worker();
            info!(
                run_id = %self.run_id,
                worker_id,
                workers = self.workers.len(),
                queue_depth,
                "Scaled up worker pool"
            );
            return;
        }

        for worker_id in self.manager.get_idle_workers(Instant::now()) {
            let Some(last) = self.manager.last_activity(worker_id) else {
                continue;
            };
            if self.workers.is_idle(worker_id)
                && self.manager.should_scale_down(self.workers.len(), worker_id, last)
                && self.workers.remove_worker(worker_id)
            {
                info!(
                    run_id = %self.run_id,
                    worker_id,
                    workers = self.workers.len(),
                    "Scaled down worker pool"
                );
            }
        }
    }

    async fn drain_messages(&mut self) {
        let mut handled = false;
        while let Ok(message) = self.inbox.try_recv() {
            handled = true;
            self.handle_message(message);
            if self.is_finished() {
                return;
            }
        }
        if handled || self.is_quiescent() {
            return;
        }
        if let Ok(Some(message)) = tokio::time::timeout(self.config.poll_interval, self.inbox.recv()).await {
            self.handle_message(message);
        }
    }

    fn handle_message(&mut self, message: WorkerMessage) {
        match message {
            WorkerMessage::Chunk {
                node_id,
                execution_id,
                chunk,
            } => self.on_chunk(node_id, execution_id, chunk),
            WorkerMessage::Finished {
                worker_id,
                node_id,
                execution_id,
                result,
            } => {
                self.workers.mark_idle(worker_id);
                self.on_finished(node_id, execution_id, result);
            }
            WorkerMessage::RetryDue { node_id } => {
                if self.pending_retries.remove(&node_id) {
                    self.ready.push(node_id);
                }
            }
        }
    }

    fn on_chunk(&mut self, node_id: NodeId, execution_id: String, chunk: NodeChunk) {
        let in_flight = self
            .executing
            .get(&node_id)
            .map(|f| f.execution_id == execution_id)
            .unwrap_or(false);
        if !in_flight {
            self.fail_invariant(format!("stream chunk from node '{}' which is not running", node_id));
            return;
        }
        let selector = Selector::new(node_id, chunk.field);
        let chunks = self.coordinator.on_stream_chunk(
            &selector,
            &chunk.chunk,
            chunk.is_final,
            &self.state.variable_pool,
        );
        self.emit_response_chunks(chunks);
    }

    fn on_finished(
        &mut self,
        node_id: NodeId,
        execution_id: String,
        result: Result<NodeRunResult, NodeError>,
    ) {
        let in_flight = match self.executing.remove(&node_id) {
            Some(in_flight) if in_flight.execution_id == execution_id => in_flight,
            _ => {
                self.fail_invariant(format!("result from node '{}' which is not running", node_id));
                return;
            }
        };
        let Some(node) = self.graph.node(node_id.as_str()).cloned() else {
            self.fail_invariant(format!("result from unknown node '{}'", node_id));
            return;
        };

        match result {
            Ok(result) => match result.pause.clone() {
                Some(reason) => self.on_node_paused(&node, &execution_id, reason),
                None => self.on_node_succeeded(&node, &execution_id, result),
            },
            Err(e) => self.on_node_error(&node, &execution_id, in_flight.attempt, e),
        }
    }

    fn on_node_succeeded(&mut self, node: &Arc<Node>, execution_id: &str, result: NodeRunResult) {
        self.state.variable_pool.add_outputs(&node.id, &result.outputs);
        self.state.total_tokens += result.total_tokens;
        if node.execution_type() == ExecutionType::Response {
            self.state.merge_response_outputs(&result.outputs);
        }
        self.finish_route(&node.id, NodeStatus::Success, None);
        debug!(run_id = %self.run_id, node_id = %node.id, "Node succeeded");

        let base = self.base(node, execution_id);
        self.emit(GraphEngineEvent::NodeRunSucceeded {
            base,
            outputs: result.outputs,
            edge_source_handle: result.edge_source_handle.clone(),
        });

        let chunks = self.coordinator.on_node_finished(&node.id, &self.state.variable_pool);
        self.emit_response_chunks(chunks);
        self.resolve_edges(
            node,
            Resolution::Success {
                handle: result.edge_source_handle.as_deref(),
            },
        );
    }

    fn on_node_paused(&mut self, node: &Arc<Node>, execution_id: &str, reason: PauseReason) {
        info!(run_id = %self.run_id, node_id = %node.id, "Node requested pause");
        self.finish_route(&node.id, NodeStatus::Paused, None);
        self.state.paused_node_ids.push(node.id.clone());
        self.state.pause_reasons.push(reason.clone());
        let base = self.base(node, execution_id);
        self.emit(GraphEngineEvent::NodeRunPauseRequested { base, reason });
    }

    fn on_node_error(&mut self, node: &Arc<Node>, execution_id: &str, attempt: usize, error: NodeError) {
        if let Some(policy) = node.retry.as_ref() {
            if !error.is_cancelled() && policy.should_retry(attempt) {
                let next = attempt + 1;
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    run_id = %self.run_id,
                    node_id = %node.id,
                    attempt = next,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Node failed, scheduling retry"
                );
                self.state.execution.retry_attempts.insert(node.id.clone(), next);
                let base = self.base(node, execution_id);
                self.emit(GraphEngineEvent::NodeRunRetry {
                    base,
                    error: error.message.clone(),
                    retry_index: next,
                });
                self.schedule_retry(node.id.clone(), delay);
                return;
            }
        }
        self.apply_error_strategy(node, execution_id, error);
    }

    fn schedule_retry(&mut self, node_id: NodeId, delay: std::time::Duration) {
        self.pending_retries.insert(node_id.clone());
        let outbound = self.outbound.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = outbound.send(WorkerMessage::RetryDue { node_id });
                }
            }
        });
    }

    fn apply_error_strategy(&mut self, node: &Arc<Node>, execution_id: &str, error: NodeError) {
        match node.error_strategy.clone() {
            ErrorStrategy::None => {
                warn!(run_id = %self.run_id, node_id = %node.id, error = %error, "Node failed");
                self.finish_route(&node.id, NodeStatus::Failed, Some(error.message.clone()));
                let base = self.base(node, execution_id);
                self.emit(GraphEngineEvent::NodeRunFailed {
                    base,
                    error: error.message.clone(),
                    error_type: error.error_type.clone(),
                });
                if self.failure.is_none() {
                    self.failure = Some(Failure {
                        error: error.message,
                        node_id: Some(node.id.clone()),
                    });
                }
                let chunks = self.coordinator.on_node_finished(&node.id, &self.state.variable_pool);
                self.emit_response_chunks(chunks);
                self.resolve_edges(node, Resolution::Failed);
            }
            ErrorStrategy::FailBranch => {
                let outputs = error_outputs(Map::new(), &error);
                self.on_node_exception(node, execution_id, error, "fail-branch", outputs);
                self.resolve_edges(node, Resolution::FailBranch);
            }
            ErrorStrategy::DefaultValue { values } => {
                let outputs = error_outputs(values, &error);
                self.on_node_exception(node, execution_id, error, "default-value", outputs);
                self.resolve_edges(node, Resolution::Success { handle: None });
            }
        }
    }

    fn on_node_exception(
        &mut self,
        node: &Arc<Node>,
        execution_id: &str,
        error: NodeError,
        strategy: &str,
        outputs: Map<String, Value>,
    ) {
        warn!(
            run_id = %self.run_id,
            node_id = %node.id,
            strategy,
            error = %error,
            "Node failed, continuing by error strategy"
        );
        self.state.variable_pool.add_outputs(&node.id, &outputs);
        self.state.exceptions_count += 1;
        self.finish_route(&node.id, NodeStatus::Exception, Some(error.message.clone()));
        let base = self.base(node, execution_id);
        self.emit(GraphEngineEvent::NodeRunException {
            base,
            error: error.message,
            strategy: strategy.to_string(),
            outputs,
        });
        let chunks = self.coordinator.on_node_finished(&node.id, &self.state.variable_pool);
        self.emit_response_chunks(chunks);
    }

    fn resolve_edges(&mut self, node: &Node, resolution: Resolution<'_>) {
        let outcome = match resolve_outgoing(&self.graph, &mut self.state.execution, node, resolution) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.fail_invariant(e.to_string());
                return;
            }
        };

        for edge_id in &outcome.taken {
            let chunks = self.coordinator.on_edge_taken(edge_id, &self.state.variable_pool);
            self.emit_response_chunks(chunks);
        }
        for node_id in &outcome.skipped {
            debug!(run_id = %self.run_id, node_id = %node_id, "Node skipped");
            let chunks = self.coordinator.on_node_skipped(node_id, &self.state.variable_pool);
            self.emit_response_chunks(chunks);
        }
        for node_id in outcome.ready {
            debug!(run_id = %self.run_id, node_id = %node_id, "Node ready");
            self.ready.push(node_id);
        }
    }

    fn is_quiescent(&self) -> bool {
        self.executing.is_empty()
            && self.pending_retries.is_empty()
            && (self.ready.is_empty() || self.pause_requested.is_some())
    }

    async fn check_completion(&mut self) {
        if !self.is_quiescent() {
            return;
        }

        if let Some(failure) = self.failure.take() {
            error!(
                run_id = %self.run_id,
                node_id = ?failure.node_id,
                error = %failure.error,
                "Graph run failed"
            );
            self.shutdown(ExecutionStatus::Failed);
            self.emit(GraphEngineEvent::GraphRunFailed {
                error: failure.error,
                node_id: failure.node_id,
                kind: FailureKind::Node,
                exceptions_count: self.state.exceptions_count,
            });
        } else if self.pause_requested.is_some() || self.state.is_paused() {
            self.pause().await;
        } else {
            info!(
                run_id = %self.run_id,
                steps = self.state.node_run_steps,
                total_tokens = self.state.total_tokens,
                "Graph run succeeded"
            );
            self.shutdown(ExecutionStatus::Succeeded);
            self.emit(GraphEngineEvent::GraphRunSucceeded {
                outputs: self.state.outputs.clone(),
                total_steps: self.state.node_run_steps,
                total_tokens: self.state.total_tokens,
            });
        }
    }

    async fn pause(&mut self) {
        if let Some(message) = self.pause_requested.take() {
            self.state.pause_reasons.push(PauseReason::SchedulingPause { message });
        }
        self.state.execution.ready_queue = self.ready.snapshot();
        self.state.execution.response = Some(self.coordinator.snapshot());

        let saved = match PauseStateBlob::new(&self.state, self.generate_entity.clone()) {
            Ok(blob) => save_pause_state(
                self.storage.as_ref(),
                &self.run_id,
                &blob,
                &self.config.pause_storage_retry,
            )
            .await
            .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match saved {
            Ok(key) => {
                info!(
                    run_id = %self.run_id,
                    state_reference = %key,
                    reasons = self.state.pause_reasons.len(),
                    "Graph run paused"
                );
                self.shutdown(ExecutionStatus::Paused);
                self.emit(GraphEngineEvent::GraphRunPaused {
                    reasons: self.state.pause_reasons.clone(),
                    outputs: self.state.outputs.clone(),
                    state_reference: Some(key),
                });
            }
            Err(e) => {
                error!(run_id = %self.run_id, error = %e, "Failed to persist pause state");
                self.shutdown(ExecutionStatus::Failed);
                self.emit(GraphEngineEvent::GraphRunFailed {
                    error: format!("Failed to persist pause state: {}", e),
                    node_id: None,
                    kind: FailureKind::PauseStorage,
                    exceptions_count: self.state.exceptions_count,
                });
            }
        }
    }

    async fn abort(&mut self, reason: String) {
        info!(run_id = %self.run_id, reason = %reason, in_flight = self.executing.len(), "Aborting run");
        self.status = ExecutionStatus::Aborted;
        self.cancel.cancel();
        self.ready.clear();
        self.pending_retries.clear();

        let deadline = Instant::now() + self.config.abort_drain_timeout;
        while !self.executing.is_empty() {
            match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(WorkerMessage::Finished { worker_id, node_id, .. })) => {
                    self.executing.remove(&node_id);
                    self.workers.mark_idle(worker_id);
                }
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => {
                    warn!(
                        run_id = %self.run_id,
                        in_flight = self.executing.len(),
                        "Abort drain timed out"
                    );
                    break;
                }
            }
        }
        self.executing.clear();

        self.shutdown(ExecutionStatus::Aborted);
        self.emit(GraphEngineEvent::GraphRunAborted {
            reason,
            outputs: self.state.outputs.clone(),
        });
    }

    fn fail_invariant(&mut self, message: String) {
        if self.is_finished() {
            return;
        }
        error!(run_id = %self.run_id, error = %message, "Invariant violation");
        self.shutdown(ExecutionStatus::Failed);
        self.emit(GraphEngineEvent::GraphRunFailed {
            error: message,
            node_id: None,
            kind: FailureKind::Invariant,
            exceptions_count: self.state.exceptions_count,
        });
    }

    fn shutdown(&mut self, status: ExecutionStatus) {
        self.status = status;
        self.cancel.cancel();
        self.workers.shutdown();
    }

    fn finish_route(&mut self, node_id: &NodeId, status: NodeStatus, reason: Option<String>) {
        let index = self.state.node_run_steps;
        self.state
            .execution
            .route_states
            .entry(node_id.clone())
            .or_insert_with(|| RouteNodeState::running(node_id.clone(), index))
            .finish(status, reason);
    }

    fn execution_id(&mut self, node_id: &NodeId) -> String {
        if let Some(id) = self.execution_ids.get(node_id) {
            return id.clone();
        }
        let id = if self.coordinator.is_response_node(node_id.as_str()) {
            self.coordinator.execution_id(node_id)
        } else {
            Uuid::new_v4().to_string()
        };
        self.execution_ids.insert(node_id.clone(), id.clone());
        id
    }

    fn base(&mut self, node: &Node, execution_id: &str) -> NodeEventBase {
        let route_node_state = self
            .state
            .execution
            .route_states
            .get(&node.id)
            .cloned()
            .unwrap_or_else(|| RouteNodeState::pending(node.id.clone()));
        NodeEventBase {
            execution_id: execution_id.to_string(),
            node_id: node.id.clone(),
            node_kind: node.kind.clone(),
            node_title: node.title.clone(),
            route_node_state,
            parallel: self.parallel_info(&node.id),
        }
    }

    fn parallel_info(&mut self, node_id: &NodeId) -> Option<ParallelInfo> {
        let graph = Arc::clone(&self.graph);
        let parallel = graph.parallel_for(node_id.as_str())?;
        let parallel_mode_run_id = self
            .state
            .execution
            .parallel_mode_run_ids
            .entry(parallel.id.clone())
            .or_insert_with(|| Uuid::new_v4().to_string())
            .clone();
        Some(ParallelInfo {
            parallel_id: parallel.id.clone(),
            parallel_start_node_id: parallel.start_from_node_id.clone(),
            parallel_mode_run_id,
            parent_parallel_id: parallel.parent_parallel_id.clone(),
            parent_parallel_start_node_id: parallel.parent_parallel_start_node_id.clone(),
        })
    }

    fn emit_response_chunks(&mut self, chunks: Vec<ResponseChunk>) {
        for chunk in chunks {
            let Some(node) = self.graph.node(chunk.node_id.as_str()).cloned() else {
                continue;
            };
            let base = self.base(&node, &chunk.execution_id);
            self.emit(GraphEngineEvent::NodeRunStreamChunk {
                base,
                selector: chunk.selector,
                from_variable_selector: chunk.from_selector,
                chunk: chunk.chunk,
                is_final: chunk.is_final,
            });
        }
    }

    fn emit(&mut self, event: GraphEngineEvent) {
        self.events.push(event);
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn error_outputs(mut outputs: Map<String, Value>, error: &NodeError) -> Map<String, Value> {
    outputs.insert("error_message".to_string(), Value::String(error.message.clone()));
    outputs.insert("error_type".to_string(), Value::String(error.error_type.clone()));
    outputs
}
