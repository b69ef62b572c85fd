//! Persistence layer
//!
//! Mirrors a run into an [`ExecutionRepository`]: one
//! [`WorkflowExecutionRecord`] per run, one [`NodeExecutionRecord`] per node
//! execution, and a [`WorkflowPauseEntity`] whenever the run pauses.
//! Repository failures are logged and never affect the run.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{GraphEngineLayer, LayerContext};
use crate::error::{LayerError, StorageError};
use crate::events::{GraphEngineEvent, NodeEventBase, ParallelInfo};
use crate::graph::{NodeId, NodeKind};
use crate::pause::WorkflowPauseEntity;
use crate::state::NodeStatus;

/// Status of a whole run as recorded by the repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowExecutionStatus {
    Running,
    Succeeded,
    Failed,
    Paused,
    Aborted,
}

/// Stored record of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecutionRecord {
    pub id: String,
    pub status: WorkflowExecutionStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub total_steps: usize,
    pub total_tokens: u64,
}

/// Stored record of one node execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeExecutionRecord {
    pub execution_id: String,
    pub workflow_execution_id: String,
    pub node_id: NodeId,
    pub node_kind: NodeKind,
    pub index: usize,
    pub status: NodeStatus,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelInfo>,
}

impl NodeExecutionRecord {
    fn from_base(run_id: &str, base: &NodeEventBase) -> Self {
        Self {
            execution_id: base.execution_id.clone(),
            workflow_execution_id: run_id.to_string(),
            node_id: base.node_id.clone(),
            node_kind: base.node_kind.clone(),
            index: base.route_node_state.index,
            status: base.route_node_state.status,
            started_at: base.route_node_state.start_at,
            finished_at: base.route_node_state.finished_at,
            outputs: Map::new(),
            error: None,
            retries: 0,
            parallel: base.parallel.clone(),
        }
    }
}

/// Where run history goes
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn save_workflow_execution(&self, record: &WorkflowExecutionRecord) -> Result<(), StorageError>;

    async fn get_workflow_execution(&self, id: &str) -> Result<Option<WorkflowExecutionRecord>, StorageError>;

    async fn save_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), StorageError>;

    /// Node executions of a run, in dispatch order
    async fn list_node_executions(&self, workflow_execution_id: &str) -> Result<Vec<NodeExecutionRecord>, StorageError>;

    async fn save_pause(&self, pause: &WorkflowPauseEntity) -> Result<(), StorageError>;

    /// Most recent pause of a run
    async fn get_pause(&self, workflow_execution_id: &str) -> Result<Option<WorkflowPauseEntity>, StorageError>;
}

/// [`ExecutionRepository`] kept in memory
#[derive(Debug, Default)]
pub struct InMemoryExecutionRepository {
    workflows: RwLock<HashMap<String, WorkflowExecutionRecord>>,
    nodes: RwLock<HashMap<String, NodeExecutionRecord>>,
    pauses: RwLock<HashMap<String, WorkflowPauseEntity>>,
}

impl InMemoryExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryExecutionRepository {
    async fn save_workflow_execution(&self, record: &WorkflowExecutionRecord) -> Result<(), StorageError> {
        self.workflows.write().insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn get_workflow_execution(&self, id: &str) -> Result<Option<WorkflowExecutionRecord>, StorageError> {
        Ok(self.workflows.read().get(id).cloned())
    }

    async fn save_node_execution(&self, record: &NodeExecutionRecord) -> Result<(), StorageError> {
        self.nodes.write().insert(record.execution_id.clone(), record.clone());
        Ok(())
    }

    async fn list_node_executions(&self, workflow_execution_id: &str) -> Result<Vec<NodeExecutionRecord>, StorageError> {
        let mut records: Vec<NodeExecutionRecord> = self
            .nodes
            .read()
            .values()
            .filter(|r| r.workflow_execution_id == workflow_execution_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.index);
        Ok(records)
    }

    async fn save_pause(&self, pause: &WorkflowPauseEntity) -> Result<(), StorageError> {
        self.pauses.write().insert(pause.workflow_execution_id.clone(), pause.clone());
        Ok(())
    }

    async fn get_pause(&self, workflow_execution_id: &str) -> Result<Option<WorkflowPauseEntity>, StorageError> {
        Ok(self.pauses.read().get(workflow_execution_id).cloned())
    }
}

/// Writes run history to a repository
pub struct PersistenceLayer {
    repository: Arc<dyn ExecutionRepository>,
    run_id: Mutex<Option<String>>,
    /// Open node records by execution id
    open: Mutex<HashMap<String, NodeExecutionRecord>>,
    workflow: Mutex<Option<WorkflowExecutionRecord>>,
}

impl std::fmt::Debug for PersistenceLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceLayer")
            .field("run_id", &*self.run_id.lock())
            .finish()
    }
}

impl PersistenceLayer {
    pub fn new(repository: Arc<dyn ExecutionRepository>) -> Self {
        Self {
            repository,
            run_id: Mutex::new(None),
            open: Mutex::new(HashMap::new()),
            workflow: Mutex::new(None),
        }
    }

    fn run_id(&self) -> Result<String, LayerError> {
        self.run_id
            .lock()
            .clone()
            .ok_or_else(|| LayerError::failed(self.name(), "layer used before initialize"))
    }

    async fn save_node(&self, record: NodeExecutionRecord) -> Result<(), LayerError> {
        if let Err(e) = self.repository.save_node_execution(&record).await {
            warn!(node_id = %record.node_id, error = %e, "Failed to save node execution");
        }
        Ok(())
    }

    async fn save_workflow(&self, record: WorkflowExecutionRecord) -> Result<(), LayerError> {
        if let Err(e) = self.repository.save_workflow_execution(&record).await {
            warn!(run_id = %record.id, error = %e, "Failed to save workflow execution");
        }
        *self.workflow.lock() = Some(record);
        Ok(())
    }

    /// Update the open record for a node event, or start one
    fn node_record(&self, run_id: &str, base: &NodeEventBase) -> NodeExecutionRecord {
        let mut open = self.open.lock();
        let record = open
            .entry(base.execution_id.clone())
            .or_insert_with(|| NodeExecutionRecord::from_base(run_id, base));
        record.status = base.route_node_state.status;
        record.finished_at = base.route_node_state.finished_at;
        record.clone()
    }

    fn close_node(&self, execution_id: &str) {
        self.open.lock().remove(execution_id);
    }

    async fn finish_workflow(
        &self,
        status: WorkflowExecutionStatus,
        outputs: Option<&Map<String, Value>>,
        error: Option<String>,
        steps_and_tokens: Option<(usize, u64)>,
    ) -> Result<(), LayerError> {
        let run_id = self.run_id()?;
        let existing = self.workflow.lock().clone();
        let mut record = existing.unwrap_or_else(|| WorkflowExecutionRecord {
            id: run_id,
            status,
            started_at: Utc::now(),
            finished_at: None,
            outputs: Map::new(),
            error: None,
            total_steps: 0,
            total_tokens: 0,
        });
        record.status = status;
        if status != WorkflowExecutionStatus::Paused {
            record.finished_at = Some(Utc::now());
        }
        if let Some(outputs) = outputs {
            record.outputs = outputs.clone();
        }
        record.error = error;
        if let Some((steps, tokens)) = steps_and_tokens {
            record.total_steps = steps;
            record.total_tokens = tokens;
        }
        self.save_workflow(record).await
    }
}

#[async_trait]
impl GraphEngineLayer for PersistenceLayer {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn initialize(&self, ctx: &LayerContext) -> Result<(), LayerError> {
        *self.run_id.lock() = Some(ctx.run_id.clone());
        Ok(())
    }

    async fn on_event(&self, event: &GraphEngineEvent) -> Result<(), LayerError> {
        let run_id = self.run_id()?;
        match event {
            GraphEngineEvent::GraphRunStarted { resumed, .. } => {
                let existing = match self.repository.get_workflow_execution(&run_id).await {
                    Ok(existing) => existing,
                    Err(e) => {
                        warn!(run_id = %run_id, error = %e, "Failed to load workflow execution");
                        None
                    }
                };
                let record = match existing {
                    Some(mut record) if *resumed => {
                        record.status = WorkflowExecutionStatus::Running;
                        record
                    }
                    _ => WorkflowExecutionRecord {
                        id: run_id.clone(),
                        status: WorkflowExecutionStatus::Running,
                        started_at: Utc::now(),
                        finished_at: None,
                        outputs: Map::new(),
                        error: None,
                        total_steps: 0,
                        total_tokens: 0,
                    },
                };
                if *resumed {
                    if let Ok(Some(mut pause)) = self.repository.get_pause(&run_id).await {
                        if pause.resumed_at.is_none() {
                            pause.mark_resumed();
                            if let Err(e) = self.repository.save_pause(&pause).await {
                                warn!(run_id = %run_id, error = %e, "Failed to mark pause resumed");
                            }
                        }
                    }
                }
                self.save_workflow(record).await
            }
            GraphEngineEvent::NodeRunStarted { base } => {
                let record = self.node_record(&run_id, base);
                self.save_node(record).await
            }
            GraphEngineEvent::NodeRunRetry { base, error, retry_index } => {
                let record = {
                    let mut open = self.open.lock();
                    let record = open
                        .entry(base.execution_id.clone())
                        .or_insert_with(|| NodeExecutionRecord::from_base(&run_id, base));
                    record.retries = *retry_index;
                    record.error = Some(error.clone());
                    record.clone()
                };
                self.save_node(record).await
            }
            GraphEngineEvent::NodeRunSucceeded { base, outputs, .. } => {
                let mut record = self.node_record(&run_id, base);
                record.outputs = outputs.clone();
                record.error = None;
                self.close_node(&base.execution_id);
                self.save_node(record).await
            }
            GraphEngineEvent::NodeRunFailed { base, error, .. } => {
                let mut record = self.node_record(&run_id, base);
                record.error = Some(error.clone());
                self.close_node(&base.execution_id);
                self.save_node(record).await
            }
            GraphEngineEvent::NodeRunException { base, error, outputs, .. } => {
                let mut record = self.node_record(&run_id, base);
                record.outputs = outputs.clone();
                record.error = Some(error.clone());
                self.close_node(&base.execution_id);
                self.save_node(record).await
            }
            GraphEngineEvent::NodeRunPauseRequested { base, .. } => {
                let record = self.node_record(&run_id, base);
                self.close_node(&base.execution_id);
                self.save_node(record).await
            }
            GraphEngineEvent::GraphRunSucceeded {
                outputs,
                total_steps,
                total_tokens,
            } => {
                self.finish_workflow(
                    WorkflowExecutionStatus::Succeeded,
                    Some(outputs),
                    None,
                    Some((*total_steps, *total_tokens)),
                )
                .await
            }
            GraphEngineEvent::GraphRunFailed { error, .. } => {
                self.finish_workflow(WorkflowExecutionStatus::Failed, None, Some(error.clone()), None)
                    .await
            }
            GraphEngineEvent::GraphRunAborted { reason, outputs } => {
                self.finish_workflow(
                    WorkflowExecutionStatus::Aborted,
                    Some(outputs),
                    Some(reason.clone()),
                    None,
                )
                .await
            }
            GraphEngineEvent::GraphRunPaused {
                reasons,
                outputs,
                state_reference,
            } => {
                if let Some(reference) = state_reference {
                    let pause = WorkflowPauseEntity::new(run_id.clone(), reasons.clone(), reference.clone());
                    debug!(run_id = %run_id, pause_id = %pause.pause_id, "Recording pause");
                    if let Err(e) = self.repository.save_pause(&pause).await {
                        warn!(run_id = %run_id, error = %e, "Failed to save pause entity");
                    }
                }
                self.finish_workflow(WorkflowExecutionStatus::Paused, Some(outputs), None, None)
                    .await
            }
            GraphEngineEvent::NodeRunStreamChunk { .. } => Ok(()),
        }
    }
}
