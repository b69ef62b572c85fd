//! Pause and resume persistence
//!
//! When a run pauses, the engine serializes its [`GraphRuntimeState`] into a
//! [`PauseStateBlob`] and writes it to a [`ContentStorage`] under
//! [`pause_state_key`]. A later trigger loads the blob, rebuilds the runtime
//! state, and calls `GraphEngine::resume` with a [`ResumeContext`].

pub mod storage;

pub use storage::{ContentStorage, FileContentStorage, MemoryContentStorage};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::StorageError;
use crate::graph::NodeId;
use crate::state::{GraphRuntimeState, Selector};

/// Why a run paused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PauseReason {
    /// A node needs input from a person
    HumanInputRequired {
        node_id: NodeId,
        prompt: String,
        /// Field of `node_id` the resume input is written to
        input_field: String,
    },
    /// The run was paused by a command or scheduler
    SchedulingPause { message: String },
}

impl PauseReason {
    /// Node that requested the pause, if any
    pub fn node_id(&self) -> Option<&NodeId> {
        match self {
            PauseReason::HumanInputRequired { node_id, .. } => Some(node_id),
            PauseReason::SchedulingPause { .. } => None,
        }
    }
}

/// Durable pointer from a workflow execution to its pause-state blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowPauseEntity {
    pub pause_id: String,
    pub workflow_execution_id: String,
    pub paused_at: DateTime<Utc>,
    pub pause_reasons: Vec<PauseReason>,
    /// Storage key of the [`PauseStateBlob`]
    pub state_reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_at: Option<DateTime<Utc>>,
}

impl WorkflowPauseEntity {
    pub fn new(
        workflow_execution_id: impl Into<String>,
        pause_reasons: Vec<PauseReason>,
        state_reference: impl Into<String>,
    ) -> Self {
        Self {
            pause_id: uuid::Uuid::new_v4().to_string(),
            workflow_execution_id: workflow_execution_id.into(),
            paused_at: Utc::now(),
            pause_reasons,
            state_reference: state_reference.into(),
            resumed_at: None,
        }
    }

    /// Record that the run was resumed
    pub fn mark_resumed(&mut self) {
        self.resumed_at = Some(Utc::now());
    }
}

/// Everything needed to rebuild a paused run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PauseStateBlob {
    /// `GraphRuntimeState` as JSON
    pub serialized_runtime_state: String,
    /// Caller supplied description of the run (app, user, invoke source)
    #[serde(default)]
    pub generate_entity: Value,
    pub pause_reasons: Vec<PauseReason>,
}

impl PauseStateBlob {
    /// Capture a paused runtime state
    pub fn new(state: &GraphRuntimeState, generate_entity: Value) -> Result<Self, serde_json::Error> {
        Ok(Self {
            serialized_runtime_state: state.to_json()?,
            generate_entity,
            pause_reasons: state.pause_reasons.clone(),
        })
    }

    /// Rebuild the runtime state
    pub fn runtime_state(&self) -> Result<GraphRuntimeState, serde_json::Error> {
        GraphRuntimeState::from_json(&self.serialized_runtime_state)
    }
}

/// Inputs applied to the variable pool before a paused run continues
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResumeContext {
    pub inputs: Vec<(Selector, Value)>,
}

impl ResumeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value to write before resuming
    pub fn input(mut self, selector: Selector, value: Value) -> Self {
        self.inputs.push((selector, value));
        self
    }
}

/// Storage key of a run's pause-state blob
pub fn pause_state_key(run_id: &str) -> String {
    format!("workflow_pause_states/{}.json", run_id)
}

/// Write a pause-state blob, retrying recoverable storage errors
///
/// Returns the storage key on success.
pub async fn save_pause_state(
    storage: &dyn ContentStorage,
    run_id: &str,
    blob: &PauseStateBlob,
    retry: &RetryPolicy,
) -> Result<String, StorageError> {
    let key = pause_state_key(run_id);
    let content = serde_json::to_vec(blob).map_err(|e| StorageError::Serialization(e.to_string()))?;

    let mut attempt = 0;
    loop {
        match storage.save(&key, &content).await {
            Ok(()) => return Ok(key),
            Err(e) if e.is_recoverable() && retry.should_retry(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    run_id = %run_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Pause state write failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Load a run's pause-state blob
pub async fn load_pause_state(
    storage: &dyn ContentStorage,
    run_id: &str,
) -> Result<PauseStateBlob, StorageError> {
    let content = storage.load(&pause_state_key(run_id)).await?;
    serde_json::from_slice(&content).map_err(|e| StorageError::Serialization(e.to_string()))
}
