//! Runtime state of a single run
//!
//! Everything needed to resume a paused run lives in [`GraphRuntimeState`]:
//! the variable pool, accumulated outputs, pause bookkeeping, and the engine's
//! own scheduling snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use super::variable_pool::VariablePool;
use crate::graph::NodeId;
use crate::pause::PauseReason;
use crate::response::CoordinatorSnapshot;

/// Execution status of a node within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    NotStarted,
    Running,
    Success,
    Failed,
    Paused,
    Skipped,
    Exception,
}

impl NodeStatus {
    /// Whether the node will not run again in this run
    pub fn is_terminal(self) -> bool {
        !matches!(self, NodeStatus::NotStarted | NodeStatus::Running)
    }
}

/// Per-node execution record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteNodeState {
    pub node_id: NodeId,
    pub status: NodeStatus,
    pub start_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Dispatch order within the run, starting at 1
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_reason: Option<String>,
}

impl RouteNodeState {
    /// Placeholder for a node that has not been dispatched yet
    pub fn pending(node_id: NodeId) -> Self {
        Self {
            node_id,
            status: NodeStatus::NotStarted,
            start_at: Utc::now(),
            finished_at: None,
            index: 0,
            failed_reason: None,
        }
    }

    /// A freshly dispatched node
    pub fn running(node_id: NodeId, index: usize) -> Self {
        Self {
            node_id,
            status: NodeStatus::Running,
            start_at: Utc::now(),
            finished_at: None,
            index,
            failed_reason: None,
        }
    }

    /// Move to a terminal status
    pub fn finish(&mut self, status: NodeStatus, failed_reason: Option<String>) {
        self.status = status;
        self.finished_at = Some(Utc::now());
        self.failed_reason = failed_reason;
    }

    /// Whether the node reached a terminal status
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Resolution state of an edge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeState {
    #[default]
    Unknown,
    Taken,
    Skipped,
    Failed,
}

/// Engine scheduling bookkeeping, persisted for resume
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSnapshot {
    pub route_states: HashMap<NodeId, RouteNodeState>,
    pub edge_states: HashMap<String, EdgeState>,
    /// Ready queue contents in dispatch order
    pub ready_queue: Vec<NodeId>,
    /// Parallel id -> parallel-mode run id assigned on first entry
    pub parallel_mode_run_ids: HashMap<String, String>,
    /// Node id -> retries already consumed
    pub retry_attempts: HashMap<NodeId, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<CoordinatorSnapshot>,
}

impl ExecutionSnapshot {
    /// Status of a node, `NotStarted` when it has no record
    pub fn node_status(&self, node_id: &str) -> NodeStatus {
        self.route_states
            .get(node_id)
            .map(|s| s.status)
            .unwrap_or(NodeStatus::NotStarted)
    }

    /// State of an edge, `Unknown` when unresolved
    pub fn edge_state(&self, edge_id: &str) -> EdgeState {
        self.edge_states.get(edge_id).copied().unwrap_or_default()
    }
}

/// Mutable state of a run, owned by the engine loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRuntimeState {
    pub variable_pool: VariablePool,
    pub start_at: DateTime<Utc>,
    #[serde(default)]
    pub paused_node_ids: Vec<NodeId>,
    #[serde(default)]
    pub pause_reasons: Vec<PauseReason>,
    #[serde(default)]
    pub outputs: Map<String, Value>,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub node_run_steps: usize,
    #[serde(default)]
    pub exceptions_count: usize,
    #[serde(default)]
    pub execution: ExecutionSnapshot,
}

impl GraphRuntimeState {
    /// Fresh state around a variable pool
    pub fn new(variable_pool: VariablePool) -> Self {
        Self {
            variable_pool,
            start_at: Utc::now(),
            paused_node_ids: Vec::new(),
            pause_reasons: Vec::new(),
            outputs: Map::new(),
            total_tokens: 0,
            node_run_steps: 0,
            exceptions_count: 0,
            execution: ExecutionSnapshot::default(),
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Merge a response node's outputs; `answer` is appended, other keys overwrite
    pub fn merge_response_outputs(&mut self, outputs: &Map<String, Value>) {
        for (key, value) in outputs {
            if key == "answer" {
                if let (Some(Value::String(existing)), Value::String(more)) =
                    (self.outputs.get_mut(key), value)
                {
                    existing.push_str(more);
                    continue;
                }
            }
            self.outputs.insert(key.clone(), value.clone());
        }
    }

    /// Whether the run stopped on at least one pause request
    pub fn is_paused(&self) -> bool {
        !self.paused_node_ids.is_empty()
    }
}

impl Default for GraphRuntimeState {
    fn default() -> Self {
        Self::new(VariablePool::default())
    }
}
