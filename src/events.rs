//! Events emitted by the graph engine
//!
//! The event stream is the only output channel of a run. Graph-level events
//! bracket the run; node-level events carry a [`NodeEventBase`] describing the
//! node execution and, inside a parallel region, its [`ParallelInfo`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::graph::{NodeId, NodeKind};
use crate::pause::PauseReason;
use crate::state::{RouteNodeState, Selector};

/// Why a run ended in `GraphRunFailed`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// A node failed without an error strategy
    Node,
    /// Engine bookkeeping disagreed with the graph
    Invariant,
    /// The pause-state blob could not be written
    PauseStorage,
}

/// Parallel metadata attached to node events inside a parallel region
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelInfo {
    pub parallel_id: String,
    pub parallel_start_node_id: NodeId,
    /// Shared by every node dispatched in the same entry into the group
    pub parallel_mode_run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_parallel_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_parallel_start_node_id: Option<NodeId>,
}

/// Fields common to every node event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEventBase {
    /// Unique per node execution
    pub execution_id: String,
    pub node_id: NodeId,
    pub node_kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_title: Option<String>,
    pub route_node_state: RouteNodeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelInfo>,
}

/// An event produced by a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GraphEngineEvent {
    GraphRunStarted {
        run_id: String,
        resumed: bool,
    },
    GraphRunSucceeded {
        outputs: Map<String, Value>,
        total_steps: usize,
        total_tokens: u64,
    },
    GraphRunFailed {
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<NodeId>,
        kind: FailureKind,
        exceptions_count: usize,
    },
    GraphRunPaused {
        reasons: Vec<PauseReason>,
        outputs: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_reference: Option<String>,
    },
    GraphRunAborted {
        reason: String,
        outputs: Map<String, Value>,
    },
    NodeRunStarted {
        #[serde(flatten)]
        base: NodeEventBase,
    },
    NodeRunStreamChunk {
        #[serde(flatten)]
        base: NodeEventBase,
        selector: Selector,
        /// Output of the upstream node this text was streamed from
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_variable_selector: Option<Selector>,
        chunk: String,
        is_final: bool,
    },
    NodeRunSucceeded {
        #[serde(flatten)]
        base: NodeEventBase,
        outputs: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        edge_source_handle: Option<String>,
    },
    NodeRunFailed {
        #[serde(flatten)]
        base: NodeEventBase,
        error: String,
        error_type: String,
    },
    /// The node failed but its error strategy let the run continue
    NodeRunException {
        #[serde(flatten)]
        base: NodeEventBase,
        error: String,
        strategy: String,
        outputs: Map<String, Value>,
    },
    NodeRunRetry {
        #[serde(flatten)]
        base: NodeEventBase,
        error: String,
        retry_index: usize,
    },
    NodeRunPauseRequested {
        #[serde(flatten)]
        base: NodeEventBase,
        reason: PauseReason,
    },
}

impl GraphEngineEvent {
    /// Node metadata for node-level events
    pub fn node_base(&self) -> Option<&NodeEventBase> {
        match self {
            GraphEngineEvent::NodeRunStarted { base }
            | GraphEngineEvent::NodeRunStreamChunk { base, .. }
            | GraphEngineEvent::NodeRunSucceeded { base, .. }
            | GraphEngineEvent::NodeRunFailed { base, .. }
            | GraphEngineEvent::NodeRunException { base, .. }
            | GraphEngineEvent::NodeRunRetry { base, .. }
            | GraphEngineEvent::NodeRunPauseRequested { base, .. } => Some(base),
            _ => None,
        }
    }

    /// Node id for node-level events
    pub fn node_id(&self) -> Option<&NodeId> {
        self.node_base().map(|b| &b.node_id)
    }

    /// Whether this event ends the run
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GraphEngineEvent::GraphRunSucceeded { .. }
                | GraphEngineEvent::GraphRunFailed { .. }
                | GraphEngineEvent::GraphRunPaused { .. }
                | GraphEngineEvent::GraphRunAborted { .. }
        )
    }

    /// Short event name for logs
    pub fn name(&self) -> &'static str {
        match self {
            GraphEngineEvent::GraphRunStarted { .. } => "graph_run_started",
            GraphEngineEvent::GraphRunSucceeded { .. } => "graph_run_succeeded",
            GraphEngineEvent::GraphRunFailed { .. } => "graph_run_failed",
            GraphEngineEvent::GraphRunPaused { .. } => "graph_run_paused",
            GraphEngineEvent::GraphRunAborted { .. } => "graph_run_aborted",
            GraphEngineEvent::NodeRunStarted { .. } => "node_run_started",
            GraphEngineEvent::NodeRunStreamChunk { .. } => "node_run_stream_chunk",
            GraphEngineEvent::NodeRunSucceeded { .. } => "node_run_succeeded",
            GraphEngineEvent::NodeRunFailed { .. } => "node_run_failed",
            GraphEngineEvent::NodeRunException { .. } => "node_run_exception",
            GraphEngineEvent::NodeRunRetry { .. } => "node_run_retry",
            GraphEngineEvent::NodeRunPauseRequested { .. } => "node_run_pause_requested",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn base(parallel: Option<ParallelInfo>) -> NodeEventBase {
        NodeEventBase {
            execution_id: "exec-1".into(),
            node_id: "llm".into(),
            node_kind: NodeKind::Llm,
            node_title: None,
            route_node_state: RouteNodeState::running("llm".into(), 1),
            parallel,
        }
    }

    #[test]
    fn test_top_level_parallel_omits_parent_fields() {
        let info = ParallelInfo {
            parallel_id: "start:source".into(),
            parallel_start_node_id: "start".into(),
            parallel_mode_run_id: "run-1".into(),
            parent_parallel_id: None,
            parent_parallel_start_node_id: None,
        };
        let event = GraphEngineEvent::NodeRunStarted {
            base: base(Some(info)),
        };
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event"], json!("node_run_started"));
        assert_eq!(value["node_id"], json!("llm"));
        let parallel = value["parallel"].as_object().unwrap();
        assert!(!parallel.contains_key("parent_parallel_id"));
        assert!(!parallel.contains_key("parent_parallel_start_node_id"));
    }

    #[test]
    fn test_node_event_round_trip() {
        let event = GraphEngineEvent::NodeRunStreamChunk {
            base: base(None),
            selector: Selector::new("llm", "text"),
            from_variable_selector: None,
            chunk: "hi".into(),
            is_final: false,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: GraphEngineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.node_id(), Some(&NodeId::from("llm")));
    }

    #[test]
    fn test_terminal_events() {
        let done = GraphEngineEvent::GraphRunAborted {
            reason: "stop".into(),
            outputs: Map::new(),
        };
        assert!(done.is_terminal());
        assert!(done.node_base().is_none());

        let started = GraphEngineEvent::GraphRunStarted {
            run_id: "r".into(),
            resumed: false,
        };
        assert!(!started.is_terminal());
        assert_eq!(started.name(), "graph_run_started");
    }
}
