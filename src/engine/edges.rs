//! Edge resolution
//!
//! When a node finishes, its outgoing edges are marked taken, skipped, or
//! failed. Targets whose incoming edges are all resolved are then decided:
//! ready to run, skipped, or failed by propagation. Skips and propagated
//! failures cascade downstream in the same pass.

use std::collections::VecDeque;

use crate::error::EngineError;
use crate::graph::{ExecutionType, Graph, JoinPolicy, Node, NodeId, DEFAULT_HANDLE, FAIL_BRANCH_HANDLE};
use crate::state::{EdgeState, ExecutionSnapshot, NodeStatus, RouteNodeState};

/// How the finished node's outgoing edges should be marked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Resolution<'a> {
    /// Normal completion, optionally selecting a handle
    Success { handle: Option<&'a str> },
    /// Failure routed through the `fail-branch` handle
    FailBranch,
    /// Unhandled failure
    Failed,
}

/// What changed downstream of a finished node
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct EdgeOutcome {
    /// Edges newly marked taken
    pub taken: Vec<String>,
    /// Nodes whose prerequisites are now satisfied
    pub ready: Vec<NodeId>,
    /// Nodes that will not run, by skip or by failure propagation
    pub skipped: Vec<NodeId>,
}

/// Mark `node`'s outgoing edges and decide every target that became resolvable
pub(crate) fn resolve_outgoing(
    graph: &Graph,
    execution: &mut ExecutionSnapshot,
    node: &Node,
    resolution: Resolution<'_>,
) -> Result<EdgeOutcome, EngineError> {
    let mut outcome = EdgeOutcome::default();
    let mut worklist: VecDeque<NodeId> = VecDeque::new();

    let wanted = match resolution {
        Resolution::Success { handle } => handle.or_else(|| {
            (node.execution_type() == ExecutionType::Branch).then_some(DEFAULT_HANDLE)
        }),
        Resolution::FailBranch => Some(FAIL_BRANCH_HANDLE),
        Resolution::Failed => None,
    };

    for edge in graph.outgoing(node.id.as_str()) {
        let state = match resolution {
            Resolution::Failed => EdgeState::Failed,
            _ => {
                let taken = match wanted {
                    Some(handle) => edge.handle() == handle,
                    None => edge.handle() != FAIL_BRANCH_HANDLE,
                };
                if taken {
                    EdgeState::Taken
                } else {
                    EdgeState::Skipped
                }
            }
        };
        mark(execution, &edge.id, state)?;
        if state == EdgeState::Taken {
            outcome.taken.push(edge.id.clone());
        }
        worklist.push_back(edge.target_node_id.clone());
    }

    while let Some(target) = worklist.pop_front() {
        if execution.route_states.contains_key(&target) {
            continue;
        }
        let Some(target_node) = graph.node(target.as_str()) else {
            return Err(EngineError::invariant(format!(
                "edge points at unknown node '{}'",
                target
            )));
        };

        let mut any_unknown = false;
        let mut any_taken = false;
        let mut any_failed = false;
        for edge in graph.incoming(target.as_str()) {
            match execution.edge_state(&edge.id) {
                EdgeState::Unknown => any_unknown = true,
                EdgeState::Taken => any_taken = true,
                EdgeState::Failed => any_failed = true,
                EdgeState::Skipped => {}
            }
        }
        if any_unknown {
            continue;
        }

        let propagate_failure = match target_node.join_policy {
            JoinPolicy::AllSucceeded => any_failed,
            JoinPolicy::AnySucceeded => any_failed && !any_taken,
        };

        if propagate_failure {
            let mut state = RouteNodeState::pending(target.clone());
            state.finish(NodeStatus::Skipped, Some("upstream node failed".to_string()));
            execution.route_states.insert(target.clone(), state);
            cascade(graph, execution, &target, EdgeState::Failed, &mut worklist)?;
            outcome.skipped.push(target);
        } else if any_taken {
            execution
                .route_states
                .insert(target.clone(), RouteNodeState::pending(target.clone()));
            outcome.ready.push(target);
        } else {
            let mut state = RouteNodeState::pending(target.clone());
            state.finish(NodeStatus::Skipped, None);
            execution.route_states.insert(target.clone(), state);
            cascade(graph, execution, &target, EdgeState::Skipped, &mut worklist)?;
            outcome.skipped.push(target);
        }
    }

    Ok(outcome)
}

fn cascade(
    graph: &Graph,
    execution: &mut ExecutionSnapshot,
    node_id: &NodeId,
    state: EdgeState,
    worklist: &mut VecDeque<NodeId>,
) -> Result<(), EngineError> {
    for edge in graph.outgoing(node_id.as_str()) {
        mark(execution, &edge.id, state)?;
        worklist.push_back(edge.target_node_id.clone());
    }
    Ok(())
}

fn mark(execution: &mut ExecutionSnapshot, edge_id: &str, state: EdgeState) -> Result<(), EngineError> {
    let previous = execution.edge_states.insert(edge_id.to_string(), state);
    match previous {
        None | Some(EdgeState::Unknown) => Ok(()),
        Some(prev) => Err(EngineError::invariant(format!(
            "edge '{}' resolved twice ({:?} then {:?})",
            edge_id, prev, state
        ))),
    }
}
