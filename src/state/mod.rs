//! Run state: the variable pool and resumable runtime state

pub mod runtime_state;
pub mod variable_pool;

pub use runtime_state::{EdgeState, ExecutionSnapshot, GraphRuntimeState, NodeStatus, RouteNodeState};
pub use variable_pool::{render_value, Selector, VariablePool, SYSTEM_VARIABLE_NODE_ID};
