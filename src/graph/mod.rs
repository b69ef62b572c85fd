//! Immutable, validated workflow graph
//!
//! A [`Graph`] owns the nodes, the edge adjacency in both directions, and the
//! derived parallel maps used to tag lifecycle events. It is built once per
//! workflow version, either with the fluent [`GraphBuilder`] or from a JSON
//! [`GraphConfig`], and shared read-only (`Arc<Graph>`) across a run.
//!
//! # Example
//!
//! ```ignore
//! let graph = GraphBuilder::new()
//!     .node(Node::new("start", NodeKind::Start))
//!     .node(Node::new("llm", NodeKind::Llm))
//!     .node(Node::new("end", NodeKind::End))
//!     .edge("start", "llm")
//!     .edge("llm", "end")
//!     .build()?;
//! ```

pub mod node;
pub mod parallel;

pub use node::{
    Edge, ErrorStrategy, ExecutionType, JoinPolicy, Node, NodeId, NodeKind, DEFAULT_HANDLE,
    FAIL_BRANCH_HANDLE,
};
pub use parallel::Parallel;

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crate::error::GraphBuildError;
use parallel::{check_depth, detect_parallels, Adjacency};

/// Default maximum nesting of parallel groups
pub const DEFAULT_MAX_PARALLEL_DEPTH: usize = 3;

/// Serialized graph definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Node definitions
    pub nodes: Vec<Node>,
    /// Edge definitions
    #[serde(default)]
    pub edges: Vec<EdgeConfig>,
    /// Explicit root; inferred when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<NodeId>,
}

/// Serialized edge definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Edge id; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub source: NodeId,
    pub target: NodeId,
    #[serde(
        default,
        rename = "sourceHandle",
        alias = "source_handle",
        skip_serializing_if = "Option::is_none"
    )]
    pub source_handle: Option<String>,
}

/// Immutable workflow graph with precomputed parallel groupings
#[derive(Debug, Clone)]
pub struct Graph {
    root_node_id: NodeId,
    nodes: HashMap<NodeId, Arc<Node>>,
    node_order: Vec<NodeId>,
    edges: HashMap<String, Edge>,
    outgoing: HashMap<NodeId, Vec<String>>,
    incoming: HashMap<NodeId, Vec<String>>,
    parallel_mapping: HashMap<String, Parallel>,
    node_parallel_mapping: HashMap<NodeId, String>,
}

impl Graph {
    /// Start building a graph
    pub fn builder() -> GraphBuilder {
        GraphBuilder::new()
    }

    /// Build a graph from its serialized definition
    pub fn from_config(config: GraphConfig, max_parallel_depth: usize) -> Result<Self, GraphBuildError> {
        let mut builder = GraphBuilder::new().max_parallel_depth(max_parallel_depth);
        for node in config.nodes {
            builder = builder.node(node);
        }
        for edge in config.edges {
            builder = builder.push_edge(edge.id, edge.source, edge.target, edge.source_handle);
        }
        if let Some(root) = config.root {
            builder = builder.root(root);
        }
        builder.build()
    }

    /// Parse a JSON graph definition
    pub fn from_json(json: &str, max_parallel_depth: usize) -> Result<Self, GraphBuildError> {
        let config: GraphConfig = serde_json::from_str(json)
            .map_err(|e| GraphBuildError::invalid_config("<graph>", e.to_string()))?;
        Self::from_config(config, max_parallel_depth)
    }

    /// The entry node
    pub fn root_node_id(&self) -> &NodeId {
        &self.root_node_id
    }

    /// Look up a node
    pub fn node(&self, id: &str) -> Option<&Arc<Node>> {
        self.nodes.get(id)
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.node_order.iter().filter_map(|id| self.nodes.get(id))
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph has no nodes (never true for a built graph)
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up an edge
    pub fn edge(&self, id: &str) -> Option<&Edge> {
        self.edges.get(id)
    }

    /// Outgoing edges of a node in declaration order
    pub fn outgoing(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.outgoing
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|edge_id| self.edges.get(edge_id))
    }

    /// Incoming edges of a node in declaration order
    pub fn incoming(&self, id: &str) -> impl Iterator<Item = &Edge> {
        self.incoming
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|edge_id| self.edges.get(edge_id))
    }

    /// Parallel groups by id
    pub fn parallel_mapping(&self) -> &HashMap<String, Parallel> {
        &self.parallel_mapping
    }

    /// Enclosing parallel group id by node id
    pub fn node_parallel_mapping(&self) -> &HashMap<NodeId, String> {
        &self.node_parallel_mapping
    }

    /// The parallel group enclosing a node, if any
    pub fn parallel_for(&self, node_id: &str) -> Option<&Parallel> {
        self.node_parallel_mapping
            .get(node_id)
            .and_then(|id| self.parallel_mapping.get(id))
    }

    /// Branch points + join points + weighted container nodes
    pub fn parallelism_score(&self) -> usize {
        let branches = self
            .outgoing
            .values()
            .filter(|edges| edges.len() > 1)
            .count();
        let joins = self
            .incoming
            .values()
            .filter(|edges| edges.len() > 1)
            .count();
        let containers = self
            .nodes
            .values()
            .filter(|n| n.execution_type() == ExecutionType::Container)
            .count();
        branches + joins + containers * 2
    }
}

/// Fluent builder for [`Graph`]
#[derive(Debug, Clone)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<(Option<String>, NodeId, NodeId, Option<String>)>,
    root: Option<NodeId>,
    max_parallel_depth: usize,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            edges: Vec::new(),
            root: None,
            max_parallel_depth: DEFAULT_MAX_PARALLEL_DEPTH,
        }
    }

    /// Add a node
    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add an unconditional edge
    pub fn edge(self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        self.push_edge(None, from.into(), to.into(), None)
    }

    /// Add an edge taken only when `from` selects `handle`
    pub fn edge_with_handle(
        self,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        handle: impl Into<String>,
    ) -> Self {
        self.push_edge(None, from.into(), to.into(), Some(handle.into()))
    }

    /// Set the root explicitly
    pub fn root(mut self, id: impl Into<NodeId>) -> Self {
        self.root = Some(id.into());
        self
    }

    /// Set the allowed parallel nesting depth
    pub fn max_parallel_depth(mut self, depth: usize) -> Self {
        self.max_parallel_depth = depth;
        self
    }

    fn push_edge(
        mut self,
        id: Option<String>,
        from: NodeId,
        to: NodeId,
        handle: Option<String>,
    ) -> Self {
        self.edges.push((id, from, to, handle));
        self
    }

    /// Validate and build the graph
    pub fn build(self) -> Result<Graph, GraphBuildError> {
        if self.nodes.is_empty() {
            return Err(GraphBuildError::Empty);
        }

        let mut nodes = HashMap::new();
        let mut node_order = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(GraphBuildError::DuplicateNode(node.id.to_string()));
            }
            node_order.push(node.id.clone());
            nodes.insert(node.id.clone(), Arc::new(node));
        }

        let mut edges = HashMap::new();
        let mut outgoing: HashMap<NodeId, Vec<String>> = HashMap::new();
        let mut incoming: HashMap<NodeId, Vec<String>> = HashMap::new();
        for (id, from, to, handle) in self.edges {
            let id = id.unwrap_or_else(|| {
                format!(
                    "{}-{}-{}",
                    from,
                    handle.as_deref().unwrap_or(DEFAULT_HANDLE),
                    to
                )
            });
            for endpoint in [&from, &to] {
                if !nodes.contains_key(endpoint) {
                    return Err(GraphBuildError::UnknownNode {
                        edge_id: id,
                        node_id: endpoint.to_string(),
                    });
                }
            }
            if edges.contains_key(&id) {
                return Err(GraphBuildError::DuplicateEdge(id));
            }
            outgoing.entry(from.clone()).or_default().push(id.clone());
            incoming.entry(to.clone()).or_default().push(id.clone());
            edges.insert(
                id.clone(),
                Edge {
                    id,
                    source_node_id: from,
                    target_node_id: to,
                    source_handle: handle,
                },
            );
        }

        let root = resolve_root(self.root, &nodes, &node_order, &incoming)?;
        check_acyclic(&node_order, &edges, &outgoing, &incoming)?;
        check_reachable(&root, &node_order, &edges, &outgoing)?;

        let adjacency: Adjacency = outgoing
            .iter()
            .map(|(id, edge_ids)| {
                let targets = edge_ids
                    .iter()
                    .filter_map(|e| edges.get(e))
                    .map(|e: &Edge| (e.handle().to_string(), e.target_node_id.clone()))
                    .collect();
                (id.clone(), targets)
            })
            .collect();
        let maps = detect_parallels(&root, &adjacency);
        check_depth(&maps, self.max_parallel_depth)?;

        Ok(Graph {
            root_node_id: root,
            nodes,
            node_order,
            edges,
            outgoing,
            incoming,
            parallel_mapping: maps.parallels,
            node_parallel_mapping: maps.node_parallel,
        })
    }
}

fn resolve_root(
    explicit: Option<NodeId>,
    nodes: &HashMap<NodeId, Arc<Node>>,
    order: &[NodeId],
    incoming: &HashMap<NodeId, Vec<String>>,
) -> Result<NodeId, GraphBuildError> {
    let root = match explicit {
        Some(root) => {
            if !nodes.contains_key(&root) {
                return Err(GraphBuildError::NoRoot);
            }
            root
        }
        None => {
            let starts: Vec<&NodeId> = order
                .iter()
                .filter(|id| nodes.get(*id).map(|n| n.kind == NodeKind::Start).unwrap_or(false))
                .collect();
            let candidates: Vec<&NodeId> = if starts.is_empty() {
                order.iter().filter(|id| !incoming.contains_key(*id)).collect()
            } else {
                starts
            };
            match candidates.as_slice() {
                [] => return Err(GraphBuildError::NoRoot),
                [only] => (*only).clone(),
                many => {
                    return Err(GraphBuildError::AmbiguousRoot(
                        many.iter().map(|id| id.to_string()).collect(),
                    ))
                }
            }
        }
    };

    if incoming.contains_key(&root) {
        return Err(GraphBuildError::RootHasIncoming(root.to_string()));
    }
    Ok(root)
}

fn check_acyclic(
    order: &[NodeId],
    edges: &HashMap<String, Edge>,
    outgoing: &HashMap<NodeId, Vec<String>>,
    incoming: &HashMap<NodeId, Vec<String>>,
) -> Result<(), GraphBuildError> {
    let mut in_degree: HashMap<&NodeId, usize> = order
        .iter()
        .map(|id| (id, incoming.get(id).map(Vec::len).unwrap_or(0)))
        .collect();
    let mut queue: VecDeque<&NodeId> = order.iter().filter(|id| in_degree[id] == 0).collect();
    let mut visited = 0;

    while let Some(id) = queue.pop_front() {
        visited += 1;
        for edge_id in outgoing.get(id).into_iter().flatten() {
            let Some(edge) = edges.get(edge_id) else { continue };
            if let Some(degree) = in_degree.get_mut(&edge.target_node_id) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(&edge.target_node_id);
                }
            }
        }
    }

    if visited == order.len() {
        return Ok(());
    }
    let stuck = order
        .iter()
        .filter(|id| in_degree[id] > 0)
        .min()
        .map(|id| id.to_string())
        .unwrap_or_default();
    Err(GraphBuildError::CycleDetected(stuck))
}

fn check_reachable(
    root: &NodeId,
    order: &[NodeId],
    edges: &HashMap<String, Edge>,
    outgoing: &HashMap<NodeId, Vec<String>>,
) -> Result<(), GraphBuildError> {
    let mut seen: HashSet<&NodeId> = HashSet::new();
    let mut stack = vec![root];
    while let Some(id) = stack.pop() {
        if !seen.insert(id) {
            continue;
        }
        for edge_id in outgoing.get(id).into_iter().flatten() {
            if let Some(edge) = edges.get(edge_id) {
                stack.push(&edge.target_node_id);
            }
        }
    }
    match order.iter().find(|id| !seen.contains(id)) {
        Some(id) => Err(GraphBuildError::Unreachable(id.to_string())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear() -> GraphBuilder {
        GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("llm", NodeKind::Llm))
            .node(Node::new("end", NodeKind::End))
            .edge("start", "llm")
            .edge("llm", "end")
    }

    #[test]
    fn test_build_linear_graph() {
        let graph = linear().build().unwrap();
        assert_eq!(graph.root_node_id(), &NodeId::from("start"));
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.outgoing("start").count(), 1);
        assert_eq!(graph.incoming("end").count(), 1);
        assert_eq!(graph.parallelism_score(), 0);
        assert!(graph.parallel_mapping().is_empty());
    }

    #[test]
    fn test_generated_edge_ids() {
        let graph = linear().build().unwrap();
        assert!(graph.edge("start-source-llm").is_some());
        assert!(graph.edge("llm-source-end").is_some());
    }

    #[test]
    fn test_empty_graph() {
        assert_eq!(GraphBuilder::new().build().unwrap_err(), GraphBuildError::Empty);
    }

    #[test]
    fn test_duplicate_node() {
        let err = linear().node(Node::new("llm", NodeKind::Tool)).build().unwrap_err();
        assert_eq!(err, GraphBuildError::DuplicateNode("llm".into()));
    }

    #[test]
    fn test_unknown_edge_target() {
        let err = linear().edge("llm", "ghost").build().unwrap_err();
        assert!(matches!(err, GraphBuildError::UnknownNode { node_id, .. } if node_id == "ghost"));
    }

    #[test]
    fn test_cycle_detected() {
        let err = GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("a", NodeKind::Llm))
            .node(Node::new("b", NodeKind::Llm))
            .edge("start", "a")
            .edge("a", "b")
            .edge("b", "a")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphBuildError::CycleDetected("a".into()));
    }

    #[test]
    fn test_unreachable_node() {
        let err = GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("a", NodeKind::Llm))
            .node(Node::new("orphan", NodeKind::Llm))
            .edge("start", "a")
            .edge("orphan", "a")
            .build()
            .unwrap_err();
        assert_eq!(err, GraphBuildError::Unreachable("orphan".into()));
    }

    #[test]
    fn test_root_inferred_without_start_kind() {
        let graph = GraphBuilder::new()
            .node(Node::new("a", NodeKind::Llm))
            .node(Node::new("b", NodeKind::Llm))
            .edge("a", "b")
            .build()
            .unwrap();
        assert_eq!(graph.root_node_id(), &NodeId::from("a"));
    }

    #[test]
    fn test_ambiguous_root() {
        let err = GraphBuilder::new()
            .node(Node::new("a", NodeKind::Llm))
            .node(Node::new("b", NodeKind::Llm))
            .build()
            .unwrap_err();
        assert_eq!(err, GraphBuildError::AmbiguousRoot(vec!["a".into(), "b".into()]));
    }

    #[test]
    fn test_parallel_maps_and_score() {
        let graph = GraphBuilder::new()
            .node(Node::new("start", NodeKind::Start))
            .node(Node::new("llm1", NodeKind::Llm))
            .node(Node::new("llm2", NodeKind::Llm))
            .node(Node::new("answer", NodeKind::Answer))
            .edge("start", "llm1")
            .edge("start", "llm2")
            .edge("llm1", "answer")
            .edge("llm2", "answer")
            .build()
            .unwrap();

        let p1 = graph.parallel_for("llm1").unwrap();
        let p2 = graph.parallel_for("llm2").unwrap();
        assert_eq!(p1.id, p2.id);
        assert_eq!(p1.start_from_node_id, NodeId::from("start"));
        assert!(graph.parallel_for("answer").is_none());
        assert_eq!(graph.parallelism_score(), 2);
    }

    #[test]
    fn test_from_json() {
        let json = r#"{
            "nodes": [
                {"id": "start", "type": "start"},
                {"id": "if", "type": "if-else"},
                {"id": "yes", "type": "answer", "config": {"answer": "yes"}},
                {"id": "no", "type": "answer", "config": {"answer": "no"}}
            ],
            "edges": [
                {"source": "start", "target": "if"},
                {"source": "if", "target": "yes", "sourceHandle": "true"},
                {"source": "if", "target": "no", "sourceHandle": "false"}
            ]
        }"#;
        let graph = Graph::from_json(json, DEFAULT_MAX_PARALLEL_DEPTH).unwrap();
        let handles: Vec<&str> = graph.outgoing("if").map(|e| e.handle()).collect();
        assert_eq!(handles, vec!["true", "false"]);
        assert!(graph.parallel_mapping().is_empty());
    }
}
