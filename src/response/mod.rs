//! Response stream coordinator
//!
//! Orders streamed output across parallel branches. Every Answer node gets a
//! session built from its template. Only one session is active at a time; the
//! active session walks its segments in order, emitting text immediately and
//! draining buffered upstream chunks for variable segments. Chunks for a
//! selector that is not the active segment are buffered until it is.
//!
//! A session starts once some path from the root to its Answer node has all
//! of its branch edges taken. Sessions queue in the order they become
//! startable.
//!
//! The coordinator is a pure reducer: the engine feeds it graph events and
//! publishes the [`ResponseChunk`]s it returns.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::graph::{Graph, NodeId, NodeKind};
use crate::nodes::{AnswerNode, Segment, Template};
use crate::state::{render_value, Selector, VariablePool};

/// Output field that Answer node chunks are attributed to
pub const ANSWER_FIELD: &str = "answer";

/// An ordered chunk attributed to a response node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseChunk {
    pub node_id: NodeId,
    pub execution_id: String,
    /// Always `[node_id, "answer"]`
    pub selector: Selector,
    /// Upstream node output the text came from; `None` for template text and system variables
    pub from_selector: Option<Selector>,
    pub chunk: String,
    pub is_final: bool,
}

/// Streamed chunks received for one selector
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamBuffer {
    pub chunks: Vec<String>,
    /// Chunks already emitted
    pub position: usize,
    pub closed: bool,
}

/// Progress of one response session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub node_id: NodeId,
    /// Next segment to emit
    pub index: usize,
}

/// Serializable coordinator state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorSnapshot {
    pub active: Option<SessionState>,
    pub waiting: Vec<SessionState>,
    /// Answer nodes that already got a session
    pub started: Vec<NodeId>,
    pub taken_branch_edges: Vec<String>,
    pub streams: Vec<(Selector, StreamBuffer)>,
    pub finished_nodes: Vec<NodeId>,
    pub skipped_nodes: Vec<NodeId>,
    pub execution_ids: Vec<(NodeId, String)>,
}

/// Orders Answer output across branches
#[derive(Debug, Clone)]
pub struct ResponseStreamCoordinator {
    templates: HashMap<NodeId, Template>,
    /// Answer nodes in declaration order
    response_nodes: Vec<NodeId>,
    /// Answer node -> sets of branch edges, one set per root path
    paths_map: HashMap<NodeId, Vec<BTreeSet<String>>>,
    branch_edges: HashSet<String>,
    referenced: HashSet<Selector>,
    graph_nodes: HashSet<NodeId>,

    active: Option<SessionState>,
    waiting: VecDeque<SessionState>,
    started: HashSet<NodeId>,
    taken_branch_edges: HashSet<String>,
    streams: HashMap<Selector, StreamBuffer>,
    finished_nodes: HashSet<NodeId>,
    skipped_nodes: HashSet<NodeId>,
    execution_ids: HashMap<NodeId, String>,
}

impl ResponseStreamCoordinator {
    /// Register every Answer node of the graph
    pub fn new(graph: &Arc<Graph>) -> Self {
        let mut templates = HashMap::new();
        let mut response_nodes = Vec::new();
        for node in graph.nodes().filter(|n| n.kind == NodeKind::Answer) {
            match AnswerNode::template(node) {
                Ok(template) => {
                    templates.insert(node.id.clone(), template);
                    response_nodes.push(node.id.clone());
                }
                Err(e) => {
                    warn!(node_id = %node.id, error = %e, "Answer node has no usable template");
                }
            }
        }

        let referenced = templates
            .values()
            .flat_map(|t| t.selectors().map(Selector::root))
            .collect();

        let mut memo = HashMap::new();
        let paths_map: HashMap<NodeId, Vec<BTreeSet<String>>> = response_nodes
            .iter()
            .map(|id| (id.clone(), branch_paths(graph, id, &mut memo)))
            .collect();
        let branch_edges = paths_map
            .values()
            .flatten()
            .flat_map(|path| path.iter().cloned())
            .collect();

        Self {
            templates,
            response_nodes,
            paths_map,
            branch_edges,
            referenced,
            graph_nodes: graph.nodes().map(|n| n.id.clone()).collect(),
            active: None,
            waiting: VecDeque::new(),
            started: HashSet::new(),
            taken_branch_edges: HashSet::new(),
            streams: HashMap::new(),
            finished_nodes: HashSet::new(),
            skipped_nodes: HashSet::new(),
            execution_ids: HashMap::new(),
        }
    }

    /// Whether the node is a registered response node
    pub fn is_response_node(&self, node_id: &str) -> bool {
        self.templates.contains_key(node_id)
    }

    /// Execution id of a response node, assigned on first use
    pub fn execution_id(&mut self, node_id: &NodeId) -> String {
        self.execution_ids
            .entry(node_id.clone())
            .or_insert_with(|| uuid::Uuid::new_v4().to_string())
            .clone()
    }

    /// Branch-edge path sets leading to a response node
    pub fn paths(&self, node_id: &str) -> Option<&[BTreeSet<String>]> {
        self.paths_map.get(node_id).map(Vec::as_slice)
    }

    /// Start sessions that need no branch decision
    pub fn on_graph_start(&mut self, pool: &VariablePool) -> Vec<ResponseChunk> {
        self.start_ready_sessions();
        self.flush(pool)
    }

    /// An edge was taken
    pub fn on_edge_taken(&mut self, edge_id: &str, pool: &VariablePool) -> Vec<ResponseChunk> {
        if !self.branch_edges.contains(edge_id) {
            return Vec::new();
        }
        if self.taken_branch_edges.insert(edge_id.to_string()) {
            self.start_ready_sessions();
        }
        self.flush(pool)
    }

    /// A node streamed a chunk of one output field
    pub fn on_stream_chunk(
        &mut self,
        selector: &Selector,
        chunk: &str,
        is_final: bool,
        pool: &VariablePool,
    ) -> Vec<ResponseChunk> {
        let key = selector.root();
        if !self.referenced.contains(&key) {
            return Vec::new();
        }
        let buffer = self.streams.entry(key).or_default();
        if buffer.closed {
            return Vec::new();
        }
        if !chunk.is_empty() {
            buffer.chunks.push(chunk.to_string());
        }
        if is_final {
            buffer.closed = true;
        }
        self.flush(pool)
    }

    /// A node finished, successfully or not; its streams are complete
    pub fn on_node_finished(&mut self, node_id: &NodeId, pool: &VariablePool) -> Vec<ResponseChunk> {
        self.finished_nodes.insert(node_id.clone());
        for (selector, buffer) in self.streams.iter_mut() {
            if &selector.node_id == node_id {
                buffer.closed = true;
            }
        }
        self.flush(pool)
    }

    /// A node will not run in this run
    pub fn on_node_skipped(&mut self, node_id: &NodeId, pool: &VariablePool) -> Vec<ResponseChunk> {
        self.skipped_nodes.insert(node_id.clone());
        self.waiting.retain(|s| &s.node_id != node_id);
        if self.active.as_ref().map(|s| &s.node_id) == Some(node_id) {
            self.active = None;
        }
        self.flush(pool)
    }

    fn start_ready_sessions(&mut self) {
        for node_id in &self.response_nodes {
            if self.started.contains(node_id) || self.skipped_nodes.contains(node_id) {
                continue;
            }
            let reachable = self
                .paths_map
                .get(node_id)
                .map(|paths| {
                    paths
                        .iter()
                        .any(|p| p.iter().all(|e| self.taken_branch_edges.contains(e)))
                })
                .unwrap_or(false);
            if reachable {
                debug!(node_id = %node_id, "Response session queued");
                self.started.insert(node_id.clone());
                self.waiting.push_back(SessionState {
                    node_id: node_id.clone(),
                    index: 0,
                });
            }
        }
    }

    /// Emit everything the active sessions can emit right now
    fn flush(&mut self, pool: &VariablePool) -> Vec<ResponseChunk> {
        let mut out = Vec::new();
        loop {
            let Some(mut session) = self.active.take().or_else(|| self.waiting.pop_front()) else {
                break;
            };
            let complete = self.advance(&mut session, pool, &mut out);
            if !complete {
                self.active = Some(session);
                break;
            }
            let execution_id = self.execution_id(&session.node_id);
            out.push(ResponseChunk {
                selector: Selector::new(session.node_id.clone(), ANSWER_FIELD),
                node_id: session.node_id,
                execution_id,
                from_selector: None,
                chunk: String::new(),
                is_final: true,
            });
        }
        out
    }

    /// Walk segments until blocked; returns whether the session completed
    fn advance(
        &mut self,
        session: &mut SessionState,
        pool: &VariablePool,
        out: &mut Vec<ResponseChunk>,
    ) -> bool {
        let Some(template) = self.templates.get(&session.node_id) else {
            return true;
        };
        let segments: Vec<Segment> = template.segments()[session.index.min(template.segments().len())..].to_vec();

        for segment in segments {
            match segment {
                Segment::Text(text) => self.emit(&session.node_id, text, None, out),
                Segment::Variable(selector) => {
                    if !self.resolve_variable(&session.node_id, &selector, pool, out) {
                        return false;
                    }
                }
            }
            session.index += 1;
        }
        true
    }

    /// Emit what is available for a variable; returns whether it is complete
    fn resolve_variable(
        &mut self,
        response_id: &NodeId,
        selector: &Selector,
        pool: &VariablePool,
        out: &mut Vec<ResponseChunk>,
    ) -> bool {
        let source = &selector.node_id;
        if selector.path.is_empty() {
            if let Some(buffer) = self.streams.get_mut(selector) {
                let pending: Vec<String> = buffer.chunks[buffer.position..].to_vec();
                buffer.position = buffer.chunks.len();
                let closed = buffer.closed;
                let from = self.graph_nodes.contains(source).then_some(selector);
                for chunk in pending {
                    self.emit(response_id, chunk, from, out);
                }
                return closed;
            }
        }

        // Values not produced by a graph node (system variables) are final once present
        if self.finished_nodes.contains(source) || !self.graph_nodes.contains(source) {
            if let Some(value) = pool.get(selector) {
                let from = self.graph_nodes.contains(source).then_some(selector);
                self.emit(response_id, render_value(value), from, out);
            }
            return true;
        }
        self.skipped_nodes.contains(source)
    }

    fn emit(
        &mut self,
        response_id: &NodeId,
        chunk: String,
        from: Option<&Selector>,
        out: &mut Vec<ResponseChunk>,
    ) {
        if chunk.is_empty() {
            return;
        }
        out.push(ResponseChunk {
            node_id: response_id.clone(),
            execution_id: self.execution_id(response_id),
            selector: Selector::new(response_id.clone(), ANSWER_FIELD),
            from_selector: from.cloned(),
            chunk,
            is_final: false,
        });
    }

    /// Capture state for persistence
    pub fn snapshot(&self) -> CoordinatorSnapshot {
        let mut started: Vec<NodeId> = self.started.iter().cloned().collect();
        started.sort();
        let mut taken: Vec<String> = self.taken_branch_edges.iter().cloned().collect();
        taken.sort();
        let mut streams: Vec<(Selector, StreamBuffer)> = self
            .streams
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        streams.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        let mut finished: Vec<NodeId> = self.finished_nodes.iter().cloned().collect();
        finished.sort();
        let mut skipped: Vec<NodeId> = self.skipped_nodes.iter().cloned().collect();
        skipped.sort();
        let mut execution_ids: Vec<(NodeId, String)> = self
            .execution_ids
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        execution_ids.sort();

        CoordinatorSnapshot {
            active: self.active.clone(),
            waiting: self.waiting.iter().cloned().collect(),
            started,
            taken_branch_edges: taken,
            streams,
            finished_nodes: finished,
            skipped_nodes: skipped,
            execution_ids,
        }
    }

    /// Restore state captured by [`snapshot`](Self::snapshot)
    pub fn restore(&mut self, snapshot: CoordinatorSnapshot) {
        self.active = snapshot.active;
        self.waiting = snapshot.waiting.into();
        self.started = snapshot.started.into_iter().collect();
        self.taken_branch_edges = snapshot.taken_branch_edges.into_iter().collect();
        self.streams = snapshot.streams.into_iter().collect();
        self.finished_nodes = snapshot.finished_nodes.into_iter().collect();
        self.skipped_nodes = snapshot.skipped_nodes.into_iter().collect();
        self.execution_ids = snapshot.execution_ids.into_iter().collect();
    }
}

/// Sets of branch edges on the root paths to `target`
///
/// An edge counts as a branch edge when its source picks among handles
/// (IfElse nodes and nodes routing failures through `fail-branch`).
fn branch_paths(
    graph: &Graph,
    target: &NodeId,
    memo: &mut HashMap<NodeId, Vec<BTreeSet<String>>>,
) -> Vec<BTreeSet<String>> {
    if let Some(paths) = memo.get(target) {
        return paths.clone();
    }
    if target == graph.root_node_id() {
        let paths = vec![BTreeSet::new()];
        memo.insert(target.clone(), paths.clone());
        return paths;
    }

    let incoming: Vec<(String, NodeId, bool)> = graph
        .incoming(target.as_str())
        .map(|edge| {
            let conditional = graph
                .node(edge.source_node_id.as_str())
                .map(|n| n.is_conditional_source())
                .unwrap_or(false);
            (edge.id.clone(), edge.source_node_id.clone(), conditional)
        })
        .collect();

    let mut paths: Vec<BTreeSet<String>> = Vec::new();
    for (edge_id, source, conditional) in incoming {
        for mut path in branch_paths(graph, &source, memo) {
            if conditional {
                path.insert(edge_id.clone());
            }
            if !paths.contains(&path) {
                paths.push(path);
            }
        }
    }
    memo.insert(target.clone(), paths.clone());
    paths
}
