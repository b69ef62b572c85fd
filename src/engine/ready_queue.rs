//! Ready queue
//!
//! Nodes whose prerequisites are resolved, in the order they became ready.

use std::collections::{HashSet, VecDeque};

use crate::graph::NodeId;

/// FIFO of dispatchable nodes
pub trait ReadyQueue: Send {
    /// Enqueue a node; returns false if it is already queued
    fn push(&mut self, node_id: NodeId) -> bool;

    /// Take the oldest node
    fn pop(&mut self) -> Option<NodeId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn contains(&self, node_id: &str) -> bool;

    /// Queue contents in dispatch order
    fn snapshot(&self) -> Vec<NodeId>;

    fn clear(&mut self);
}

/// In-memory [`ReadyQueue`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryReadyQueue {
    queue: VecDeque<NodeId>,
    members: HashSet<NodeId>,
}

impl InMemoryReadyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a snapshot, dropping duplicates
    pub fn from_snapshot(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        let mut queue = Self::new();
        for node in nodes {
            queue.push(node);
        }
        queue
    }
}

impl ReadyQueue for InMemoryReadyQueue {
    fn push(&mut self, node_id: NodeId) -> bool {
        if !self.members.insert(node_id.clone()) {
            return false;
        }
        self.queue.push_back(node_id);
        true
    }

    fn pop(&mut self) -> Option<NodeId> {
        let node = self.queue.pop_front()?;
        self.members.remove(&node);
        Some(node)
    }

    fn len(&self) -> usize {
        self.queue.len()
    }

    fn contains(&self, node_id: &str) -> bool {
        self.members.contains(node_id)
    }

    fn snapshot(&self) -> Vec<NodeId> {
        self.queue.iter().cloned().collect()
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }
}
