//! Parallel group detection
//!
//! A node with more than one outgoing edge under the same handle is a branch
//! point; each such handle opens one parallel group. The group's members are
//! the nodes reachable from its branch targets before the merge node (the
//! nearest node every branch reaches). Groups opened inside another group's
//! region record that group as their parent.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};

use super::node::NodeId;
use crate::error::GraphBuildError;

/// A parallel group of concurrently executing branches
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parallel {
    /// Group id, derived from the branch point and handle
    pub id: String,
    /// The branch point node
    pub start_from_node_id: NodeId,
    /// Enclosing group, for nested regions
    pub parent_parallel_id: Option<String>,
    /// Branch point of the enclosing group
    pub parent_parallel_start_node_id: Option<NodeId>,
    /// Merge node where the branches rejoin, if any
    pub end_to_node_id: Option<NodeId>,
}

/// Derived parallel maps of a graph
#[derive(Debug, Clone, Default)]
pub(crate) struct ParallelMaps {
    pub parallels: HashMap<String, Parallel>,
    pub node_parallel: HashMap<NodeId, String>,
}

/// Outgoing adjacency in edge order: node -> [(handle, target)]
pub(crate) type Adjacency = HashMap<NodeId, Vec<(String, NodeId)>>;

pub(crate) fn detect_parallels(root: &NodeId, adjacency: &Adjacency) -> ParallelMaps {
    let mut detector = Detector {
        adjacency,
        maps: ParallelMaps::default(),
        visited: HashSet::new(),
    };
    detector.walk(root, None);
    detector.maps
}

/// Reject parallel chains nested deeper than `limit`
pub(crate) fn check_depth(maps: &ParallelMaps, limit: usize) -> Result<(), GraphBuildError> {
    let mut ids: Vec<&String> = maps.parallels.keys().collect();
    ids.sort();
    for id in ids {
        let mut depth = 1;
        let mut current = maps.parallels.get(id).and_then(|p| p.parent_parallel_id.as_ref());
        while let Some(parent_id) = current {
            depth += 1;
            if depth > limit {
                return Err(GraphBuildError::ParallelDepthExceeded {
                    parallel_id: id.clone(),
                    limit,
                });
            }
            current = maps
                .parallels
                .get(parent_id)
                .and_then(|p| p.parent_parallel_id.as_ref());
        }
    }
    Ok(())
}

struct Detector<'a> {
    adjacency: &'a Adjacency,
    maps: ParallelMaps,
    visited: HashSet<(NodeId, Option<String>)>,
}

impl<'a> Detector<'a> {
    fn walk(&mut self, node_id: &NodeId, parent: Option<String>) {
        if !self.visited.insert((node_id.clone(), parent.clone())) {
            return;
        }
        let adjacency = self.adjacency;
        let Some(edges) = adjacency.get(node_id) else {
            return;
        };

        // Group targets by handle, keeping edge order
        let mut by_handle: Vec<(&str, Vec<&NodeId>)> = Vec::new();
        for (handle, target) in edges {
            match by_handle.iter_mut().find(|(h, _)| *h == handle.as_str()) {
                Some((_, targets)) => targets.push(target),
                None => by_handle.push((handle.as_str(), vec![target])),
            }
        }

        let mut opened: HashMap<&str, String> = HashMap::new();
        for (handle, targets) in &by_handle {
            if targets.len() > 1 {
                let id = self.open_group(node_id, handle, targets, parent.as_deref());
                opened.insert(*handle, id);
            }
        }

        for (handle, target) in edges {
            let current = match opened.get(handle.as_str()) {
                Some(id) => Some(id.clone()),
                None => self.current_parallel(parent.as_deref(), target),
            };
            self.walk(target, current);
        }
    }

    fn open_group(
        &mut self,
        start: &NodeId,
        handle: &str,
        targets: &[&NodeId],
        parent_id: Option<&str>,
    ) -> String {
        let id = format!("{}:{}", start, handle);
        let parent = parent_id.and_then(|pid| self.maps.parallels.get(pid)).cloned();
        let merge = self.find_merge_node(targets);

        for member in self.collect_members(targets, merge.as_ref()) {
            let in_parent = match parent_id {
                Some(pid) => self.maps.node_parallel.get(&member).map(String::as_str) == Some(pid),
                None => true,
            };
            if in_parent {
                self.maps.node_parallel.insert(member, id.clone());
            }
        }

        let end_to_node_id = match (&parent, merge) {
            (Some(p), Some(m)) if p.end_to_node_id.as_ref() == Some(&m) => None,
            (_, merge) => merge,
        };

        self.maps.parallels.insert(
            id.clone(),
            Parallel {
                id: id.clone(),
                start_from_node_id: start.clone(),
                parent_parallel_id: parent.as_ref().map(|p| p.id.clone()),
                parent_parallel_start_node_id: parent.map(|p| p.start_from_node_id),
                end_to_node_id,
            },
        );
        id
    }

    /// The group a target belongs to when reached through a plain edge
    fn current_parallel(&self, parent: Option<&str>, target: &NodeId) -> Option<String> {
        let mut current = parent.and_then(|id| self.maps.parallels.get(id));
        while let Some(parallel) = current {
            if parallel.end_to_node_id.as_ref() != Some(target) {
                return Some(parallel.id.clone());
            }
            current = parallel
                .parent_parallel_id
                .as_ref()
                .and_then(|id| self.maps.parallels.get(id));
        }
        None
    }

    fn reachable(&self, from: &NodeId) -> Vec<NodeId> {
        let mut seen = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::from([from.clone()]);
        while let Some(node) = queue.pop_front() {
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(edges) = self.adjacency.get(&node) {
                for (_, target) in edges {
                    queue.push_back(target.clone());
                }
            }
            order.push(node);
        }
        order
    }

    /// Nearest node reached by every branch target
    fn find_merge_node(&self, targets: &[&NodeId]) -> Option<NodeId> {
        let reach: Vec<Vec<NodeId>> = targets.iter().map(|t| self.reachable(t)).collect();
        let (first, rest) = reach.split_first()?;
        let rest_sets: Vec<HashSet<&NodeId>> = rest.iter().map(|r| r.iter().collect()).collect();
        let common: Vec<&NodeId> = first
            .iter()
            .filter(|n| rest_sets.iter().all(|s| s.contains(n)))
            .collect();

        common
            .iter()
            .copied()
            .find(|candidate| {
                !common.iter().any(|other| {
                    other != candidate && self.reachable(other).contains(candidate)
                })
            })
            .cloned()
    }

    /// Nodes on the branches before the merge node
    fn collect_members(&self, targets: &[&NodeId], merge: Option<&NodeId>) -> Vec<NodeId> {
        let mut members = Vec::new();
        let mut seen = HashSet::new();
        let mut stack: Vec<NodeId> = targets.iter().rev().map(|t| (*t).clone()).collect();
        while let Some(node) = stack.pop() {
            if Some(&node) == merge || !seen.insert(node.clone()) {
                continue;
            }
            if let Some(edges) = self.adjacency.get(&node) {
                for (_, target) in edges.iter().rev() {
                    stack.push(target.clone());
                }
            }
            members.push(node);
        }
        members
    }
}
