//! Directed graph over task IDs for dependency ordering.
//!
//! This module backs the dependency engine with:
//! - Topological sorting (activation cascades process upstreams first)
//! - Cycle enumeration (the per-version verification hook)
//!
//! **Note:** This module is internal to `cadence-exec` to preserve freedom to
//! change internals.

use std::collections::{HashMap, VecDeque};

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;

use cadence_core::TaskId;

use crate::error::{Error, Result};

/// A directed graph of task IDs with edges `dependency -> dependent`.
///
/// Insertion order breaks ties in the topological sort, so cascades walk
/// tasks in a reproducible order regardless of map iteration quirks.
#[derive(Debug, Clone, Default)]
pub(crate) struct TaskGraph {
    graph: DiGraph<TaskId, ()>,
    index_map: HashMap<TaskId, NodeIndex>,
    insertion_order: Vec<NodeIndex>,
}

impl TaskGraph {
    /// Creates an empty graph.
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a node; adding an existing node is a no-op.
    pub(crate) fn add_node(&mut self, id: TaskId) -> NodeIndex {
        if let Some(&idx) = self.index_map.get(&id) {
            return idx;
        }
        let idx = self.graph.add_node(id.clone());
        self.index_map.insert(id, idx);
        self.insertion_order.push(idx);
        idx
    }

    /// Adds a `dependency -> dependent` edge between existing nodes.
    pub(crate) fn add_edge(&mut self, dependency: NodeIndex, dependent: NodeIndex) {
        self.graph.add_edge(dependency, dependent, ());
    }

    /// Returns the node index for an ID, if present.
    pub(crate) fn get_index(&self, id: &TaskId) -> Option<NodeIndex> {
        self.index_map.get(id).copied()
    }

    /// Returns a topologically sorted list of task IDs.
    ///
    /// Kahn's algorithm with deterministic tie-breaking: when multiple nodes
    /// have zero in-degree they are processed in insertion order.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CycleDetected`] if the graph contains a cycle.
    pub(crate) fn toposort(&self) -> Result<Vec<TaskId>> {
        let node_count = self.graph.node_count();
        if node_count == 0 {
            return Ok(Vec::new());
        }

        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::with_capacity(node_count);
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut result = Vec::with_capacity(node_count);

        while let Some(idx) = queue.pop_front() {
            if let Some(id) = self.graph.node_weight(idx) {
                result.push(id.clone());
            }

            let mut neighbors: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            neighbors.sort_by_key(|n| {
                self.insertion_order
                    .iter()
                    .position(|&i| i == *n)
                    .unwrap_or(usize::MAX)
            });

            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if result.len() != node_count {
            let cycle: Vec<String> = self
                .insertion_order
                .iter()
                .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .filter_map(|&idx| self.graph.node_weight(idx))
                .map(ToString::to_string)
                .collect();
            return Err(Error::CycleDetected { cycle });
        }

        Ok(result)
    }

    /// Enumerates dependency cycles: every strongly connected component with
    /// more than one node, plus single-node self-loops.
    pub(crate) fn cycles(&self) -> Vec<Vec<TaskId>> {
        tarjan_scc(&self.graph)
            .into_iter()
            .filter(|component| {
                component.len() > 1
                    || component
                        .first()
                        .is_some_and(|&idx| self.graph.find_edge(idx, idx).is_some())
            })
            .map(|component| {
                component
                    .into_iter()
                    .filter_map(|idx| self.graph.node_weight(idx).cloned())
                    .collect()
            })
            .collect()
    }
}
