//! Graph topology: adjacency, ordering, reachability.
//!
//! Keeps the structural view of the graph separate from node storage. Edges
//! are recorded per (output slot, input slot) pair; the petgraph adjacency
//! carries reachability and cycle queries while Kahn's algorithm here owns
//! the ordering so ties break by insertion order, deterministically.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use fxhash::{FxHashMap, FxHashSet};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;

use crate::graph::NodeId;

/// A directed connection between two slots.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct GraphEdge {
    pub source: NodeId,
    pub source_output: u32,
    pub target: NodeId,
    pub target_input: u32,
}

/// Pending connection accumulated by a `ConnectionBatch`.
#[derive(Copy, Clone, Debug)]
pub struct PendingConnection {
    pub source: NodeId,
    pub source_output: u32,
    pub target: NodeId,
    pub target_input: u32,
}

/// Accumulates connections so they can be applied atomically: either every
/// connection validates and all are registered, or none is.
#[derive(Default)]
pub struct ConnectionBatch {
    pub(crate) connections: Vec<PendingConnection>,
}

impl ConnectionBatch {
    pub fn new() -> ConnectionBatch {
        ConnectionBatch::default()
    }

    pub fn connect(
        &mut self,
        source: NodeId,
        source_output: u32,
        target: NodeId,
        target_input: u32,
    ) -> &mut Self {
        self.connections.push(PendingConnection {
            source,
            source_output,
            target,
            target_input,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

//--------------------------------------------------------------------------------------------------

#[derive(Default)]
pub struct GraphTopology {
    adjacency: DiGraphMap<NodeId, ()>,
    edges: Vec<GraphEdge>,
    /// Node ids in insertion order; the tie-break for the topological sort.
    insertion: Vec<NodeId>,
}

impl GraphTopology {
    pub fn new() -> GraphTopology {
        GraphTopology::default()
    }

    pub fn add_node(&mut self, node: NodeId) {
        if !self.adjacency.contains_node(node) {
            self.adjacency.add_node(node);
            self.insertion.push(node);
        }
    }

    pub fn remove_node(&mut self, node: NodeId) {
        self.adjacency.remove_node(node);
        self.insertion.retain(|&n| n != node);
        self.edges
            .retain(|e| e.source != node && e.target != node);
    }

    pub fn add_edge(&mut self, edge: GraphEdge) {
        self.adjacency.add_edge(edge.source, edge.target, ());
        self.edges.push(edge);
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn node_count(&self) -> usize {
        self.insertion.len()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.adjacency.contains_node(node)
    }

    pub fn clear(&mut self) {
        self.adjacency = DiGraphMap::new();
        self.edges.clear();
        self.insertion.clear();
    }

    //---------------------------------------------------------------------
    // Queries

    /// True if adding an edge `source -> target` would close a cycle.
    pub fn would_create_cycle(&self, source: NodeId, target: NodeId) -> bool {
        source == target
            || petgraph::algo::has_path_connecting(&self.adjacency, target, source, None)
    }

    pub fn has_path(&self, from: NodeId, to: NodeId) -> bool {
        petgraph::algo::has_path_connecting(&self.adjacency, from, to, None)
    }

    /// Nodes without incoming edges, in insertion order.
    pub fn roots(&self) -> Vec<NodeId> {
        self.insertion
            .iter()
            .copied()
            .filter(|&n| {
                self.adjacency
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect()
    }

    /// Every node reachable from `node` along outgoing edges, excluding the
    /// node itself. Used to mark subtrees dirty.
    pub fn descendants(&self, node: NodeId) -> Vec<NodeId> {
        let mut seen = FxHashSet::default();
        let mut stack = vec![node];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            for next in self.adjacency.neighbors_directed(current, Direction::Outgoing) {
                if seen.insert(next) {
                    out.push(next);
                    stack.push(next);
                }
            }
        }
        out
    }

    //---------------------------------------------------------------------
    // Ordering

    /// Kahn's algorithm. Every edge `u -> v` places `u` first; nodes that
    /// become ready at the same time are emitted in insertion order, so the
    /// result is stable across repeated invocations.
    ///
    /// On a cycle, returns the participating nodes as the error value.
    pub fn topological_sort(&self) -> Result<Vec<NodeId>, Vec<NodeId>> {
        let position: FxHashMap<NodeId, usize> = self
            .insertion
            .iter()
            .enumerate()
            .map(|(i, &n)| (n, i))
            .collect();

        let mut in_degree: FxHashMap<NodeId, usize> =
            self.insertion.iter().map(|&n| (n, 0)).collect();
        for &n in &self.insertion {
            for next in self.adjacency.neighbors_directed(n, Direction::Outgoing) {
                *in_degree.entry(next).or_insert(0) += 1;
            }
        }

        let mut ready: BinaryHeap<Reverse<(usize, NodeId)>> = self
            .insertion
            .iter()
            .filter(|n| in_degree[*n] == 0)
            .map(|&n| Reverse((position[&n], n)))
            .collect();

        let mut order = Vec::with_capacity(self.insertion.len());
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(node);
            for next in self.adjacency.neighbors_directed(node, Direction::Outgoing) {
                let degree = in_degree.get_mut(&next).expect("edge to unknown node");
                *degree -= 1;
                if *degree == 0 {
                    ready.push(Reverse((position[&next], next)));
                }
            }
        }

        if order.len() == self.insertion.len() {
            Ok(order)
        } else {
            let sorted: FxHashSet<NodeId> = order.into_iter().collect();
            Err(self
                .insertion
                .iter()
                .copied()
                .filter(|n| !sorted.contains(n))
                .collect())
        }
    }
}

//--------------------------------------------------------------------------------------------------
