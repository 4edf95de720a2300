//! Dependency graphs over resource records.

use ledger::{ResourceState, Urn};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::HashMap;

/// Lifetime dependencies among live records.
///
/// An edge runs from a record to every record that depends on it through
/// dependencies, property dependencies or its provider. Parent links are
/// ownership, not lifetime, and are left out.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<usize, ()>,
    nodes: HashMap<Urn, NodeIndex>,
}

impl DependencyGraph {
    /// Build the graph over `records`. Pending-delete records are skipped.
    pub fn new(records: &[ResourceState]) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();
        for (index, record) in records.iter().enumerate() {
            if !record.delete {
                nodes.insert(record.urn.clone(), graph.add_node(index));
            }
        }
        for record in records.iter().filter(|r| !r.delete) {
            let dependent = nodes[&record.urn];
            for urn in record.predecessors() {
                if record.depends_on(&urn)
                    && let Some(&dependency) = nodes.get(&urn)
                {
                    graph.update_edge(dependency, dependent, ());
                }
            }
        }
        Self { graph, nodes }
    }

    /// Indexes of every record that transitively depends on `urn`, in
    /// ascending order. The record itself is not included.
    pub fn dependents_of(&self, urn: &Urn) -> Vec<usize> {
        let Some(&start) = self.nodes.get(urn) else {
            return Vec::new();
        };
        let mut found = Vec::new();
        let mut dfs = Dfs::new(&self.graph, start);
        while let Some(node) = dfs.next(&self.graph) {
            if node != start {
                found.push(self.graph[node]);
            }
        }
        found.sort_unstable();
        found
    }
}

/// Ordering constraints for deleting `records`.
///
/// Returns the indexes in an order where every record comes after all the
/// records that refer to it, and for each index the records whose deletion
/// must finish first. Parent links count here: children go before parents.
pub fn delete_order(records: &[ResourceState]) -> (Vec<usize>, Vec<Vec<usize>>) {
    let mut graph: DiGraph<usize, ()> = DiGraph::new();
    let nodes: Vec<NodeIndex> = (0..records.len()).map(|i| graph.add_node(i)).collect();
    let mut by_urn: HashMap<&Urn, Vec<usize>> = HashMap::new();
    for (index, record) in records.iter().enumerate() {
        by_urn.entry(&record.urn).or_default().push(index);
    }

    for (index, record) in records.iter().enumerate() {
        for urn in record.predecessors() {
            for &target in by_urn.get(&urn).into_iter().flatten() {
                if target != index {
                    // referrer -> referenced: the referrer is deleted first
                    graph.update_edge(nodes[index], nodes[target], ());
                }
            }
        }
    }

    let waits = nodes
        .iter()
        .map(|&node| {
            let mut before: Vec<usize> = graph
                .neighbors_directed(node, Direction::Incoming)
                .map(|n| graph[n])
                .collect();
            before.sort_unstable();
            before
        })
        .collect();

    let order = match toposort(&graph, None) {
        Ok(sorted) => sorted.into_iter().map(|n| graph[n]).collect(),
        Err(cycle) => {
            log::warn!(
                "Reference cycle through {} while ordering deletes; falling back to reverse order",
                records[graph[cycle.node_id()]].urn
            );
            (0..records.len()).rev().collect()
        }
    };
    (order, waits)
}
