//! Optional petgraph compatibility layer for analysis and DOT export.
//!
//! Enabled via the `petgraph-compat` feature; unrelated to execution.

use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::FxHashMap;

use crate::types::NodeId;

pub type WeaveDiGraph = DiGraph<NodeId, ()>;
pub type NodeIndexMap = FxHashMap<NodeId, NodeIndex>;

#[derive(Debug, Clone)]
pub struct PetgraphConversion {
    pub graph: WeaveDiGraph,
    pub index_map: NodeIndexMap,
}

impl PetgraphConversion {
    #[must_use]
    pub fn index_of(&self, node: &NodeId) -> Option<NodeIndex> {
        self.index_map.get(node).copied()
    }

    #[must_use]
    pub fn node_at(&self, index: NodeIndex) -> Option<&NodeId> {
        self.graph.node_weight(index)
    }
}

fn order_rank(id: &NodeId) -> (u8, &str) {
    match id {
        NodeId::Start => (0, ""),
        NodeId::Custom(name) => (1, name.as_str()),
        NodeId::End => (2, ""),
    }
}

pub(super) fn to_petgraph(edges: &FxHashMap<NodeId, Vec<NodeId>>) -> PetgraphConversion {
    let mut graph = DiGraph::new();
    let mut index_map: NodeIndexMap = FxHashMap::default();

    let mut all_nodes: Vec<NodeId> = Vec::new();
    for (from, tos) in edges {
        if !index_map.contains_key(from) {
            all_nodes.push(from.clone());
            index_map.insert(from.clone(), NodeIndex::new(0));
        }
        for to in tos {
            if !index_map.contains_key(to) {
                all_nodes.push(to.clone());
                index_map.insert(to.clone(), NodeIndex::new(0));
            }
        }
    }

    all_nodes.sort_by(|a, b| order_rank(a).cmp(&order_rank(b)));

    for node in &all_nodes {
        let idx = graph.add_node(node.clone());
        index_map.insert(node.clone(), idx);
    }

    for (from, tos) in edges {
        let from_idx = index_map[from];
        for to in tos {
            let to_idx = index_map[to];
            graph.add_edge(from_idx, to_idx, ());
        }
    }

    PetgraphConversion { graph, index_map }
}

pub(super) fn to_dot(edges: &FxHashMap<NodeId, Vec<NodeId>>) -> String {
    use std::fmt::Write;

    let conversion = to_petgraph(edges);
    let mut output = String::new();

    writeln!(output, "digraph {{").unwrap();
    writeln!(output, "    rankdir=TB;").unwrap();
    writeln!(output, "    node [shape=box, style=rounded];").unwrap();

    for idx in conversion.graph.node_indices() {
        let node = conversion.graph.node_weight(idx).unwrap();
        let (label, style) = match node {
            NodeId::Start => ("Start", " style=\"filled\" fillcolor=\"lightgreen\""),
            NodeId::End => ("End", " style=\"filled\" fillcolor=\"lightcoral\""),
            NodeId::Custom(name) => (name.as_str(), ""),
        };
        writeln!(output, "    {} [ label=\"{}\"{} ];", idx.index(), label, style).unwrap();
    }

    writeln!(output).unwrap();

    for edge in conversion.graph.edge_indices() {
        let (from, to) = conversion.graph.edge_endpoints(edge).unwrap();
        writeln!(output, "    {} -> {};", from.index(), to.index()).unwrap();
    }

    writeln!(output, "}}").unwrap();
    output
}

#[must_use]
pub fn is_cyclic(edges: &FxHashMap<NodeId, Vec<NodeId>>) -> bool {
    let conversion = to_petgraph(edges);
    petgraph::algo::is_cyclic_directed(&conversion.graph)
}
