//! Graph compilation: turns a [`GraphBuilder`] into an immutable, validated
//! [`Graph`] the scheduler can drive.

use std::sync::Arc;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use super::builder::GraphBuilder;
use super::edges::ConditionalEdge;
use crate::node::Node;
use crate::types::NodeId;

/// A validated, immutable graph ready for execution. Holds the node
/// registry, static edges, and conditional edges produced by
/// [`GraphBuilder::compile`].
pub struct Graph<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    nodes: FxHashMap<NodeId, Arc<dyn Node<S, D>>>,
    edges: FxHashMap<NodeId, Vec<NodeId>>,
    conditional_edges: Vec<ConditionalEdge<S>>,
}

impl<S, D> Graph<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    pub fn node(&self, id: &NodeId) -> Option<&Arc<dyn Node<S, D>>> {
        self.nodes.get(id)
    }

    /// Static (unconditional) successors of `from`, in declaration order.
    pub fn static_successors(&self, from: &NodeId) -> &[NodeId] {
        self.edges.get(from).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Conditional edges whose source is `from`, evaluated in declaration
    /// order against the current state to produce extra successors.
    pub fn conditional_successors(&self, from: &NodeId, state: &S) -> Vec<NodeId> {
        self.conditional_edges
            .iter()
            .filter(|edge| &edge.from == from)
            .flat_map(|edge| (edge.predicate)(state))
            .collect()
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn topological_sort(&self) -> Vec<NodeId> {
        super::iteration::topological_sort(&self.edges)
    }
}

impl<S, D> GraphBuilder<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    /// Validates the graph's static structure and compiles it into a
    /// [`Graph`] ready for execution (§3 "Edge", §4.1 admission).
    ///
    /// # Errors
    ///
    /// Returns [`GraphCompileError`] if any edge references an unregistered
    /// custom node, if no node is registered at all, or if `Start` has no
    /// outgoing edge. Cycles are not rejected here; they are a normal,
    /// bounded construct handled by the scheduler's backpressure.
    pub fn compile(self) -> Result<Graph<S, D>, GraphCompileError> {
        let nodes = self.nodes_ref().clone();
        let edges = self.edges_ref().clone();
        let conditional_edges = self.conditional_edges_ref().clone();

        if nodes.is_empty() {
            return Err(GraphCompileError::Empty);
        }

        let known = |id: &NodeId| id.is_virtual() || nodes.contains_key(id);

        for (from, tos) in &edges {
            if !known(from) {
                return Err(GraphCompileError::UnknownNode { node_id: from.clone() });
            }
            for to in tos {
                if !known(to) {
                    return Err(GraphCompileError::UnknownNode { node_id: to.clone() });
                }
            }
        }

        for edge in &conditional_edges {
            if !known(&edge.from) {
                return Err(GraphCompileError::UnknownNode {
                    node_id: edge.from.clone(),
                });
            }
        }

        let has_start_edge = edges.contains_key(&NodeId::Start)
            || conditional_edges.iter().any(|e| e.from == NodeId::Start);
        if !has_start_edge {
            return Err(GraphCompileError::NoEntryPoint);
        }

        Ok(Graph {
            nodes,
            edges,
            conditional_edges,
        })
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum GraphCompileError {
    #[error("graph has no registered nodes")]
    #[diagnostic(
        code(stepwright::graph::empty),
        help("register at least one node with GraphBuilder::add_node before compiling")
    )]
    Empty,

    #[error("edge references unregistered node {node_id}")]
    #[diagnostic(
        code(stepwright::graph::unknown_node),
        help("every edge endpoint other than Start/End must be registered via add_node")
    )]
    UnknownNode { node_id: NodeId },

    #[error("graph has no edge leaving Start")]
    #[diagnostic(
        code(stepwright::graph::no_entry_point),
        help("add an edge or conditional edge from NodeId::Start to define the entry frontier")
    )]
    NoEntryPoint,
}
