//! `GraphBuilder` implementation for constructing workflow graphs.

use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::FxHashMap;

use super::edges::{ConditionalEdge, EdgePredicate};
use crate::node::Node;
use crate::types::NodeId;

/// Builder for constructing a workflow graph over state type `S` and delta
/// type `D`, with a fluent API mirroring the rest of the crate's builders.
///
/// Every graph must have:
/// - at least one executable node added via [`add_node`](Self::add_node)
/// - an edge from [`NodeId::Start`] to define the entry frontier
/// - an edge into [`NodeId::End`] for every terminal branch
///
/// `Start`/`End` are virtual and must never be registered with `add_node`.
pub struct GraphBuilder<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    nodes: FxHashMap<NodeId, Arc<dyn Node<S, D>>>,
    edges: FxHashMap<NodeId, Vec<NodeId>>,
    conditional_edges: Vec<ConditionalEdge<S>>,
    _marker: PhantomData<D>,
}

impl<S, D> Default for GraphBuilder<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, D> GraphBuilder<S, D>
where
    S: Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: FxHashMap::default(),
            edges: FxHashMap::default(),
            conditional_edges: Vec::new(),
            _marker: PhantomData,
        }
    }

    /// Registers a node implementation under `id`. Registering `Start` or
    /// `End` is ignored with a warning; they are virtual and never executed.
    #[must_use]
    pub fn add_node(mut self, id: NodeId, node: impl Node<S, D> + 'static) -> Self {
        if id.is_virtual() {
            tracing::warn!(?id, "ignoring registration of virtual node id");
        } else {
            self.nodes.insert(id, Arc::new(node));
        }
        self
    }

    /// Adds a static, unconditional edge from `from` to `to`.
    #[must_use]
    pub fn add_edge(mut self, from: NodeId, to: NodeId) -> Self {
        self.edges.entry(from).or_default().push(to);
        self
    }

    /// Adds a conditional edge whose predicate is evaluated against the
    /// post-merge state when execution reaches `from`.
    #[must_use]
    pub fn add_conditional_edge(mut self, from: NodeId, predicate: EdgePredicate<S>) -> Self {
        self.conditional_edges.push(ConditionalEdge::new(from, predicate));
        self
    }

    pub fn nodes(&self) -> super::iteration::NodesIter<'_, S, D> {
        super::iteration::NodesIter::new(self.nodes.keys())
    }

    pub fn edges(&self) -> super::iteration::EdgesIter<'_> {
        super::iteration::EdgesIter::new(&self.edges)
    }

    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|v| v.len()).sum()
    }

    /// Deterministic topological ordering of all nodes referenced by edges,
    /// `Start` first and `End` last, ties broken lexicographically.
    #[must_use]
    pub fn topological_sort(&self) -> Vec<NodeId> {
        super::iteration::topological_sort(&self.edges)
    }

    #[cfg(feature = "petgraph-compat")]
    #[must_use]
    pub fn to_petgraph(&self) -> super::petgraph_compat::PetgraphConversion {
        super::petgraph_compat::to_petgraph(&self.edges)
    }

    #[cfg(feature = "petgraph-compat")]
    #[must_use]
    pub fn to_dot(&self) -> String {
        super::petgraph_compat::to_dot(&self.edges)
    }

    #[cfg(feature = "petgraph-compat")]
    #[must_use]
    pub fn is_cyclic_petgraph(&self) -> bool {
        super::petgraph_compat::is_cyclic(&self.edges)
    }

    pub(super) fn nodes_ref(&self) -> &FxHashMap<NodeId, Arc<dyn Node<S, D>>> {
        &self.nodes
    }

    pub(super) fn edges_ref(&self) -> &FxHashMap<NodeId, Vec<NodeId>> {
        &self.edges
    }

    pub(super) fn conditional_edges_ref(&self) -> &Vec<ConditionalEdge<S>> {
        &self.conditional_edges
    }
}
