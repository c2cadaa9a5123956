//! Graph iteration utilities and algorithms.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::node::Node;
use crate::types::NodeId;

/// Iterator over registered (non-virtual) node ids in a graph.
pub struct NodesIter<'a, S, D> {
    inner: std::collections::hash_map::Keys<'a, NodeId, Arc<dyn Node<S, D>>>,
    _marker: PhantomData<(S, D)>,
}

impl<'a, S, D> NodesIter<'a, S, D> {
    pub(super) fn new(
        inner: std::collections::hash_map::Keys<'a, NodeId, Arc<dyn Node<S, D>>>,
    ) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }
}

impl<'a, S, D> Iterator for NodesIter<'a, S, D> {
    type Item = &'a NodeId;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a, S, D> ExactSizeIterator for NodesIter<'a, S, D> {}

/// Iterator over edges as `(source, target)` pairs. Iteration order follows
/// hash map order, not topological order; use [`topological_sort`] for that.
pub struct EdgesIter<'a> {
    outer: std::collections::hash_map::Iter<'a, NodeId, Vec<NodeId>>,
    current_from: Option<&'a NodeId>,
    current_targets: std::slice::Iter<'a, NodeId>,
}

impl<'a> EdgesIter<'a> {
    pub(super) fn new(edges: &'a FxHashMap<NodeId, Vec<NodeId>>) -> Self {
        let mut outer = edges.iter();
        let (current_from, current_targets) = match outer.next() {
            Some((from, targets)) => (Some(from), targets.iter()),
            None => (None, [].iter()),
        };
        Self {
            outer,
            current_from,
            current_targets,
        }
    }
}

impl<'a> Iterator for EdgesIter<'a> {
    type Item = (&'a NodeId, &'a NodeId);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(to) = self.current_targets.next() {
                return Some((self.current_from.unwrap(), to));
            }
            match self.outer.next() {
                Some((from, targets)) => {
                    self.current_from = Some(from);
                    self.current_targets = targets.iter();
                }
                None => return None,
            }
        }
    }
}

fn order_rank(id: &NodeId) -> (u8, &str) {
    match id {
        NodeId::Start => (0, ""),
        NodeId::Custom(name) => (1, name.as_str()),
        NodeId::End => (2, ""),
    }
}

/// Kahn's algorithm, `Start` first and `End` last, ties broken
/// lexicographically for deterministic ordering across runs (§5).
pub(super) fn topological_sort(edges: &FxHashMap<NodeId, Vec<NodeId>>) -> Vec<NodeId> {
    let mut in_degree: FxHashMap<NodeId, usize> = FxHashMap::default();
    let mut all_nodes: FxHashSet<NodeId> = FxHashSet::default();

    for (from, tos) in edges {
        all_nodes.insert(from.clone());
        in_degree.entry(from.clone()).or_insert(0);
        for to in tos {
            all_nodes.insert(to.clone());
            *in_degree.entry(to.clone()).or_insert(0) += 1;
        }
    }

    let mut queue: VecDeque<NodeId> = VecDeque::new();
    let mut zero_in_degree: Vec<_> = in_degree
        .iter()
        .filter(|entry| *entry.1 == 0)
        .map(|(node, _)| node.clone())
        .collect();
    zero_in_degree.sort_by(|a, b| order_rank(a).cmp(&order_rank(b)));
    queue.extend(zero_in_degree);

    let mut result: Vec<NodeId> = Vec::with_capacity(all_nodes.len());

    while let Some(node) = queue.pop_front() {
        result.push(node.clone());

        if let Some(neighbors) = edges.get(&node) {
            let mut new_zero: Vec<NodeId> = Vec::new();
            for neighbor in neighbors {
                if let Some(deg) = in_degree.get_mut(neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        new_zero.push(neighbor.clone());
                    }
                }
            }
            new_zero.sort_by(|a, b| order_rank(a).cmp(&order_rank(b)));
            queue.extend(new_zero);
        }
    }

    result
}
