//! A node's routing decision, combined with a graph's static edges to
//! compute the next frontier (§4.1 step 7).

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// What a node's compute step decided about where execution should go next.
/// `Unspecified` falls through to the graph's static edges, evaluating each
/// edge's predicate (if any) against the post-merge state.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum Next {
    /// Route to a single successor, as if the only matching static edge had
    /// `edge_index = 0`.
    Goto(NodeId),
    /// Fan out to multiple successors in the given order; each receives an
    /// increasing `edge_index` starting at 0.
    Many(Vec<NodeId>),
    /// Terminal for this branch; contributes no successors regardless of any
    /// static edges leaving the node.
    Stop,
    /// No explicit routing decision; defer to the graph's static edges.
    #[default]
    Unspecified,
}

impl Next {
    pub fn goto(id: impl Into<NodeId>) -> Self {
        Next::Goto(id.into())
    }

    pub fn many(ids: impl IntoIterator<Item = NodeId>) -> Self {
        Next::Many(ids.into_iter().collect())
    }
}
