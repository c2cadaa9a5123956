//! Edge types and routing predicates for conditional graph flow.

use std::sync::Arc;

use crate::types::NodeId;

/// Predicate function for conditional edge routing, generic over the run's
/// state type `S`. Takes a reference to the post-merge state snapshot and
/// returns the target node ids to route to; an empty vec means "no match,
/// fall through to static edges" (§4.1 step 7, §3 "Edge").
pub type EdgePredicate<S> = Arc<dyn Fn(&S) -> Vec<NodeId> + Send + Sync + 'static>;

/// A conditional edge: when execution reaches `from`, `predicate` is
/// evaluated against the state and its return value becomes the additional
/// targets for that step, in predicate order (edge_index assigned
/// accordingly).
#[derive(Clone)]
pub struct ConditionalEdge<S> {
    pub from: NodeId,
    pub predicate: EdgePredicate<S>,
}

impl<S> ConditionalEdge<S> {
    pub fn new(from: NodeId, predicate: EdgePredicate<S>) -> Self {
        Self { from, predicate }
    }
}
