//! The pending work for one step: a set of `(node_id, order_key)` pairs
//! admitted together and dispatched in parallel, subject to bounded
//! concurrency (§4.1 steps 2-3).

use crate::checkpoint::FrontierItem;
use crate::types::{NodeId, OrderKey};

/// One admitted unit of work for the current step. `parent_path` carries
/// every ancestor node id from `Start` to (but not including) `node_id`
/// itself, in traversal order, so `order_key` stays reproducible when the
/// same node is reached twice via different routes (§4.3 ordering).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub node_id: NodeId,
    pub order_key: OrderKey,
    pub parent_path: Vec<NodeId>,
}

impl WorkItem {
    pub fn new(node_id: NodeId, order_key: OrderKey, parent_path: Vec<NodeId>) -> Self {
        Self {
            node_id,
            order_key,
            parent_path,
        }
    }
}

impl From<FrontierItem> for WorkItem {
    fn from(item: FrontierItem) -> Self {
        WorkItem {
            node_id: item.node_id,
            order_key: item.order_key,
            parent_path: item.parent_path,
        }
    }
}

impl PartialOrd for WorkItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WorkItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order_key.cmp(&other.order_key)
    }
}
