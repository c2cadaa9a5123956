//! Core identifier and ordering types shared across the engine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a node within a graph. Wraps an owned string so graphs can be
/// cloned cheaply via `Arc<str>`-backed node maps without re-allocating keys
/// on every lookup.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// Virtual entry point. Never registered as an executable node; exists
    /// only so graphs have a single, unambiguous starting edge set.
    Start,
    /// Virtual exit point. Never executed; routes into it simply end the
    /// branch.
    End,
    /// A user-registered node.
    Custom(String),
}

impl NodeId {
    pub fn custom(id: impl Into<String>) -> Self {
        NodeId::Custom(id.into())
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, NodeId::Start | NodeId::End)
    }

    pub fn as_str(&self) -> &str {
        match self {
            NodeId::Start => "__start__",
            NodeId::End => "__end__",
            NodeId::Custom(s) => s,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for NodeId {
    fn from(value: &str) -> Self {
        match value {
            "__start__" => NodeId::Start,
            "__end__" => NodeId::End,
            other => NodeId::Custom(other.to_string()),
        }
    }
}

/// Monotonic step counter for a run. Step `0` is the initial admission of the
/// start frontier; step `k+1` is never begun until step `k` is durably
/// committed (§5 ordering guarantees).
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StepId(pub u64);

impl StepId {
    pub fn next(self) -> StepId {
        StepId(self.0 + 1)
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Attempt counter for a single work item, starting at `1`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Attempt(pub u32);

impl Attempt {
    pub const FIRST: Attempt = Attempt(1);

    pub fn next(self) -> Attempt {
        Attempt(self.0 + 1)
    }
}

impl fmt::Display for Attempt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deterministic total-order key assigned to every work item, derived from
/// `H(parent_path ‖ node_id ‖ edge_index)` (see [`crate::hashing::order_key`]).
/// Stored as the low 128 bits of a SHA-256 digest: cheap to compare, cheap to
/// serialize, and collision-resistant far beyond any realistic frontier size.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OrderKey(pub u128);

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Free-form identifier for a run, supplied by the caller or generated.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RunId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        RunId(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        RunId(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_display_round_trips_custom() {
        let id = NodeId::custom("ingest");
        assert_eq!(id.as_str(), "ingest");
        assert_eq!(NodeId::from("ingest"), id);
    }

    #[test]
    fn step_and_attempt_increment() {
        assert_eq!(StepId(0).next(), StepId(1));
        assert_eq!(Attempt::FIRST.next(), Attempt(2));
    }

    #[test]
    fn order_key_orders_numerically_not_lexically() {
        let a = OrderKey(9);
        let b = OrderKey(10);
        assert!(a < b);
    }
}
