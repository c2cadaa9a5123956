//! Graph definition and compilation for workflow execution.
//!
//! [`GraphBuilder`] is the fluent entry point for registering nodes and
//! edges; [`GraphBuilder::compile`] validates the topology and produces an
//! immutable [`Graph`] the scheduler drives to completion.
//!
//! - **Nodes**: executable units implementing [`crate::node::Node`]
//! - **Edges**: static successors, evaluated when a node's routing decision
//!   is [`crate::route::Next::Unspecified`]
//! - **Conditional edges**: predicates over the post-merge state that add
//!   extra successors
//! - **Virtual endpoints**: [`crate::types::NodeId::Start`] and
//!   [`crate::types::NodeId::End`]

mod builder;
mod compilation;
mod edges;
mod iteration;

#[cfg(feature = "petgraph-compat")]
mod petgraph_compat;

pub use builder::GraphBuilder;
pub use compilation::{Graph, GraphCompileError};
pub use edges::{ConditionalEdge, EdgePredicate};
pub use iteration::{EdgesIter, NodesIter};

#[cfg(feature = "petgraph-compat")]
pub use petgraph_compat::{NodeIndexMap, PetgraphConversion, WeaveDiGraph, is_cyclic};
