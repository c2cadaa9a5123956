//! Deterministic, concurrent, resumable execution core for graph-shaped
//! workflows.
//!
//! A run walks a user-defined DAG of async nodes to completion. Each step
//! admits a frontier of ready nodes, dispatches them concurrently under a
//! bounded semaphore, retries failed nodes per their own policy, and folds
//! every outcome into the next state in strict `order_key` order so the same
//! run produces the same state regardless of how the nodes happened to
//! interleave. Steps checkpoint as they commit, so a crashed run resumes from
//! its last committed step rather than restarting.
//!
//! ## Core Concepts
//!
//! - [`engine`] - the run-level driver: admit, step, checkpoint, resume
//! - [`node`] - the `Node` trait, retry/backoff policy, and per-node context
//! - [`graphs`] - graph construction, validation, and compilation
//! - [`scheduler`] - the concurrent step loop: dispatch, retry, merge, route
//! - [`reducers`] - how concurrent node deltas fold into one state
//! - [`checkpoint`] - the checkpoint record and its storage trait
//! - [`route`] - routing decisions a node can return (`Goto`, `Many`, `Stop`)
//! - [`hashing`] - `order_key` and idempotency key derivation
//! - [`rng`] - seeded, per-step and per-item deterministic randomness
//! - [`error`] - the top-level `EngineError` wrapping every subsystem error
//! - [`event_bus`] - event fan-out to sinks (stdout, channels, files, ...)
//! - [`metrics`] - a narrow sink trait for wiring into an external metrics stack
//!
//! ## Quick Start
//!
//! ```
//! use async_trait::async_trait;
//! use stepwright::graphs::GraphBuilder;
//! use stepwright::node::{Node, NodeContext, NodeOutcome};
//! use stepwright::reducers::{FnReducer, ReducerError};
//! use stepwright::route::Next;
//! use stepwright::types::NodeId;
//!
//! #[derive(Clone, Default)]
//! struct Counter(i64);
//!
//! struct Increment;
//!
//! #[async_trait]
//! impl Node<Counter, i64> for Increment {
//!     async fn run(
//!         &self,
//!         _snapshot: Counter,
//!         _ctx: NodeContext,
//!     ) -> Result<NodeOutcome<i64>, stepwright::node::NodeError> {
//!         Ok(NodeOutcome::new(1).with_route(Next::Stop))
//!     }
//! }
//!
//! let graph = GraphBuilder::<Counter, i64>::new()
//!     .add_node(NodeId::custom("increment"), Increment)
//!     .add_edge(NodeId::Start, NodeId::custom("increment"))
//!     .add_edge(NodeId::custom("increment"), NodeId::End)
//!     .compile()
//!     .expect("graph compiles");
//!
//! let reducer = FnReducer::new(|prev: &Counter, delta: &i64| -> Result<Counter, ReducerError> {
//!     Ok(Counter(prev.0 + delta))
//! });
//! let _ = (graph, reducer);
//! ```

pub mod checkpoint;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod graphs;
pub mod hashing;
pub mod metrics;
pub mod node;
pub mod reducers;
pub mod rng;
pub mod route;
pub mod scheduler;
pub mod telemetry;
pub mod types;
pub mod utils;
