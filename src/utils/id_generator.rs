//! Run and correlation id generation.
//!
//! The engine needs a run id before a graph executes a single node (it is
//! threaded through every [`NodeContext`](crate::node::NodeContext) and
//! checkpoint), so id minting is pulled out of the engine config into its own
//! small generator rather than inlined at the call site.

use uuid::Uuid;

/// Mints opaque, collision-resistant ids. Stateless; safe to share across
/// threads or construct fresh per call.
#[derive(Clone, Copy, Debug, Default)]
pub struct IdGenerator;

impl IdGenerator {
    pub fn new() -> Self {
        Self
    }

    /// A fresh run id, e.g. `run-3fb6a9c2c3a4471a9e6f6b2e2e6b9b31`.
    pub fn generate_run_id(&self) -> String {
        format!("run-{}", Uuid::new_v4().simple())
    }

    /// A fresh id for a one-off correlation need (tool calls, span ids) that
    /// isn't a run id but still wants the same opaque, sortable-by-creation
    /// shape.
    pub fn generate_id(&self, prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }
}
