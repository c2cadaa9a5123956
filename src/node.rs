//! Node execution framework.
//!
//! A node is a value exposing a pure(ish) compute operation over a snapshot
//! of the run's state plus an execution context, returning a partial delta
//! and a routing decision (§3 "Node", "NodeResult").

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use miette::Diagnostic;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::checkpoint::{RecordedIo, RecordedIoStore};
use crate::event_bus::{Event, EventEmitter};
use crate::route::Next;
use crate::types::{Attempt, NodeId, OrderKey, RunId, StepId};

/// Core trait defining executable workflow nodes, generic over the run's
/// state type `S` and delta type `D`.
///
/// # Design Principles
///
/// - **Stateless**: nodes should be deterministic given `(snapshot, ctx)`.
/// - **Focused**: each node has a single responsibility.
/// - **Observable**: use the context to emit events for monitoring.
///
/// Nodes declaring recordable side effects (`policy().recordable == true`)
/// must consult `ctx.replay` before performing external IO; see
/// [`crate::checkpoint::replay`].
#[async_trait]
pub trait Node<S, D>: Send + Sync
where
    S: Send + Sync,
    D: Send + Sync,
{
    /// Execute this node against a snapshot of the current state.
    async fn run(&self, snapshot: S, ctx: NodeContext) -> Result<NodeOutcome<D>, NodeError>;

    /// Retry/timeout/recordability policy for this node. Defaults to a
    /// single-attempt, non-recordable policy with no timeout override.
    fn policy(&self) -> NodePolicy {
        NodePolicy::default()
    }
}

/// Outcome of a single node invocation: the delta to merge, the routing
/// decision, and any events to emit transactionally with the step commit.
#[derive(Debug)]
pub struct NodeOutcome<D> {
    pub delta: D,
    pub route: Next,
    pub events: Vec<Event>,
    /// Estimated USD cost this invocation incurred (model calls, paid APIs,
    /// ...), consulted by an engine-level `CostTracker`. Zero for nodes that
    /// never set it.
    pub cost_usd: f64,
}

impl<D> NodeOutcome<D> {
    pub fn new(delta: D) -> Self {
        Self {
            delta,
            route: Next::Unspecified,
            events: Vec::new(),
            cost_usd: 0.0,
        }
    }

    #[must_use]
    pub fn with_route(mut self, route: Next) -> Self {
        self.route = route;
        self
    }

    #[must_use]
    pub fn with_events(mut self, events: Vec<Event>) -> Self {
        self.events = events;
        self
    }

    #[must_use]
    pub fn with_cost_usd(mut self, cost_usd: f64) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Per-node policy: retry budget, backoff shape, timeout, and side-effect
/// declarations (§3 "Node", §4.1 step 4).
#[derive(Clone)]
pub struct NodePolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub backoff_factor: f64,
    pub jitter_fraction: f64,
    pub timeout: Option<Duration>,
    pub recordable: bool,
    pub requires_idempotency: bool,
    retryable: Arc<dyn Fn(&NodeError) -> bool + Send + Sync>,
}

impl std::fmt::Debug for NodePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodePolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_backoff", &self.base_backoff)
            .field("backoff_factor", &self.backoff_factor)
            .field("jitter_fraction", &self.jitter_fraction)
            .field("timeout", &self.timeout)
            .field("recordable", &self.recordable)
            .field("requires_idempotency", &self.requires_idempotency)
            .finish_non_exhaustive()
    }
}

impl Default for NodePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::from_millis(100),
            backoff_factor: 2.0,
            jitter_fraction: 0.1,
            timeout: None,
            recordable: false,
            requires_idempotency: false,
            retryable: Arc::new(|_| false),
        }
    }
}

impl NodePolicy {
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, factor: f64) -> Self {
        self.base_backoff = base;
        self.backoff_factor = factor;
        self
    }

    #[must_use]
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn recordable(mut self) -> Self {
        self.recordable = true;
        self
    }

    #[must_use]
    pub fn requires_idempotency(mut self) -> Self {
        self.requires_idempotency = true;
        self
    }

    #[must_use]
    pub fn retryable_when(mut self, predicate: impl Fn(&NodeError) -> bool + Send + Sync + 'static) -> Self {
        self.retryable = Arc::new(predicate);
        self
    }

    /// Backoff duration for the given attempt (1-indexed), before jitter.
    pub fn base_delay_for_attempt(&self, attempt: Attempt) -> Duration {
        let exponent = attempt.0.saturating_sub(1) as i32;
        let factor = self.backoff_factor.powi(exponent);
        Duration::from_secs_f64(self.base_backoff.as_secs_f64() * factor)
    }

    pub fn is_retryable(&self, error: &NodeError) -> bool {
        (self.retryable)(error)
    }
}

/// Execution context passed to a node invocation. One instance is built per
/// work item, carrying an independent RNG sub-stream (see
/// [`crate::rng::derive_item_seed`]) so concurrent items never contend on
/// shared mutable randomness.
pub struct NodeContext {
    pub run_id: RunId,
    pub node_id: NodeId,
    pub step: StepId,
    pub order_key: OrderKey,
    pub attempt: Attempt,
    pub rng: ChaCha8Rng,
    pub replay_mode: bool,
    pub strict_replay: bool,
    recorded_io: Option<Arc<RecordedIoStore>>,
    event_emitter: Arc<dyn EventEmitter>,
}

impl NodeContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        node_id: NodeId,
        step: StepId,
        order_key: OrderKey,
        attempt: Attempt,
        rng: ChaCha8Rng,
        replay_mode: bool,
        strict_replay: bool,
        recorded_io: Option<Arc<RecordedIoStore>>,
        event_emitter: Arc<dyn EventEmitter>,
    ) -> Self {
        Self {
            run_id,
            node_id,
            step,
            order_key,
            attempt,
            rng,
            replay_mode,
            strict_replay,
            recorded_io,
            event_emitter,
        }
    }

    /// Emit a node-scoped event enriched with this context's identity.
    pub fn emit(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        let event = Event::node_message_with_meta(
            self.node_id.to_string(),
            self.step.0,
            scope,
            message,
        );
        self.event_emitter
            .emit(event)
            .map_err(|_| NodeContextError::EventBusUnavailable)
    }

    pub fn emit_diagnostic(
        &self,
        scope: impl Into<String>,
        message: impl Into<String>,
    ) -> Result<(), NodeContextError> {
        self.event_emitter
            .emit(Event::diagnostic(scope, message))
            .map_err(|_| NodeContextError::EventBusUnavailable)
    }

    /// Looks up a previously recorded response for `request_hash` under this
    /// node/step/attempt. Recordable nodes should call this when
    /// `replay_mode` is set, before performing the real side effect, and
    /// return [`NodeError::ReplayMismatch`] on a miss when `strict_replay` is
    /// also set.
    pub fn lookup_recorded(&self, request_hash: &str) -> Option<RecordedIo> {
        self.recorded_io
            .as_ref()?
            .lookup(&self.node_id, self.step, self.attempt, request_hash)
    }

    /// Persists a request/response pair for future replay. A no-op if the
    /// engine wasn't configured with a recorded IO store.
    pub fn record_io(&self, entry: RecordedIo) {
        if let Some(store) = &self.recorded_io {
            store.record(entry);
        }
    }
}

/// Errors that can occur when using [`NodeContext`] methods.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeContextError {
    #[error("failed to emit event: event bus unavailable")]
    #[diagnostic(
        code(stepwright::node::event_bus_unavailable),
        help("the event bus may be disconnected or at capacity")
    )]
    EventBusUnavailable,
}

/// Errors a node's compute step can return. Whether an error is retried is
/// decided by the node's [`NodePolicy::is_retryable`], not by this type.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(stepwright::node::missing_input),
        help("check that the previous node produced the required data: {what}")
    )]
    MissingInput { what: &'static str },

    #[error("provider error ({provider}): {message}")]
    #[diagnostic(code(stepwright::node::provider))]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error(transparent)]
    #[diagnostic(code(stepwright::node::serde_json))]
    Serde(#[from] serde_json::Error),

    #[error("validation failed: {0}")]
    #[diagnostic(code(stepwright::node::validation))]
    ValidationFailed(String),

    #[error("event bus error: {0}")]
    #[diagnostic(code(stepwright::node::event_bus))]
    EventBus(#[from] NodeContextError),

    #[error("replay mismatch: no recorded IO entry for request hash {request_hash}")]
    #[diagnostic(
        code(stepwright::node::replay_mismatch),
        help("this node declared itself recordable but strict replay found no matching entry")
    )]
    ReplayMismatch { request_hash: String },

    #[error("node timed out")]
    #[diagnostic(code(stepwright::node::timeout))]
    Timeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_by_factor_per_attempt() {
        let policy = NodePolicy::default().with_backoff(Duration::from_millis(100), 2.0);
        assert_eq!(policy.base_delay_for_attempt(Attempt(1)), Duration::from_millis(100));
        assert_eq!(policy.base_delay_for_attempt(Attempt(2)), Duration::from_millis(200));
        assert_eq!(policy.base_delay_for_attempt(Attempt(3)), Duration::from_millis(400));
    }

    #[test]
    fn retryable_predicate_is_consulted() {
        let policy = NodePolicy::default().retryable_when(|e| matches!(e, NodeError::Timeout));
        assert!(policy.is_retryable(&NodeError::Timeout));
        assert!(!policy.is_retryable(&NodeError::ValidationFailed("x".into())));
    }
}
