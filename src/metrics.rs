//! Metrics surface: a narrow trait so callers can wire the engine into
//! whatever metrics stack they already run, without this crate depending on
//! one (§6 "Metrics").

use crate::types::NodeId;

/// Gauge: nodes currently executing (permit held, invocation in flight).
pub const INFLIGHT_NODES: &str = "inflight_nodes";
/// Gauge: current occupancy of the bounded admission queue.
pub const QUEUE_DEPTH: &str = "queue_depth";
/// Histogram: wall-clock latency of one committed step, in milliseconds.
pub const STEP_LATENCY_MS: &str = "step_latency_ms";
/// Counter: node invocations that were retried after a retryable failure.
pub const RETRIES_TOTAL: &str = "retries_total";
/// Counter: reducer-reported merge conflicts under `ConflictPolicy::Fail`.
pub const MERGE_CONFLICTS_TOTAL: &str = "merge_conflicts_total";
/// Counter: admissions that had to wait for a free slot before proceeding.
pub const BACKPRESSURE_EVENTS_TOTAL: &str = "backpressure_events_total";

/// One method per metric shape: a point-in-time [`set_gauge`](MetricsSink::set_gauge),
/// a distribution sample via [`record_histogram`](MetricsSink::record_histogram),
/// and a monotonic [`increment_counter`](MetricsSink::increment_counter). Every
/// method defaults to a no-op so a caller only wires up what they actually
/// collect, matching [`NoopMetrics`] (§6 "Metrics").
pub trait MetricsSink: Send + Sync {
    fn set_gauge(&self, name: &'static str, value: f64) {
        let _ = (name, value);
    }

    fn record_histogram(&self, name: &'static str, value: f64) {
        let _ = (name, value);
    }

    fn increment_counter(&self, name: &'static str) {
        let _ = name;
    }
}

/// Default [`MetricsSink`]: every call is a no-op.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {}

/// Narrow sink for per-node cost accounting (token usage billed as USD,
/// paid API calls, ...), kept separate from [`MetricsSink`] since not every
/// caller that wants step/node timing also wants cost accounting wired to
/// the same backend (§6 "CostTracker").
pub trait CostTracker: Send + Sync {
    fn record(&self, node_id: &NodeId, step: u64, usd: f64) {
        let _ = (node_id, step, usd);
    }

    /// Running total across the whole run, if the implementation tracks one.
    /// Returns `None` when the sink doesn't keep a total (e.g. it forwards
    /// straight to an external billing system).
    fn total_usd(&self) -> Option<f64> {
        None
    }
}

/// Default [`CostTracker`]: every call is a no-op, `total_usd` is `None`.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopCostTracker;

impl CostTracker for NoopCostTracker {}
