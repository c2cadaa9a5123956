//! Run-wide configuration: step and concurrency bounds, replay toggles, and
//! the metrics/cost sinks a caller wires in (§6 "Configuration").

use std::sync::Arc;
use std::time::Duration;

use crate::metrics::{CostTracker, MetricsSink, NoopCostTracker, NoopMetrics};
use crate::scheduler::{ConflictPolicy, SchedulerConfig};

/// Every bound and toggle an [`Engine`](super::Engine) needs that isn't part
/// of the graph or state types themselves. A `Default` plus fluent `with_*`
/// setters, the same shape runtime-level config structs use elsewhere in
/// this crate.
#[derive(Clone)]
pub struct EngineConfig {
    pub max_steps: u64,
    pub max_concurrent_nodes: usize,
    pub max_per_node_concurrency: Option<usize>,
    /// Depth of the scheduler's bounded admission queue, independent of
    /// `max_concurrent_nodes`: an item holds its queue slot for as long as
    /// it is admitted into a step (queued or executing), while
    /// `max_concurrent_nodes` separately bounds how many admitted items may
    /// be actively invoking their node body at once.
    pub queue_depth: usize,
    pub default_node_timeout: Option<Duration>,
    pub run_wall_clock_budget: Option<Duration>,
    pub backpressure_timeout: Duration,
    pub replay_mode: bool,
    pub strict_replay: bool,
    pub conflict_policy: ConflictPolicy,
    pub metrics: Arc<dyn MetricsSink>,
    pub cost_tracker: Arc<dyn CostTracker>,
}

impl std::fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineConfig")
            .field("max_steps", &self.max_steps)
            .field("max_concurrent_nodes", &self.max_concurrent_nodes)
            .field("max_per_node_concurrency", &self.max_per_node_concurrency)
            .field("queue_depth", &self.queue_depth)
            .field("default_node_timeout", &self.default_node_timeout)
            .field("run_wall_clock_budget", &self.run_wall_clock_budget)
            .field("backpressure_timeout", &self.backpressure_timeout)
            .field("replay_mode", &self.replay_mode)
            .field("strict_replay", &self.strict_replay)
            .field("conflict_policy", &self.conflict_policy)
            .finish_non_exhaustive()
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 10_000,
            max_concurrent_nodes: 64,
            max_per_node_concurrency: None,
            queue_depth: 1024,
            default_node_timeout: None,
            run_wall_clock_budget: None,
            backpressure_timeout: Duration::from_secs(30),
            replay_mode: false,
            strict_replay: false,
            conflict_policy: ConflictPolicy::LastWriteWins,
            metrics: Arc::new(NoopMetrics),
            cost_tracker: Arc::new(NoopCostTracker),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps.max(1);
        self
    }

    #[must_use]
    pub fn with_max_concurrent_nodes(mut self, max_concurrent_nodes: usize) -> Self {
        self.max_concurrent_nodes = max_concurrent_nodes.max(1);
        self
    }

    #[must_use]
    pub fn with_max_per_node_concurrency(mut self, max_per_node_concurrency: usize) -> Self {
        self.max_per_node_concurrency = Some(max_per_node_concurrency.max(1));
        self
    }

    #[must_use]
    pub fn with_queue_depth(mut self, queue_depth: usize) -> Self {
        self.queue_depth = queue_depth.max(1);
        self
    }

    #[must_use]
    pub fn with_default_node_timeout(mut self, timeout: Duration) -> Self {
        self.default_node_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_run_wall_clock_budget(mut self, budget: Duration) -> Self {
        self.run_wall_clock_budget = Some(budget);
        self
    }

    #[must_use]
    pub fn with_backpressure_timeout(mut self, timeout: Duration) -> Self {
        self.backpressure_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_replay_mode(mut self, replay_mode: bool) -> Self {
        self.replay_mode = replay_mode;
        self
    }

    #[must_use]
    pub fn with_strict_replay(mut self, strict_replay: bool) -> Self {
        self.strict_replay = strict_replay;
        self
    }

    #[must_use]
    pub fn with_conflict_policy(mut self, conflict_policy: ConflictPolicy) -> Self {
        self.conflict_policy = conflict_policy;
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_cost_tracker(mut self, cost_tracker: Arc<dyn CostTracker>) -> Self {
        self.cost_tracker = cost_tracker;
        self
    }

    /// Projects the subset of this config the scheduler cares about. Fields
    /// the scheduler doesn't model (`max_steps`, `run_wall_clock_budget`,
    /// the metrics/cost sinks) stay with the engine.
    pub(crate) fn scheduler_config(&self) -> SchedulerConfig {
        let mut config = SchedulerConfig {
            max_concurrency: self.max_concurrent_nodes,
            queue_depth: self.queue_depth,
            backpressure_timeout: self.backpressure_timeout,
            conflict_policy: self.conflict_policy,
            replay_mode: self.replay_mode,
            strict_replay: self.strict_replay,
            default_node_timeout: self.default_node_timeout,
            ..SchedulerConfig::default()
        };
        if let Some(per_node) = self.max_per_node_concurrency {
            config.per_node_concurrency = per_node;
        }
        config
    }
}
