//! The concurrent step scheduler: admits a frontier, dispatches nodes with
//! bounded concurrency in `order_key` order, retries per node policy, and
//! folds the results into the next committed step (§4.1).

mod frontier;
mod retry;

pub use frontier::WorkItem;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};

use crate::checkpoint::{FrontierItem, RecordedIoStore};
use crate::event_bus::{emit_lifecycle, Event, EventEmitter, LifecycleEvent, LifecycleKind};
use crate::graphs::Graph;
use crate::hashing::order_key;
use crate::metrics::{
    MetricsSink, BACKPRESSURE_EVENTS_TOTAL, INFLIGHT_NODES, MERGE_CONFLICTS_TOTAL, QUEUE_DEPTH,
    RETRIES_TOTAL,
};
use crate::node::{NodeContext, NodeError, NodeOutcome};
use crate::reducers::{Reducer, ReducerError};
use crate::rng::{derive_item_seed, step_rng, RngSeed};
use crate::route::Next;
use crate::types::{Attempt, NodeId, OrderKey, RunId, StepId};

/// Tokio's semaphore panics if asked for more permits than this; used as the
/// sentinel meaning "no per-node cap" without ever constructing one.
const UNBOUNDED_PER_NODE: usize = usize::MAX;

/// Sentinel meaning "no separate admission queue gate": every admitted item
/// is bounded only by `max_concurrency`/`per_node_concurrency`.
const UNBOUNDED_QUEUE_DEPTH: usize = usize::MAX;

/// Bounds on a single step's execution: overall and per-node concurrency,
/// the backpressure timeout before `Backpressure` is raised, and how
/// conflicting writes within a step are resolved (§6, §9 "Conflict
/// handling").
#[derive(Clone, Debug)]
pub struct SchedulerConfig {
    pub max_concurrency: usize,
    pub per_node_concurrency: usize,
    /// Depth of the bounded admission queue gating entry into a step,
    /// independent of `max_concurrency`. An item holds its queue slot for
    /// as long as it is admitted (queued or executing); `max_concurrency`
    /// separately bounds how many of those admitted items may be actively
    /// invoking their node body at once. `UNBOUNDED_QUEUE_DEPTH` disables
    /// the gate (§6 "Backpressure").
    pub queue_depth: usize,
    pub backpressure_timeout: Duration,
    pub conflict_policy: ConflictPolicy,
    /// Whether nodes should consult recorded IO before performing side
    /// effects (`NodeContext::lookup_recorded`). Set once per run, not
    /// per-step.
    pub replay_mode: bool,
    /// Under replay, whether a recorded-IO miss is a hard error
    /// (`NodeError::ReplayMismatch`) or left to the node to decide.
    pub strict_replay: bool,
    /// Deadline applied to a node invocation when its own
    /// [`NodePolicy::timeout`](crate::node::NodePolicy) is unset.
    pub default_node_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 64,
            per_node_concurrency: UNBOUNDED_PER_NODE,
            queue_depth: UNBOUNDED_QUEUE_DEPTH,
            backpressure_timeout: Duration::from_secs(30),
            conflict_policy: ConflictPolicy::LastWriteWins,
            replay_mode: false,
            strict_replay: false,
            default_node_timeout: None,
        }
    }
}

/// How to resolve two deltas in the same step writing to the same logical
/// field.
///
/// The scheduler folds deltas in ascending `order_key` order and never
/// inspects `D`'s structure, so it cannot itself detect an overlap between
/// two deltas; that is inherently data-dependent and belongs to the
/// [`Reducer`](crate::reducers::Reducer) implementation. `LastWriteWins`
/// describes a reducer that always accepts the later delta; `Fail` describes
/// one that returns `ReducerError::Conflict` when it notices an overlap,
/// which the scheduler then surfaces as `SchedulerError::Reducer` and aborts
/// the step. The field on [`SchedulerConfig`] documents which contract the
/// configured reducer is expected to honor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Later writes (by `order_key`) win; the reducer never rejects an
    /// overlap.
    LastWriteWins,
    /// The reducer rejects overlapping writes with `ReducerError::Conflict`
    /// instead of guessing.
    Fail,
}

/// Everything the scheduler produced by successfully committing one step.
pub struct StepOutcome<S> {
    pub state: S,
    pub frontier: Vec<FrontierItem>,
    pub rng_seed: RngSeed,
    pub events: Vec<Event>,
    pub ran: Vec<NodeId>,
    pub idempotency_key: String,
    /// Per-node cost reported via `NodeOutcome::cost_usd`, in commit order.
    pub costs: Vec<(NodeId, f64)>,
}

#[derive(Debug, Error, Diagnostic)]
pub enum SchedulerError {
    #[error("node {node_id} failed: {source}")]
    #[diagnostic(code(stepwright::scheduler::node_failed))]
    NodeFailed {
        node_id: NodeId,
        #[source]
        source: NodeError,
    },

    #[error("node {node_id} exceeded its retry budget ({max_attempts} attempts)")]
    #[diagnostic(code(stepwright::scheduler::max_attempts_exceeded))]
    MaxAttemptsExceeded {
        node_id: NodeId,
        max_attempts: u32,
        #[source]
        source: NodeError,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reducer(#[from] ReducerError),

    #[error("no progress: frontier had {pending} pending item(s) but none were runnable")]
    #[diagnostic(code(stepwright::scheduler::no_progress))]
    NoProgress { pending: usize },

    #[error("backpressure: admission blocked for {waited_ms}ms exceeding the configured timeout")]
    #[diagnostic(code(stepwright::scheduler::backpressure))]
    Backpressure { waited_ms: u64 },

    #[error("run was cancelled")]
    #[diagnostic(code(stepwright::scheduler::cancelled))]
    Cancelled,

    #[error("failed to hash state for idempotency key: {0}")]
    #[diagnostic(code(stepwright::scheduler::state_hash))]
    StateHash(#[from] serde_json::Error),

    #[error("routing produced unknown node id {node_id}")]
    #[diagnostic(
        code(stepwright::scheduler::unknown_node),
        help("a conditional edge predicate returned a node id that was never registered with the graph builder")
    )]
    UnknownNode { node_id: NodeId },
}

/// Drives a single step of a run: dispatch, retry, merge, and routing. One
/// instance is reused across the whole run; it is cheap (no per-step
/// allocation beyond what the step itself needs).
pub struct Scheduler<S, D>
where
    S: Clone + Send + Sync + serde::Serialize + 'static,
    D: Send + Sync + 'static,
{
    graph: Arc<Graph<S, D>>,
    reducer: Arc<dyn Reducer<S, D>>,
    emitter: Arc<dyn EventEmitter>,
    config: SchedulerConfig,
    recorded_io: Option<Arc<RecordedIoStore>>,
    metrics: Arc<dyn MetricsSink>,
    /// One semaphore per node id, shared across steps so a node that
    /// recurs across the run (fan-in, cycles) is capped in aggregate, not
    /// just within a single step's dispatch. Absent entirely when
    /// `per_node_concurrency` is the unbounded sentinel.
    per_node: Option<FxHashMap<NodeId, Arc<Semaphore>>>,
}

impl<S, D> Scheduler<S, D>
where
    S: Clone + Send + Sync + serde::Serialize + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        graph: Arc<Graph<S, D>>,
        reducer: Arc<dyn Reducer<S, D>>,
        emitter: Arc<dyn EventEmitter>,
        config: SchedulerConfig,
    ) -> Self {
        Self::with_recorded_io(
            graph,
            reducer,
            emitter,
            config,
            Arc::new(crate::metrics::NoopMetrics),
            None,
        )
    }

    /// Like [`Scheduler::new`] but wires a shared [`RecordedIoStore`] into
    /// every node context, enabling replay lookups and recording regardless
    /// of `config.replay_mode` (a node may still choose to record on a
    /// fresh run so a later run can replay it).
    pub fn with_recorded_io(
        graph: Arc<Graph<S, D>>,
        reducer: Arc<dyn Reducer<S, D>>,
        emitter: Arc<dyn EventEmitter>,
        config: SchedulerConfig,
        metrics: Arc<dyn MetricsSink>,
        recorded_io: Option<Arc<RecordedIoStore>>,
    ) -> Self {
        let per_node = if config.per_node_concurrency >= UNBOUNDED_PER_NODE {
            None
        } else {
            let cap = config.per_node_concurrency.max(1);
            Some(
                graph
                    .node_ids()
                    .map(|id| (id.clone(), Arc::new(Semaphore::new(cap))))
                    .collect(),
            )
        };
        Self {
            graph,
            reducer,
            emitter,
            config,
            recorded_io,
            metrics,
            per_node,
        }
    }

    /// Runs every work item in `frontier` to completion (with retry),
    /// applies their deltas to `prev_state` in `order_key` order, computes
    /// the next frontier via routing decisions and static/conditional
    /// edges, and returns the committed [`StepOutcome`].
    #[tracing::instrument(skip(self, prev_state, cancel), fields(step = step_id.0, items = frontier.len()))]
    pub async fn run_step(
        &self,
        run_id: &RunId,
        step_id: StepId,
        prev_state: &S,
        frontier: Vec<WorkItem>,
        cancel: &watch::Receiver<bool>,
    ) -> Result<StepOutcome<S>, SchedulerError> {
        if *cancel.borrow() {
            return Err(SchedulerError::Cancelled);
        }
        if frontier.is_empty() {
            return Err(SchedulerError::NoProgress { pending: 0 });
        }

        emit_lifecycle(
            &self.emitter,
            LifecycleEvent::new(
                run_id.clone(),
                step_id,
                None,
                None,
                None,
                LifecycleKind::StepBegin,
                serde_json::json!({"items": frontier.len()}),
            ),
        );

        let step_seed = crate::rng::derive_step_seed(&run_id.0, step_id.0);
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let queue_semaphore: Option<Arc<Semaphore>> = if self.config.queue_depth >= UNBOUNDED_QUEUE_DEPTH {
            None
        } else {
            Some(Arc::new(Semaphore::new(self.config.queue_depth.max(1))))
        };
        let queue_total = self.config.queue_depth;
        let inflight = Arc::new(AtomicUsize::new(0));

        let tasks = frontier.into_iter().map(|item| {
            let semaphore = Arc::clone(&semaphore);
            let queue_semaphore = queue_semaphore.clone();
            let inflight = Arc::clone(&inflight);
            let metrics = Arc::clone(&self.metrics);
            let per_node_semaphore = self
                .per_node
                .as_ref()
                .and_then(|map| map.get(&item.node_id))
                .cloned();
            let graph = Arc::clone(&self.graph);
            let emitter = Arc::clone(&self.emitter);
            let run_id = run_id.clone();
            let backpressure_timeout = self.config.backpressure_timeout;
            let replay_mode = self.config.replay_mode;
            let strict_replay = self.config.strict_replay;
            let default_node_timeout = self.config.default_node_timeout;
            let recorded_io = self.recorded_io.clone();
            let snapshot = prev_state.clone();
            async move {
                let _queue_permit = match &queue_semaphore {
                    Some(sem) => {
                        let permit = match Arc::clone(sem).try_acquire_owned() {
                            Ok(permit) => permit,
                            Err(_) => {
                                metrics.increment_counter(BACKPRESSURE_EVENTS_TOTAL);
                                emit_lifecycle(
                                    &emitter,
                                    LifecycleEvent::new(
                                        run_id.clone(),
                                        step_id,
                                        Some(item.node_id.clone()),
                                        Some(item.order_key),
                                        None,
                                        LifecycleKind::Backpressure,
                                        serde_json::json!({"gate": "queue_depth"}),
                                    ),
                                );
                                tokio::time::timeout(backpressure_timeout, Arc::clone(sem).acquire_owned())
                                    .await
                                    .map_err(|_| SchedulerError::Backpressure {
                                        waited_ms: backpressure_timeout.as_millis() as u64,
                                    })?
                                    .expect("queue semaphore is never closed while tasks hold references to it")
                            }
                        };
                        metrics.set_gauge(QUEUE_DEPTH, (queue_total - sem.available_permits()) as f64);
                        Some(permit)
                    }
                    None => None,
                };

                let permit = tokio::time::timeout(backpressure_timeout, semaphore.acquire_owned())
                    .await
                    .map_err(|_| SchedulerError::Backpressure {
                        waited_ms: backpressure_timeout.as_millis() as u64,
                    })?
                    .expect("semaphore is never closed while tasks hold references to it");
                let _node_permit = match &per_node_semaphore {
                    Some(sem) => Some(
                        tokio::time::timeout(backpressure_timeout, sem.clone().acquire_owned())
                            .await
                            .map_err(|_| SchedulerError::Backpressure {
                                waited_ms: backpressure_timeout.as_millis() as u64,
                            })?
                            .expect("per-node semaphore is never closed while held"),
                    ),
                    None => None,
                };

                let node = graph
                    .node(&item.node_id)
                    .ok_or_else(|| SchedulerError::UnknownNode {
                        node_id: item.node_id.clone(),
                    })?
                    .clone();

                let inflight_count = inflight.fetch_add(1, Ordering::SeqCst) + 1;
                metrics.set_gauge(INFLIGHT_NODES, inflight_count as f64);
                emit_lifecycle(
                    &emitter,
                    LifecycleEvent::new(
                        run_id.clone(),
                        step_id,
                        Some(item.node_id.clone()),
                        Some(item.order_key),
                        Some(Attempt::FIRST),
                        LifecycleKind::NodeStart,
                        serde_json::Value::Null,
                    ),
                );

                let result = run_with_retries(
                    node.as_ref(),
                    snapshot,
                    &run_id,
                    item.node_id.clone(),
                    step_id,
                    item.order_key,
                    step_seed,
                    replay_mode,
                    strict_replay,
                    default_node_timeout,
                    recorded_io,
                    Arc::clone(&emitter),
                    Arc::clone(&metrics),
                )
                .await;

                let remaining = inflight.fetch_sub(1, Ordering::SeqCst) - 1;
                metrics.set_gauge(INFLIGHT_NODES, remaining as f64);

                let outcome = result.map_err(|failure| match failure.attempts_exhausted {
                    Some(max_attempts) => SchedulerError::MaxAttemptsExceeded {
                        node_id: item.node_id.clone(),
                        max_attempts,
                        source: failure.error,
                    },
                    None => SchedulerError::NodeFailed {
                        node_id: item.node_id.clone(),
                        source: failure.error,
                    },
                })?;

                emit_lifecycle(
                    &emitter,
                    LifecycleEvent::new(
                        run_id.clone(),
                        step_id,
                        Some(item.node_id.clone()),
                        Some(item.order_key),
                        None,
                        LifecycleKind::NodeEnd,
                        serde_json::Value::Null,
                    ),
                );

                drop(permit);
                Ok::<_, SchedulerError>((item, outcome))
            }
        });

        let results = join_all(tasks).await;

        let mut ran = Vec::with_capacity(results.len());
        let mut events = Vec::new();
        let mut order_keys = Vec::with_capacity(results.len());
        let mut ordered: BTreeMap<OrderKey, (NodeId, D, Next, f64, Vec<NodeId>)> = BTreeMap::new();

        for result in results {
            let (item, outcome) = result?;
            order_keys.push(item.order_key);
            ran.push(item.node_id.clone());
            events.extend(outcome.events);
            ordered.insert(
                item.order_key,
                (
                    item.node_id,
                    outcome.delta,
                    outcome.route,
                    outcome.cost_usd,
                    item.parent_path,
                ),
            );
        }

        let mut state = prev_state.clone();
        let mut routes: Vec<RouteDecision> = Vec::with_capacity(ordered.len());
        let mut costs: Vec<(NodeId, f64)> = Vec::with_capacity(ordered.len());
        for (_, (node_id, delta, route, cost_usd, parent_path)) in ordered {
            state = match self.reducer.apply(&state, &delta) {
                Ok(next_state) => next_state,
                Err(error) => {
                    if matches!(error, ReducerError::Conflict { .. }) {
                        self.metrics.increment_counter(MERGE_CONFLICTS_TOTAL);
                    }
                    return Err(error.into());
                }
            };
            let static_targets = self.graph.static_successors(&node_id).to_vec();
            costs.push((node_id.clone(), cost_usd));
            routes.push(RouteDecision {
                parent: node_id,
                parent_path,
                static_targets,
                route,
            });
        }

        let next_frontier = self.compute_next_frontier(Some(run_id), step_id, &routes, &state);

        let prev_hash = crate::hashing::content_hash(prev_state)?;
        let idempotency_key =
            crate::hashing::idempotency_key(&run_id.0, step_id.0, order_keys, &prev_hash);

        emit_lifecycle(
            &self.emitter,
            LifecycleEvent::new(
                run_id.clone(),
                step_id,
                None,
                None,
                None,
                LifecycleKind::StepEnd,
                serde_json::json!({"ran": ran.len()}),
            ),
        );

        Ok(StepOutcome {
            state,
            frontier: next_frontier,
            rng_seed: step_seed,
            events,
            ran,
            idempotency_key,
            costs,
        })
    }

    /// The step-0 frontier: every successor reachable from `NodeId::Start`
    /// via its static and conditional edges, exactly as if `Start` were a
    /// node that had just run with `Next::Unspecified` (§3 "Lifecycles").
    pub fn initial_frontier(&self, state: &S) -> Vec<FrontierItem> {
        let routes = vec![RouteDecision {
            parent: NodeId::Start,
            parent_path: Vec::new(),
            static_targets: self.graph.static_successors(&NodeId::Start).to_vec(),
            route: Next::Unspecified,
        }];
        self.compute_next_frontier(None, StepId(0), &routes, state)
    }

    fn compute_next_frontier(
        &self,
        run_id: Option<&RunId>,
        step_id: StepId,
        routes: &[RouteDecision],
        state: &S,
    ) -> Vec<FrontierItem> {
        let mut next = Vec::new();
        for decision in routes {
            let mut child_path = decision.parent_path.clone();
            child_path.push(decision.parent.clone());
            let targets: Vec<NodeId> = match &decision.route {
                Next::Stop => Vec::new(),
                Next::Goto(target) => vec![target.clone()],
                Next::Many(targets) => targets.clone(),
                Next::Unspecified => {
                    let mut targets = decision.static_targets.clone();
                    targets.extend(self.graph.conditional_successors(&decision.parent, state));
                    targets
                }
            };
            for (edge_index, target) in targets.into_iter().enumerate() {
                if target == NodeId::End {
                    continue;
                }
                let key = order_key(&child_path, &target, edge_index as u32);
                if let Some(run_id) = run_id {
                    emit_lifecycle(
                        &self.emitter,
                        LifecycleEvent::new(
                            run_id.clone(),
                            step_id,
                            Some(target.clone()),
                            Some(key),
                            None,
                            LifecycleKind::RoutingDecision,
                            serde_json::json!({"parent": decision.parent.to_string()}),
                        ),
                    );
                }
                next.push(FrontierItem {
                    node_id: target,
                    order_key: key,
                    parent_path: child_path.clone(),
                });
            }
        }
        next
    }
}

/// One node's routing decision, plus the accumulated parent path it was
/// admitted with. Feeds `compute_next_frontier`'s `order_key` derivation.
struct RouteDecision {
    parent: NodeId,
    parent_path: Vec<NodeId>,
    static_targets: Vec<NodeId>,
    route: Next,
}

/// A node that failed after exhausting its retry budget carries
/// `attempts_exhausted` so the caller can distinguish "gave up because the
/// policy said so" from "failed once and wasn't retryable at all" when
/// choosing between `SchedulerError::MaxAttemptsExceeded` and
/// `SchedulerError::NodeFailed`.
struct RetryFailure {
    error: NodeError,
    attempts_exhausted: Option<u32>,
}

#[allow(clippy::too_many_arguments)]
async fn run_with_retries<S, D>(
    node: &(dyn crate::node::Node<S, D>),
    snapshot: S,
    run_id: &RunId,
    node_id: NodeId,
    step_id: StepId,
    order_key: OrderKey,
    step_seed: RngSeed,
    replay_mode: bool,
    strict_replay: bool,
    default_node_timeout: Option<Duration>,
    recorded_io: Option<Arc<RecordedIoStore>>,
    emitter: Arc<dyn EventEmitter>,
    metrics: Arc<dyn MetricsSink>,
) -> Result<NodeOutcome<D>, RetryFailure>
where
    S: Clone + Send + Sync + 'static,
    D: Send + Sync + 'static,
{
    let policy = node.policy();
    let item_seed = derive_item_seed(step_seed, order_key.0);
    let deadline = policy.timeout.or(default_node_timeout);
    let mut attempt = Attempt::FIRST;

    loop {
        let rng = step_rng(item_seed.wrapping_add(u64::from(attempt.0)));
        let ctx = NodeContext::new(
            run_id.clone(),
            node_id.clone(),
            step_id,
            order_key,
            attempt,
            rng,
            replay_mode,
            strict_replay,
            recorded_io.clone(),
            Arc::clone(&emitter),
        );
        let invocation = node.run(snapshot.clone(), ctx);
        let outcome = match deadline {
            Some(d) => match tokio::time::timeout(d, invocation).await {
                Ok(result) => result,
                Err(_) => Err(NodeError::Timeout),
            },
            None => invocation.await,
        };
        match outcome {
            Ok(outcome) => return Ok(outcome),
            Err(error) => {
                if !policy.is_retryable(&error) {
                    emit_lifecycle(
                        &emitter,
                        LifecycleEvent::new(
                            run_id.clone(),
                            step_id,
                            Some(node_id.clone()),
                            Some(order_key),
                            Some(attempt),
                            LifecycleKind::Error,
                            serde_json::json!({"retryable": false, "error": error.to_string()}),
                        ),
                    );
                    return Err(RetryFailure {
                        error,
                        attempts_exhausted: None,
                    });
                }
                if attempt.0 >= policy.max_attempts {
                    emit_lifecycle(
                        &emitter,
                        LifecycleEvent::new(
                            run_id.clone(),
                            step_id,
                            Some(node_id.clone()),
                            Some(order_key),
                            Some(attempt),
                            LifecycleKind::Error,
                            serde_json::json!({"retryable": true, "attempts_exhausted": true, "error": error.to_string()}),
                        ),
                    );
                    return Err(RetryFailure {
                        error,
                        attempts_exhausted: Some(policy.max_attempts),
                    });
                }
                metrics.increment_counter(RETRIES_TOTAL);
                emit_lifecycle(
                    &emitter,
                    LifecycleEvent::new(
                        run_id.clone(),
                        step_id,
                        Some(node_id.clone()),
                        Some(order_key),
                        Some(attempt),
                        LifecycleKind::Retry,
                        serde_json::json!({"error": error.to_string()}),
                    ),
                );
                let delay = retry::jittered_delay(&policy, attempt, item_seed);
                tokio::time::sleep(delay).await;
                attempt = attempt.next();
            }
        }
    }
}
