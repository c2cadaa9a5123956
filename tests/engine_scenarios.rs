//! Integration tests exercising full runs through [`Engine`]: linear
//! execution, fan-out/fan-in determinism, retry with backoff, replay
//! short-circuiting, per-node backpressure, and crash/resume.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::watch;

use stepwright::checkpoint::{Checkpointer, InMemoryCheckpointer, RecordedIo, RecordedIoStore};
use stepwright::engine::{Engine, EngineConfig, StopReason};
use stepwright::error::EngineError;
use stepwright::event_bus::EventBus;
use stepwright::graphs::GraphBuilder;
use stepwright::hashing;
use stepwright::metrics::{MetricsSink, BACKPRESSURE_EVENTS_TOTAL};
use stepwright::node::{Node, NodeContext, NodeError, NodeOutcome, NodePolicy};
use stepwright::reducers::{FnReducer, ReducerError};
use stepwright::route::Next;
use stepwright::types::{Attempt, NodeId, OrderKey, StepId};

fn no_cancel() -> watch::Receiver<bool> {
    watch::channel(false).1
}

// --- S1: linear path -------------------------------------------------------

#[derive(Clone, Default, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Tally(i64);

struct AddOne;

#[async_trait]
impl Node<Tally, i64> for AddOne {
    async fn run(&self, _snapshot: Tally, _ctx: NodeContext) -> Result<NodeOutcome<i64>, NodeError> {
        Ok(NodeOutcome::new(1))
    }
}

#[tokio::test]
async fn linear_run_commits_every_step_in_order() {
    let graph = GraphBuilder::<Tally, i64>::new()
        .add_node(NodeId::custom("a"), AddOne)
        .add_node(NodeId::custom("b"), AddOne)
        .add_node(NodeId::custom("c"), AddOne)
        .add_edge(NodeId::Start, NodeId::custom("a"))
        .add_edge(NodeId::custom("a"), NodeId::custom("b"))
        .add_edge(NodeId::custom("b"), NodeId::custom("c"))
        .add_edge(NodeId::custom("c"), NodeId::End)
        .compile()
        .expect("linear graph compiles");
    let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, EngineConfig::default());

    let outcome = engine
        .run(Some("linear".into()), Tally(0), no_cancel())
        .await
        .expect("run completes");
    assert_eq!(outcome.state, Tally(3));
    assert_eq!(outcome.steps_run, 3);
    assert_eq!(outcome.stopped, StopReason::FrontierEmpty);
}

// --- S2: fan-out / fan-in determinism ---------------------------------------

#[derive(Clone, Default, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
struct Visits(Vec<String>);

struct Visit(&'static str);

#[async_trait]
impl Node<Visits, String> for Visit {
    async fn run(&self, _snapshot: Visits, _ctx: NodeContext) -> Result<NodeOutcome<String>, NodeError> {
        Ok(NodeOutcome::new(self.0.to_string()))
    }
}

fn fanout_engine() -> Engine<Visits, String> {
    let graph = GraphBuilder::<Visits, String>::new()
        .add_node(NodeId::custom("x"), Visit("x"))
        .add_node(NodeId::custom("y"), Visit("y"))
        .add_node(NodeId::custom("z"), Visit("z"))
        .add_edge(NodeId::Start, NodeId::custom("x"))
        .add_edge(NodeId::Start, NodeId::custom("y"))
        .add_edge(NodeId::Start, NodeId::custom("z"))
        .add_edge(NodeId::custom("x"), NodeId::End)
        .add_edge(NodeId::custom("y"), NodeId::End)
        .add_edge(NodeId::custom("z"), NodeId::End)
        .compile()
        .expect("fanout graph compiles");
    let reducer = FnReducer::new(|prev: &Visits, delta: &String| {
        let mut next = prev.clone();
        next.0.push(delta.clone());
        Ok(next)
    });
    let checkpointer: Arc<dyn Checkpointer<Visits>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, EngineConfig::default())
}

#[tokio::test]
async fn fanout_merge_order_is_stable_across_runs() {
    let engine = fanout_engine();
    let first = engine
        .run(Some("fanout-1".into()), Visits::default(), no_cancel())
        .await
        .expect("first run completes");
    let second = engine
        .run(Some("fanout-2".into()), Visits::default(), no_cancel())
        .await
        .expect("second run completes");

    assert_eq!(first.state.0.len(), 3);
    assert_eq!(first.state, second.state, "reducer fold order must not depend on dispatch timing");
}

// --- S3: retry with seeded backoff ------------------------------------------

struct FlakyThenOk {
    failures_left: AtomicUsize,
}

#[async_trait]
impl Node<Tally, i64> for FlakyThenOk {
    async fn run(&self, _snapshot: Tally, _ctx: NodeContext) -> Result<NodeOutcome<i64>, NodeError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(NodeError::Provider { provider: "test", message: "transient".into() });
        }
        Ok(NodeOutcome::new(1))
    }

    fn policy(&self) -> NodePolicy {
        NodePolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(1), 1.0)
            .retryable_when(|error| matches!(error, NodeError::Provider { .. }))
    }
}

#[tokio::test]
async fn retryable_node_recovers_within_its_attempt_budget() {
    let graph = GraphBuilder::<Tally, i64>::new()
        .add_node(NodeId::custom("flaky"), FlakyThenOk { failures_left: AtomicUsize::new(2) })
        .add_edge(NodeId::Start, NodeId::custom("flaky"))
        .add_edge(NodeId::custom("flaky"), NodeId::End)
        .compile()
        .expect("graph compiles");
    let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, EngineConfig::default());

    let outcome = engine
        .run(Some("retry-ok".into()), Tally(0), no_cancel())
        .await
        .expect("third attempt succeeds");
    assert_eq!(outcome.state, Tally(1));
}

#[tokio::test]
async fn retries_exhausted_surfaces_max_attempts_exceeded() {
    let graph = GraphBuilder::<Tally, i64>::new()
        .add_node(NodeId::custom("flaky"), FlakyThenOk { failures_left: AtomicUsize::new(10) })
        .add_edge(NodeId::Start, NodeId::custom("flaky"))
        .add_edge(NodeId::custom("flaky"), NodeId::End)
        .compile()
        .expect("graph compiles");
    let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, EngineConfig::default());

    let error = engine
        .run(Some("retry-exhausted".into()), Tally(0), no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        EngineError::MaxAttemptsExceeded { max_attempts: 3, .. }
    ));
}

// --- S4: replay short-circuit ------------------------------------------------

struct RecordingNode {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Node<Tally, i64> for RecordingNode {
    async fn run(&self, _snapshot: Tally, ctx: NodeContext) -> Result<NodeOutcome<i64>, NodeError> {
        let request_hash = "fetch-price";
        if ctx.replay_mode {
            let recorded = ctx
                .lookup_recorded(request_hash)
                .ok_or_else(|| NodeError::ReplayMismatch { request_hash: request_hash.to_string() })?;
            let value: i64 = serde_json::from_slice(&recorded.response_bytes)?;
            return Ok(NodeOutcome::new(value));
        }

        self.calls.fetch_add(1, Ordering::SeqCst);
        let value = 7i64;
        let response_bytes = serde_json::to_vec(&value)?;
        ctx.record_io(RecordedIo {
            node_id: ctx.node_id.clone(),
            step_id: ctx.step,
            attempt: Attempt::FIRST,
            request_hash: request_hash.to_string(),
            response_hash: hashing::hash_bytes(&response_bytes),
            response_bytes,
            metadata: Default::default(),
        });
        Ok(NodeOutcome::new(value))
    }

    fn policy(&self) -> NodePolicy {
        NodePolicy::default().recordable()
    }
}

#[tokio::test]
async fn replaying_a_recordable_node_does_not_repeat_its_side_effect() {
    let calls = Arc::new(AtomicUsize::new(0));
    let recorded_io = Arc::new(RecordedIoStore::new());

    let build_engine = |replay_mode: bool| {
        let graph = GraphBuilder::<Tally, i64>::new()
            .add_node(NodeId::custom("fetch"), RecordingNode { calls: Arc::clone(&calls) })
            .add_edge(NodeId::Start, NodeId::custom("fetch"))
            .add_edge(NodeId::custom("fetch"), NodeId::End)
            .compile()
            .expect("graph compiles");
        let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
        let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
        let emitter = EventBus::default().get_emitter();
        Engine::with_recorded_io(
            Arc::new(graph),
            Arc::new(reducer),
            checkpointer,
            emitter,
            EngineConfig::default().with_replay_mode(replay_mode).with_strict_replay(replay_mode),
            Some(Arc::clone(&recorded_io)),
        )
    };

    let live = build_engine(false);
    let first = live
        .run(Some("replay-1".into()), Tally(0), no_cancel())
        .await
        .expect("live run records io");
    assert_eq!(first.state, Tally(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let replayed = build_engine(true);
    let second = replayed
        .run(Some("replay-2".into()), Tally(0), no_cancel())
        .await
        .expect("replay short-circuits from the recorded entry");
    assert_eq!(second.state, Tally(7));
    assert_eq!(calls.load(Ordering::SeqCst), 1, "replay must not re-invoke the real side effect");
}

// --- S5: backpressure --------------------------------------------------------

struct SlowWorker {
    concurrent: Arc<AtomicUsize>,
    max_observed: Arc<AtomicUsize>,
}

#[async_trait]
impl Node<Tally, i64> for SlowWorker {
    async fn run(&self, _snapshot: Tally, _ctx: NodeContext) -> Result<NodeOutcome<i64>, NodeError> {
        let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.concurrent.fetch_sub(1, Ordering::SeqCst);
        Ok(NodeOutcome::new(1))
    }
}

#[tokio::test]
async fn per_node_concurrency_cap_is_honored_under_fanout() {
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    let mut builder = GraphBuilder::<Tally, i64>::new();
    for i in 0..4 {
        let worker = SlowWorker {
            concurrent: Arc::clone(&concurrent),
            max_observed: Arc::clone(&max_observed),
        };
        builder = builder
            .add_node(NodeId::custom(format!("w{i}")), worker)
            .add_edge(NodeId::Start, NodeId::custom(format!("w{i}")))
            .add_edge(NodeId::custom(format!("w{i}")), NodeId::End);
    }
    let graph = builder.compile().expect("fanout graph compiles");
    let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let config = EngineConfig::default().with_max_per_node_concurrency(1);
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, config);

    let outcome = engine
        .run(Some("backpressure".into()), Tally(0), no_cancel())
        .await
        .expect("run completes despite the concurrency cap");
    assert_eq!(outcome.state, Tally(4));
}

// --- S6: crash / resume -------------------------------------------------------

struct FailsOnFirstAttempt {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Node<Tally, i64> for FailsOnFirstAttempt {
    async fn run(&self, _snapshot: Tally, _ctx: NodeContext) -> Result<NodeOutcome<i64>, NodeError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(NodeError::Provider { provider: "test", message: "simulated crash".into() });
        }
        Ok(NodeOutcome::new(1))
    }
}

#[tokio::test]
async fn resume_picks_up_after_a_mid_run_failure() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());

    let build_engine = || {
        let graph = GraphBuilder::<Tally, i64>::new()
            .add_node(NodeId::custom("a"), AddOne)
            .add_node(NodeId::custom("b"), FailsOnFirstAttempt { attempts: Arc::clone(&attempts) })
            .add_edge(NodeId::Start, NodeId::custom("a"))
            .add_edge(NodeId::custom("a"), NodeId::custom("b"))
            .add_edge(NodeId::custom("b"), NodeId::End)
            .compile()
            .expect("graph compiles");
        let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
        let emitter = EventBus::default().get_emitter();
        Engine::new(Arc::new(graph), Arc::new(reducer), Arc::clone(&checkpointer), emitter, EngineConfig::default())
    };

    let crashed = build_engine();
    let error = crashed
        .run(Some("crash-resume".into()), Tally(0), no_cancel())
        .await
        .unwrap_err();
    assert!(matches!(error, EngineError::Scheduler(stepwright::scheduler::SchedulerError::NodeFailed { .. })));

    // Step 0 (node "a") committed before the crash.
    let checkpoint = checkpointer
        .load_latest("crash-resume")
        .await
        .expect("checkpointer reachable")
        .expect("a checkpoint was saved before the failure");
    assert_eq!(checkpoint.step_id, StepId(0));
    assert_eq!(checkpoint.state, Tally(1));

    let resumed = build_engine();
    let outcome = resumed
        .resume("crash-resume".into(), no_cancel())
        .await
        .expect("resume completes the run from the last checkpoint");
    assert_eq!(outcome.state, Tally(2));
    assert_eq!(outcome.stopped, StopReason::FrontierEmpty);
}

// --- cancellation mid-frontier -------------------------------------------------

#[tokio::test]
async fn cancelling_before_a_later_step_stops_the_run_without_losing_progress() {
    let (tx, rx) = watch::channel(false);
    let graph = GraphBuilder::<Tally, i64>::new()
        .add_node(NodeId::custom("a"), AddOne)
        .add_node(NodeId::custom("b"), AddOne)
        .add_edge(NodeId::Start, NodeId::custom("a"))
        .add_edge(NodeId::custom("a"), NodeId::custom("b"))
        .add_edge(NodeId::custom("b"), NodeId::End)
        .compile()
        .expect("graph compiles");
    let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), Arc::clone(&checkpointer), emitter, EngineConfig::default());

    tx.send(true).expect("receiver still alive");
    let error = engine.run(Some("cancel-run".into()), Tally(0), rx).await.unwrap_err();
    assert!(matches!(error, EngineError::Cancelled));
    assert!(checkpointer.load_latest("cancel-run").await.unwrap().is_none());
}

// --- admission queue depth / backpressure ------------------------------------

#[derive(Default)]
struct CountingMetrics {
    backpressure_events: AtomicU64,
}

impl MetricsSink for CountingMetrics {
    fn increment_counter(&self, name: &'static str) {
        if name == BACKPRESSURE_EVENTS_TOTAL {
            self.backpressure_events.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn queue_depth_of_one_serializes_a_fanout_and_counts_backpressure() {
    let concurrent = Arc::new(AtomicUsize::new(0));
    let max_observed = Arc::new(AtomicUsize::new(0));

    let mut builder = GraphBuilder::<Tally, i64>::new();
    for i in 0..3 {
        let worker = SlowWorker {
            concurrent: Arc::clone(&concurrent),
            max_observed: Arc::clone(&max_observed),
        };
        builder = builder
            .add_node(NodeId::custom(format!("w{i}")), worker)
            .add_edge(NodeId::Start, NodeId::custom(format!("w{i}")))
            .add_edge(NodeId::custom(format!("w{i}")), NodeId::End);
    }
    let graph = builder.compile().expect("fanout graph compiles");
    let reducer = FnReducer::new(|prev: &Tally, delta: &i64| Ok(Tally(prev.0 + delta)));
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let metrics = Arc::new(CountingMetrics::default());
    let config = EngineConfig::default()
        .with_queue_depth(1)
        .with_metrics(Arc::clone(&metrics) as Arc<dyn MetricsSink>);
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, config);

    let started = Instant::now();
    let outcome = engine
        .run(Some("queue-depth".into()), Tally(0), no_cancel())
        .await
        .expect("run completes despite the queue depth cap");
    assert_eq!(outcome.state, Tally(3));
    assert_eq!(max_observed.load(Ordering::SeqCst), 1, "only one item should ever be admitted at a time");
    assert!(
        started.elapsed() >= Duration::from_millis(55),
        "admission should serialize the three 20ms items end to end"
    );
    assert_eq!(
        metrics.backpressure_events.load(Ordering::SeqCst),
        2,
        "the second and third admissions should each report backpressure once"
    );
}

// --- reducer conflict translation ---------------------------------------------

struct StampOrderKey;

#[async_trait]
impl Node<Tally, (OrderKey, i64)> for StampOrderKey {
    async fn run(&self, _snapshot: Tally, ctx: NodeContext) -> Result<NodeOutcome<(OrderKey, i64)>, NodeError> {
        Ok(NodeOutcome::new((ctx.order_key, 1)))
    }
}

#[tokio::test]
async fn reducer_conflict_surfaces_as_engine_conflict_with_both_order_keys() {
    let seen: Arc<Mutex<Option<OrderKey>>> = Arc::new(Mutex::new(None));
    let reducer = FnReducer::new(move |prev: &Tally, delta: &(OrderKey, i64)| {
        let mut seen = seen.lock().expect("lock not poisoned");
        let (order_key, amount) = *delta;
        match *seen {
            Some(first) => Err(ReducerError::conflict(first, order_key, "same-step writes overlapped")),
            None => {
                *seen = Some(order_key);
                Ok(Tally(prev.0 + amount))
            }
        }
    });

    let graph = GraphBuilder::<Tally, (OrderKey, i64)>::new()
        .add_node(NodeId::custom("x"), StampOrderKey)
        .add_node(NodeId::custom("y"), StampOrderKey)
        .add_edge(NodeId::Start, NodeId::custom("x"))
        .add_edge(NodeId::Start, NodeId::custom("y"))
        .add_edge(NodeId::custom("x"), NodeId::End)
        .add_edge(NodeId::custom("y"), NodeId::End)
        .compile()
        .expect("fanout graph compiles");
    let checkpointer: Arc<dyn Checkpointer<Tally>> = Arc::new(InMemoryCheckpointer::new());
    let emitter = EventBus::default().get_emitter();
    let engine = Engine::new(Arc::new(graph), Arc::new(reducer), checkpointer, emitter, EngineConfig::default());

    let error = engine
        .run(Some("conflict-run".into()), Tally(0), no_cancel())
        .await
        .unwrap_err();
    match error {
        EngineError::Conflict { a, b } => assert_ne!(a, b, "the two colliding order keys must be distinct"),
        other => panic!("expected EngineError::Conflict, got {other:?}"),
    }
}
