//! The run-level driver.
//!
//! [`Engine`] owns the [`Scheduler`], the [`Checkpointer`], and the event
//! sink, and walks a run from its initial or resumed frontier to
//! completion: admit the frontier, run a step, durably commit it, emit its
//! events, advance, repeat (§4 "Engine API", §4.1 "Step algorithm").

mod config;

pub use config::EngineConfig;

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, Checkpointer, CheckpointerError, FrontierItem, RecordedIoStore};
use crate::error::EngineError;
use crate::event_bus::{emit_lifecycle, EventEmitter, LifecycleEvent, LifecycleKind};
use crate::graphs::Graph;
use crate::metrics::STEP_LATENCY_MS;
use crate::node::NodeError;
use crate::reducers::{Reducer, ReducerError};
use crate::scheduler::{Scheduler, SchedulerError, WorkItem};
use crate::types::{RunId, StepId};
use crate::utils::id_generator::IdGenerator;

/// Why [`Engine::run`]/[`Engine::resume`] stopped driving steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopReason {
    /// The frontier emptied out: every branch routed to `Stop` or `End`.
    FrontierEmpty,
}

/// What a run produced once it stopped.
pub struct RunOutcome<S> {
    pub run_id: RunId,
    pub state: S,
    pub steps_run: u64,
    pub stopped: StopReason,
}

/// Drives one graph to completion for a user-defined state `S` and delta
/// `D`. Cheap to hold around for the lifetime of a process; `run`/`resume`
/// borrow `&self` so one engine can drive many concurrent runs of the same
/// graph.
pub struct Engine<S, D>
where
    S: Clone + Send + Sync + serde::Serialize + 'static,
    D: Send + Sync + 'static,
{
    scheduler: Scheduler<S, D>,
    checkpointer: Arc<dyn Checkpointer<S>>,
    emitter: Arc<dyn EventEmitter>,
    config: EngineConfig,
    id_gen: IdGenerator,
    recorded_io: Option<Arc<RecordedIoStore>>,
}

impl<S, D> Engine<S, D>
where
    S: Clone + Send + Sync + serde::Serialize + 'static,
    D: Send + Sync + 'static,
{
    pub fn new(
        graph: Arc<Graph<S, D>>,
        reducer: Arc<dyn Reducer<S, D>>,
        checkpointer: Arc<dyn Checkpointer<S>>,
        emitter: Arc<dyn EventEmitter>,
        config: EngineConfig,
    ) -> Self {
        Self::with_recorded_io(graph, reducer, checkpointer, emitter, config, None)
    }

    /// Like [`Engine::new`] but wires a shared [`RecordedIoStore`] through to
    /// every node invocation, enabling record/replay of recordable side
    /// effects regardless of `config.replay_mode` (a node may record on a
    /// fresh run so a later run can replay it).
    pub fn with_recorded_io(
        graph: Arc<Graph<S, D>>,
        reducer: Arc<dyn Reducer<S, D>>,
        checkpointer: Arc<dyn Checkpointer<S>>,
        emitter: Arc<dyn EventEmitter>,
        config: EngineConfig,
        recorded_io: Option<Arc<RecordedIoStore>>,
    ) -> Self {
        let scheduler_config = config.scheduler_config();
        let scheduler = Scheduler::with_recorded_io(
            graph,
            reducer,
            Arc::clone(&emitter),
            scheduler_config,
            Arc::clone(&config.metrics),
            recorded_io.clone(),
        );
        Self {
            scheduler,
            checkpointer,
            emitter,
            config,
            id_gen: IdGenerator::new(),
            recorded_io,
        }
    }

    /// Starts a fresh run from `initial_state`, minting a run id unless the
    /// caller supplies one, and drives it until the frontier empties, a
    /// configured bound is hit, or a step fails.
    pub async fn run(
        &self,
        run_id: Option<String>,
        initial_state: S,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome<S>, EngineError> {
        let run_id = RunId(run_id.unwrap_or_else(|| self.id_gen.generate_run_id()));
        let frontier = self.scheduler.initial_frontier(&initial_state);
        self.drive(run_id, StepId(0), initial_state, frontier, cancel).await
    }

    /// Resumes a previously checkpointed run from the step after its latest
    /// committed one (§4 "Resume").
    pub async fn resume(
        &self,
        run_id: String,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome<S>, EngineError> {
        let checkpoint = self
            .checkpointer
            .load_latest(&run_id)
            .await?
            .ok_or_else(|| EngineError::Checkpointer(CheckpointerError::NotFound { run_id: run_id.clone() }))?;

        if let Some(recorded_io) = &self.recorded_io {
            recorded_io.hydrate(checkpoint.recorded_ios.clone());
        }

        for event in self.checkpointer.pending_events(&run_id).await? {
            if let Err(error) = self.emitter.emit(event) {
                warn!(run_id = %run_id, %error, "failed to re-emit outbox event left over from a prior crash");
            }
        }
        self.checkpointer
            .mark_events_emitted(&run_id, checkpoint.step_id)
            .await?;

        let run_id = RunId(run_id);
        self.drive(
            run_id,
            checkpoint.step_id.next(),
            checkpoint.state,
            checkpoint.frontier,
            cancel,
        )
        .await
    }

    /// Saves an out-of-band labeled checkpoint without advancing the run
    /// (§4 `SaveCheckpoint`), useful for a caller-driven snapshot between
    /// externally-triggered steps.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_checkpoint(
        &self,
        run_id: &RunId,
        step_id: StepId,
        state: S,
        frontier: Vec<FrontierItem>,
        rng_seed: crate::rng::RngSeed,
        idempotency_key: String,
        label: impl Into<String>,
    ) -> Result<(), EngineError> {
        let recorded_ios = self
            .recorded_io
            .as_ref()
            .map(|store| store.snapshot())
            .unwrap_or_default();
        let checkpoint = Checkpoint::new(
            run_id.clone(),
            step_id,
            state,
            frontier,
            rng_seed,
            idempotency_key,
            Some(label.into()),
            Vec::new(),
            recorded_ios,
        );
        self.checkpointer.save(checkpoint).await?;
        Ok(())
    }

    async fn drive(
        &self,
        run_id: RunId,
        mut step_id: StepId,
        mut state: S,
        mut frontier: Vec<FrontierItem>,
        cancel: watch::Receiver<bool>,
    ) -> Result<RunOutcome<S>, EngineError> {
        let run_started = Instant::now();
        let mut steps_run = 0u64;

        loop {
            if frontier.is_empty() {
                info!(run_id = %run_id, steps = steps_run, "run reached an empty frontier");
                return Ok(RunOutcome {
                    run_id,
                    state,
                    steps_run,
                    stopped: StopReason::FrontierEmpty,
                });
            }
            if *cancel.borrow() {
                return Err(EngineError::Cancelled);
            }
            if step_id.0 >= self.config.max_steps {
                return Err(EngineError::MaxStepsExceeded {
                    max_steps: self.config.max_steps,
                });
            }
            if let Some(budget) = self.config.run_wall_clock_budget {
                if run_started.elapsed() >= budget {
                    return Err(EngineError::Backpressure {
                        waited_ms: run_started.elapsed().as_millis() as u64,
                        node_id: None,
                    });
                }
            }

            let work: Vec<WorkItem> = frontier.into_iter().map(WorkItem::from).collect();
            let step_started = Instant::now();
            let outcome = self
                .scheduler
                .run_step(&run_id, step_id, &state, work, &cancel)
                .await
                .map_err(Self::translate_scheduler_error)?;
            self.config.metrics.record_histogram(
                STEP_LATENCY_MS,
                step_started.elapsed().as_secs_f64() * 1000.0,
            );
            for (node_id, cost_usd) in &outcome.costs {
                if *cost_usd != 0.0 {
                    self.config.cost_tracker.record(node_id, step_id.0, *cost_usd);
                }
            }

            if let Some(previous) = self.checkpointer.load_latest(&run_id.0).await? {
                if previous.idempotency_key == outcome.idempotency_key {
                    debug!(run_id = %run_id, step = step_id.0, "step already durable, skipping re-commit");
                    state = outcome.state;
                    frontier = outcome.frontier;
                    step_id = step_id.next();
                    steps_run += 1;
                    continue;
                }
                if previous.step_id == step_id {
                    return Err(EngineError::IdempotencyViolation {
                        key: outcome.idempotency_key,
                    });
                }
            }

            let recorded_ios = self
                .recorded_io
                .as_ref()
                .map(|store| store.snapshot())
                .unwrap_or_default();
            let checkpoint = Checkpoint::new(
                run_id.clone(),
                step_id,
                outcome.state.clone(),
                outcome.frontier.clone(),
                outcome.rng_seed,
                outcome.idempotency_key.clone(),
                None,
                outcome.events,
                recorded_ios,
            );
            self.checkpointer.save(checkpoint).await?;
            emit_lifecycle(
                &self.emitter,
                LifecycleEvent::new(
                    run_id.clone(),
                    step_id,
                    None,
                    None,
                    None,
                    LifecycleKind::CheckpointSaved,
                    serde_json::Value::Null,
                ),
            );

            if !self.config.replay_mode {
                for event in self.checkpointer.pending_events(&run_id.0).await? {
                    if let Err(error) = self.emitter.emit(event) {
                        warn!(run_id = %run_id, step = step_id.0, %error, "failed to emit step event");
                    }
                }
                self.checkpointer.mark_events_emitted(&run_id.0, step_id).await?;
            }

            state = outcome.state;
            frontier = outcome.frontier;
            step_id = step_id.next();
            steps_run += 1;
        }
    }

    /// Translates a scheduler-level failure into the richer, flat
    /// [`EngineError`] variants named in §7 where one applies; everything
    /// else passes through the generic `#[from] SchedulerError` wrap.
    fn translate_scheduler_error(error: SchedulerError) -> EngineError {
        match error {
            SchedulerError::NodeFailed {
                node_id,
                source: NodeError::ReplayMismatch { .. },
            } => EngineError::ReplayMismatch { node_id },
            SchedulerError::NodeFailed {
                node_id,
                source: NodeError::Timeout,
            } => EngineError::Timeout { node_id },
            SchedulerError::MaxAttemptsExceeded {
                node_id,
                max_attempts,
                ..
            } => EngineError::MaxAttemptsExceeded { node_id, max_attempts },
            SchedulerError::NoProgress { pending } => EngineError::NoProgress { pending },
            SchedulerError::Backpressure { waited_ms } => EngineError::Backpressure {
                waited_ms,
                node_id: None,
            },
            SchedulerError::Cancelled => EngineError::Cancelled,
            SchedulerError::Reducer(ReducerError::Conflict { a, b, .. }) => EngineError::Conflict { a, b },
            other => EngineError::Scheduler(other),
        }
    }
}
