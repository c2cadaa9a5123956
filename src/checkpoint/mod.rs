//! Checkpoint and replay machinery.
//!
//! A [`Checkpoint`] is the atomic record of one committed step: the state,
//! the next frontier, the RNG seed, recorded IO, and the idempotency key
//! that guards against double-commit on crash/retry (§4.4). Checkpoints are
//! write-once; nothing ever mutates one after `save`.

mod recorded_io;
mod store;

pub use recorded_io::{RecordedIo, RecordedIoStore};
pub use store::{Checkpointer, InMemoryCheckpointer};

use chrono::{DateTime, Utc};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event_bus::Event;
use crate::rng::RngSeed;
use crate::types::{NodeId, OrderKey, RunId, StepId};

/// A single pending work item carried in the frontier between steps. Carries
/// the accumulated parent path (`Start` exclusive) rather than only the
/// immediate predecessor, so `order_key` stays reproducible on resume even
/// when a node is revisited along a different route (§4.3 ordering).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrontierItem {
    pub node_id: NodeId,
    pub order_key: OrderKey,
    pub parent_path: Vec<NodeId>,
}

/// An outbox-pattern entry: a domain event produced while computing step
/// `step_id`, persisted alongside the state/frontier it was produced with so
/// a crash between "checkpoint saved" and "event emitted" can be recovered
/// from by re-draining unemitted entries on resume (§4.4 atomic commit).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub step_id: StepId,
    pub event: Event,
    pub emitted: bool,
}

/// Atomic durable record of step `step_id`'s outcome (§3 "Checkpoint (C_k)").
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint<S> {
    pub run_id: RunId,
    pub step_id: StepId,
    pub state: S,
    pub frontier: Vec<FrontierItem>,
    pub rng_seed: RngSeed,
    pub idempotency_key: String,
    pub label: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Domain events produced alongside this step's state transition,
    /// committed in the same save so they survive a crash before emission.
    pub events: Vec<OutboxEntry>,
    /// Recorded IO accumulated up to and including this step, so a resumed
    /// run replays prior node calls instead of re-issuing them.
    pub recorded_ios: Vec<RecordedIo>,
}

impl<S> Checkpoint<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: RunId,
        step_id: StepId,
        state: S,
        frontier: Vec<FrontierItem>,
        rng_seed: RngSeed,
        idempotency_key: String,
        label: Option<String>,
        events: Vec<Event>,
        recorded_ios: Vec<RecordedIo>,
    ) -> Self {
        let outbox = events
            .into_iter()
            .map(|event| OutboxEntry {
                step_id,
                event,
                emitted: false,
            })
            .collect();
        Self {
            run_id,
            step_id,
            state,
            frontier,
            rng_seed,
            idempotency_key,
            label,
            created_at: Utc::now(),
            events: outbox,
            recorded_ios,
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    #[error("run not found: {run_id}")]
    #[diagnostic(
        code(stepwright::checkpointer::not_found),
        help("ensure run_id `{run_id}` is correct and at least one checkpoint has been saved")
    )]
    NotFound { run_id: String },

    #[error("backend error: {message}")]
    #[diagnostic(code(stepwright::checkpointer::backend))]
    Backend { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(code(stepwright::checkpointer::serde))]
    Serde { message: String },
}
