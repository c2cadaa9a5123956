//! Run-level error taxonomy (§7).
//!
//! Lower modules keep their own focused error enums (`NodeError`,
//! `SchedulerError`, `CheckpointerError`, `ReducerError`); `EngineError` is
//! the run-level sum type a caller ultimately sees, mirroring the pattern of
//! wrapping module errors behind one diagnostic-rich type.

use miette::Diagnostic;
use thiserror::Error;

use crate::checkpoint::CheckpointerError;
use crate::node::NodeError;
use crate::reducers::ReducerError;
use crate::scheduler::SchedulerError;
use crate::types::{NodeId, OrderKey};

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("replay mismatch: node {node_id} had no recorded IO entry for the observed request")]
    #[diagnostic(
        code(stepwright::replay_mismatch),
        help("delete the run's recorded IO and re-run without replay_mode, or restore the missing entry")
    )]
    ReplayMismatch { node_id: NodeId },

    #[error("no progress: frontier had {pending} pending item(s) but none were runnable")]
    #[diagnostic(
        code(stepwright::no_progress),
        help("check for a topology bug: a node whose guard never admits it, or a cycle with no exit edge")
    )]
    NoProgress { pending: usize },

    #[error("backpressure: admission blocked for {waited_ms}ms exceeding the configured timeout")]
    #[diagnostic(
        code(stepwright::backpressure),
        help("raise QueueDepth/BackpressureTimeout or reduce fan-out from the offending node")
    )]
    Backpressure { waited_ms: u64, node_id: Option<NodeId> },

    #[error("run exceeded MaxSteps ({max_steps})")]
    #[diagnostic(
        code(stepwright::max_steps_exceeded),
        help("the graph likely contains an unbounded cycle; raise MaxSteps only after confirming termination")
    )]
    MaxStepsExceeded { max_steps: u64 },

    #[error("node {node_id} exceeded its retry budget ({max_attempts} attempts)")]
    #[diagnostic(code(stepwright::max_attempts_exceeded))]
    MaxAttemptsExceeded { node_id: NodeId, max_attempts: u32 },

    #[error("idempotency violation: key {key} was committed twice with differing payloads")]
    #[diagnostic(
        code(stepwright::idempotency_violation),
        help("this indicates a non-deterministic node or reducer; the store keeps the first commit as authoritative")
    )]
    IdempotencyViolation { key: String },

    #[error("timeout: node {node_id} did not return within its deadline")]
    #[diagnostic(code(stepwright::timeout))]
    Timeout { node_id: NodeId },

    #[error("merge conflict between order keys {a} and {b}")]
    #[diagnostic(
        code(stepwright::conflict),
        help("under ConflictPolicy::Fail, overlapping field writes in the same step abort deterministically")
    )]
    Conflict { a: OrderKey, b: OrderKey },

    #[error("run was cancelled")]
    #[diagnostic(code(stepwright::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(transparent)]
    Node(#[from] NodeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Checkpointer(#[from] CheckpointerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Reducer(#[from] ReducerError),

    #[error("graph compile error: {0}")]
    #[diagnostic(code(stepwright::graph_compile))]
    GraphCompile(#[from] crate::graphs::GraphCompileError),
}

impl EngineError {
    /// Stable sentinel name for each variant, matching the names used in
    /// `node_start`/`error` events so callers can compare error kinds without
    /// downcasting (§7 "user-visible behavior").
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::ReplayMismatch { .. } => "replay_mismatch",
            EngineError::NoProgress { .. } => "no_progress",
            EngineError::Backpressure { .. } => "backpressure",
            EngineError::MaxStepsExceeded { .. } => "max_steps_exceeded",
            EngineError::MaxAttemptsExceeded { .. } => "max_attempts_exceeded",
            EngineError::IdempotencyViolation { .. } => "idempotency_violation",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Conflict { .. } => "conflict",
            EngineError::Cancelled => "cancelled",
            EngineError::Node(_) => "node_error",
            EngineError::Scheduler(_) => "scheduler_error",
            EngineError::Checkpointer(_) => "checkpointer_error",
            EngineError::Reducer(_) => "reducer_error",
            EngineError::GraphCompile(_) => "graph_compile_error",
        }
    }
}
