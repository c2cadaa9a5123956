//! State reduction: how a node's delta is folded into the run's state.
//!
//! A [`Reducer`] is the single seam between "what a node computed" (`D`) and
//! "what the run believes" (`S`). It must be pure and order-independent
//! across concurrently produced deltas within one step; the scheduler is
//! responsible for applying deltas to a step in `order_key` order so that
//! reducers which are not commutative (e.g. last-write-wins on a field)
//! still behave deterministically (§4.2 "Reducer protocol").

use miette::Diagnostic;
use thiserror::Error;

use crate::types::OrderKey;

/// Folds a single delta into the previous state snapshot, producing the next
/// state. Implementations should treat `prev` as immutable and return a new
/// value rather than mutating in place, so the engine can keep the previous
/// snapshot around for diagnostics or rollback.
pub trait Reducer<S, D>: Send + Sync {
    fn apply(&self, prev: &S, delta: &D) -> Result<S, ReducerError>;
}

/// A reducer built from a plain closure, for cases that don't need a named
/// type implementing [`Reducer`].
pub struct FnReducer<F> {
    f: F,
}

impl<F> FnReducer<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<S, D, F> Reducer<S, D> for FnReducer<F>
where
    F: Fn(&S, &D) -> Result<S, ReducerError> + Send + Sync,
{
    fn apply(&self, prev: &S, delta: &D) -> Result<S, ReducerError> {
        (self.f)(prev, delta)
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ReducerError {
    #[error("reducer apply failed: {message}")]
    #[diagnostic(
        code(stepwright::reducers::apply),
        help("a reducer must be total over its delta type; check for an unhandled variant")
    )]
    Apply { message: String },

    #[error("conflicting writes detected during merge between order keys {a} and {b}: {detail}")]
    #[diagnostic(
        code(stepwright::reducers::conflict),
        help("two deltas in the same step touched the same field; set a ConflictPolicy or make the reducer commutative")
    )]
    Conflict {
        a: OrderKey,
        b: OrderKey,
        detail: String,
    },
}

impl ReducerError {
    pub fn apply(message: impl Into<String>) -> Self {
        ReducerError::Apply {
            message: message.into(),
        }
    }

    pub fn conflict(a: OrderKey, b: OrderKey, detail: impl Into<String>) -> Self {
        ReducerError::Conflict {
            a,
            b,
            detail: detail.into(),
        }
    }
}
