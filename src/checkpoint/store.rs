//! The [`Checkpointer`] trait and its in-memory reference implementation.
//!
//! Concrete durable backends (SQL, object storage, ...) are out of scope for
//! this crate; callers implement [`Checkpointer`] against their own store.

use async_trait::async_trait;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use super::{Checkpoint, CheckpointerError};
use crate::event_bus::Event;
use crate::types::StepId;

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Durable storage for checkpoints, keyed by run id. Implementations must
/// make `save` atomic and idempotent: a crash mid-save must never leave a
/// partially written checkpoint visible to `load_latest` (§4.4 "atomic
/// commit").
#[async_trait]
pub trait Checkpointer<S>: Send + Sync
where
    S: Clone + Send + Sync + 'static,
{
    async fn save(&self, checkpoint: Checkpoint<S>) -> Result<()>;

    /// Returns the most recently saved checkpoint for `run_id`, or `None` if
    /// the run has never been checkpointed.
    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint<S>>>;

    /// Returns the checkpoint saved under `label` for `run_id`, if any
    /// (§4 `SaveCheckpoint`).
    async fn load_labeled(&self, run_id: &str, label: &str) -> Result<Option<Checkpoint<S>>>;

    async fn list_runs(&self) -> Result<Vec<String>>;

    /// Outbox entries saved but not yet marked emitted, across every step
    /// committed so far for `run_id`, oldest first. A caller resuming a run
    /// drains these before driving new steps, so a crash between `save` and
    /// emission doesn't silently drop a domain event.
    async fn pending_events(&self, run_id: &str) -> Result<Vec<Event>>;

    /// Marks every outbox entry for `run_id` at or before `step_id` as
    /// emitted, so a later `pending_events` call doesn't return them again.
    async fn mark_events_emitted(&self, run_id: &str, step_id: StepId) -> Result<()>;
}

struct RunHistory<S> {
    latest: Checkpoint<S>,
    labeled: FxHashMap<String, Checkpoint<S>>,
    outbox: Vec<super::OutboxEntry>,
}

/// Volatile, process-local [`Checkpointer`]. Keeps only the latest
/// checkpoint plus any explicitly labeled ones per run; suitable for tests
/// and short-lived runs, not for crash recovery across process restarts.
pub struct InMemoryCheckpointer<S> {
    runs: RwLock<FxHashMap<String, RunHistory<S>>>,
}

impl<S> Default for InMemoryCheckpointer<S> {
    fn default() -> Self {
        Self {
            runs: RwLock::new(FxHashMap::default()),
        }
    }
}

impl<S> InMemoryCheckpointer<S> {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl<S> Checkpointer<S> for InMemoryCheckpointer<S>
where
    S: Clone + Send + Sync + 'static,
{
    async fn save(&self, checkpoint: Checkpoint<S>) -> Result<()> {
        let mut runs = self.runs.write();
        let run_id = checkpoint.run_id.0.clone();
        let new_outbox_entries = checkpoint.events.clone();
        let entry = runs.entry(run_id).or_insert_with(|| RunHistory {
            latest: checkpoint.clone(),
            labeled: FxHashMap::default(),
            outbox: Vec::new(),
        });
        if let Some(label) = &checkpoint.label {
            entry.labeled.insert(label.clone(), checkpoint.clone());
        }
        entry.outbox.extend(new_outbox_entries);
        entry.latest = checkpoint;
        Ok(())
    }

    async fn load_latest(&self, run_id: &str) -> Result<Option<Checkpoint<S>>> {
        Ok(self.runs.read().get(run_id).map(|h| h.latest.clone()))
    }

    async fn load_labeled(&self, run_id: &str, label: &str) -> Result<Option<Checkpoint<S>>> {
        Ok(self
            .runs
            .read()
            .get(run_id)
            .and_then(|h| h.labeled.get(label).cloned()))
    }

    async fn list_runs(&self) -> Result<Vec<String>> {
        Ok(self.runs.read().keys().cloned().collect())
    }

    async fn pending_events(&self, run_id: &str) -> Result<Vec<Event>> {
        Ok(self
            .runs
            .read()
            .get(run_id)
            .map(|h| {
                h.outbox
                    .iter()
                    .filter(|entry| !entry.emitted)
                    .map(|entry| entry.event.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn mark_events_emitted(&self, run_id: &str, step_id: StepId) -> Result<()> {
        if let Some(history) = self.runs.write().get_mut(run_id) {
            for entry in history.outbox.iter_mut() {
                if entry.step_id <= step_id {
                    entry.emitted = true;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RunId, StepId};

    fn checkpoint(run: &str, step: u64) -> Checkpoint<i64> {
        Checkpoint::new(
            RunId::from(run),
            StepId(step),
            42,
            vec![],
            0,
            format!("idem-{step}"),
            None,
            vec![],
            vec![],
        )
    }

    #[tokio::test]
    async fn save_then_load_latest_round_trips() {
        let store: InMemoryCheckpointer<i64> = InMemoryCheckpointer::new();
        store.save(checkpoint("r1", 0)).await.unwrap();
        let loaded = store.load_latest("r1").await.unwrap().unwrap();
        assert_eq!(loaded.step_id, StepId(0));
    }

    #[tokio::test]
    async fn later_save_replaces_latest_but_keeps_labels() {
        let store: InMemoryCheckpointer<i64> = InMemoryCheckpointer::new();
        let mut first = checkpoint("r1", 0);
        first.label = Some("before-retry".into());
        store.save(first).await.unwrap();
        store.save(checkpoint("r1", 1)).await.unwrap();

        let latest = store.load_latest("r1").await.unwrap().unwrap();
        assert_eq!(latest.step_id, StepId(1));

        let labeled = store.load_labeled("r1", "before-retry").await.unwrap().unwrap();
        assert_eq!(labeled.step_id, StepId(0));
    }

    #[tokio::test]
    async fn unknown_run_returns_none() {
        let store: InMemoryCheckpointer<i64> = InMemoryCheckpointer::new();
        assert!(store.load_latest("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pending_events_returns_unemitted_entries_in_commit_order() {
        let store: InMemoryCheckpointer<i64> = InMemoryCheckpointer::new();
        let mut first = checkpoint("r1", 0);
        first.events = vec![super::super::OutboxEntry {
            step_id: StepId(0),
            event: Event::diagnostic("step", "first"),
            emitted: false,
        }];
        store.save(first).await.unwrap();

        let mut second = checkpoint("r1", 1);
        second.events = vec![super::super::OutboxEntry {
            step_id: StepId(1),
            event: Event::diagnostic("step", "second"),
            emitted: false,
        }];
        store.save(second).await.unwrap();

        let pending = store.pending_events("r1").await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].message(), "first");
        assert_eq!(pending[1].message(), "second");
    }

    #[tokio::test]
    async fn mark_events_emitted_excludes_them_from_later_pending_events() {
        let store: InMemoryCheckpointer<i64> = InMemoryCheckpointer::new();
        let mut first = checkpoint("r1", 0);
        first.events = vec![super::super::OutboxEntry {
            step_id: StepId(0),
            event: Event::diagnostic("step", "first"),
            emitted: false,
        }];
        store.save(first).await.unwrap();

        store.mark_events_emitted("r1", StepId(0)).await.unwrap();
        assert!(store.pending_events("r1").await.unwrap().is_empty());
    }
}
