//! Recorded IO: the record/playback layer recordable nodes consult so a
//! replay can short-circuit external side effects (§4.4 "recorded IO
//! discipline", §9 "Recorded IO").

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::types::{Attempt, NodeId, StepId};

/// One recorded request/response pair, keyed by `(node_id, step_id, attempt,
/// request_hash)`. `response_hash` lets the engine detect a divergent replay
/// even if `response_bytes` were to be tampered with.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RecordedIo {
    pub node_id: NodeId,
    pub step_id: StepId,
    pub attempt: Attempt,
    pub request_hash: String,
    pub response_bytes: Vec<u8>,
    pub response_hash: [u8; 32],
    pub metadata: FxHashMap<String, String>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq)]
struct RecordedIoKey {
    node_id: NodeId,
    step_id: StepId,
    attempt: Attempt,
    request_hash: String,
}

/// In-process store of recorded IO entries for one run. Thread-safe via
/// `parking_lot::RwLock`, matching the rest of the crate's synchronization
/// idiom for small, hot-path-adjacent shared state.
#[derive(Default)]
pub struct RecordedIoStore {
    entries: RwLock<FxHashMap<RecordedIoKey, RecordedIo>>,
}

impl RecordedIoStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: RecordedIo) {
        let key = RecordedIoKey {
            node_id: entry.node_id.clone(),
            step_id: entry.step_id,
            attempt: entry.attempt,
            request_hash: entry.request_hash.clone(),
        };
        self.entries.write().insert(key, entry);
    }

    /// Looks up a previously recorded response for `(node_id, step_id,
    /// attempt, request_hash)`. Returns `None` when nothing was recorded,
    /// which callers under `strict_replay` should treat as a replay
    /// mismatch.
    pub fn lookup(
        &self,
        node_id: &NodeId,
        step_id: StepId,
        attempt: Attempt,
        request_hash: &str,
    ) -> Option<RecordedIo> {
        let key = RecordedIoKey {
            node_id: node_id.clone(),
            step_id,
            attempt,
            request_hash: request_hash.to_string(),
        };
        self.entries.read().get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dumps every entry currently held, for persisting into a checkpoint.
    pub fn snapshot(&self) -> Vec<RecordedIo> {
        self.entries.read().values().cloned().collect()
    }

    /// Loads entries recovered from a checkpoint back into the store, e.g.
    /// on resume. Existing entries with the same key are overwritten.
    pub fn hydrate(&self, entries: Vec<RecordedIo>) {
        for entry in entries {
            self.record(entry);
        }
    }
}
