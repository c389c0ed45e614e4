//! Checkpoint store: append-only progress markers per task.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::domain::{Checkpoint, TaskId};

/// The kernel guarantees markers are kept and ordered. It does not dedupe
/// effects a worker replays after resuming.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    entries: Mutex<HashMap<TaskId, Vec<Checkpoint>>>,
}

impl CheckpointManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a marker; sequence numbers start at 1 and strictly increase.
    pub fn record(&self, task_id: TaskId, marker: Value, at: DateTime<Utc>) -> Checkpoint {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let history = entries.entry(task_id).or_default();
        let seq = history.last().map_or(1, |c| c.seq + 1);
        let checkpoint = Checkpoint {
            task_id,
            seq,
            marker,
            at,
        };
        history.push(checkpoint.clone());
        checkpoint
    }

    /// Resume point.
    pub fn latest(&self, task_id: TaskId) -> Option<Checkpoint> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&task_id).and_then(|h| h.last().cloned())
    }

    pub fn history(&self, task_id: TaskId) -> Vec<Checkpoint> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(&task_id).cloned().unwrap_or_default()
    }

    /// Drops markers of an archived task.
    pub fn remove(&self, task_id: TaskId) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&task_id);
    }
}
