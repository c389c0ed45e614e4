use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ids::TaskId;

/// Progress marker. The latest one per task is the resume point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub task_id: TaskId,
    pub seq: u64,
    /// Opaque to the kernel.
    pub marker: Value,
    pub at: DateTime<Utc>,
}

/// Returned to the worker for every checkpoint it records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointAck {
    pub seq: u64,
    /// The submitter asked to stop. The worker should fail with `cancelled`.
    pub cancel_requested: bool,
}
