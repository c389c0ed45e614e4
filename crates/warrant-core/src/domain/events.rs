//! Per-task event vocabulary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::proposal::{ProposalBundle, ProposedOperation};
use crate::queue::TaskStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Clarification {
    Asked { question: String },
    Answered { answer: String },
}

/// Event payload, tagged by `type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    Status {
        status: TaskStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    Log {
        level: LogLevel,
        message: String,
    },
    Clarification(Clarification),
    /// Terminal success.
    ProposedOps(ProposalBundle),
    Error {
        code: String,
        retryable: bool,
        message: String,
    },
}

/// One entry on a task's channel. `seq` is dense and starts at 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEvent {
    pub task_id: TaskId,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl TaskEvent {
    /// Whether this event closes the channel.
    pub fn is_terminal(&self) -> bool {
        matches!(&self.kind, EventKind::Status { status, .. } if status.is_terminal())
    }
}

/// What a worker may report while it holds a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ProgressReport {
    Status { detail: String },
    Log { level: LogLevel, message: String },
    /// Suspends the task until the submitter answers.
    Clarification { question: String },
    /// Partial operations kept aside in case the budget runs out.
    Staged { ops: Vec<ProposedOperation> },
}

/// Failure as reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub code: String,
    pub retryable: bool,
    #[serde(default)]
    pub message: String,
}

impl FailureReport {
    /// Code a worker uses to acknowledge a cancellation request.
    pub const CANCELLED: &'static str = "cancelled";

    pub fn new(code: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            retryable,
            message: String::new(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, false)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.code == Self::CANCELLED
    }
}
