//! Task status machine.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Why a task ended in `failed`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded,
    Disconnected,
    RetriesExhausted { code: String },
    /// Non-retryable failure reported by the worker.
    Worker { code: String },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::BudgetExceeded => f.write_str("budget_exceeded"),
            FailureReason::Disconnected => f.write_str("disconnected"),
            FailureReason::RetriesExhausted { code } => write!(f, "retries_exhausted({code})"),
            FailureReason::Worker { code } => f.write_str(code),
        }
    }
}

/// Task status.
///
/// Transitions:
/// - pending -> in_progress
/// - in_progress -> completed | failed | cancelled | awaiting_clarification | resumable | retry_scheduled
/// - awaiting_clarification -> in_progress | cancelled
/// - resumable -> in_progress | failed(disconnected) | cancelled
/// - retry_scheduled -> pending | cancelled
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    /// Suspended on a clarification question. No timeout.
    AwaitingClarification,
    /// Claim released after a disconnect; any capable worker may resume it.
    Resumable,
    RetryScheduled,
    Completed,
    Failed(FailureReason),
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed(_) | TaskStatus::Cancelled
        )
    }

    /// Eligible for `claim_next`.
    pub fn is_claimable(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Resumable)
    }

    /// A worker holds the task (possibly suspended on a question).
    pub fn is_held(&self) -> bool {
        matches!(
            self,
            TaskStatus::InProgress | TaskStatus::AwaitingClarification
        )
    }

    pub fn can_transition_to(&self, next: &TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (Pending, Cancelled) => true,
            (
                InProgress,
                Completed | Failed(_) | Cancelled | AwaitingClarification | Resumable
                | RetryScheduled,
            ) => true,
            (AwaitingClarification, InProgress | Cancelled) => true,
            (Resumable, InProgress | Cancelled) => true,
            (Resumable, Failed(FailureReason::Disconnected)) => true,
            (RetryScheduled, Pending | Cancelled) => true,
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::AwaitingClarification => "awaiting_clarification",
            TaskStatus::Resumable => "resumable",
            TaskStatus::RetryScheduled => "retry_scheduled",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed(_) => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Failed(reason) => write!(f, "failed({reason})"),
            other => f.write_str(other.name()),
        }
    }
}
