use std::fmt;

use thiserror::Error;

use crate::domain::{
    ActionId, BudgetDimension, ConversationId, DenyReason, TaskId, TicketId, WorkerId,
};
use crate::queue::TaskStatus;

/// Every problem found by a structural check, reported together.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diagnostics(Vec<String>);

impl Diagnostics {
    pub fn single(message: impl Into<String>) -> Self {
        Self(vec![message.into()])
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn messages(&self) -> &[String] {
        &self.0
    }

    /// `Ok(())` when nothing was reported.
    pub fn into_result(self) -> Result<(), Diagnostics> {
        if self.0.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("; "))
    }
}

impl std::error::Error for Diagnostics {}

#[derive(Debug, Error)]
pub enum KernelError {
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("duplicate task id: {0}")]
    DuplicateTask(TaskId),

    #[error("invalid transition for {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("worker {worker} does not hold {task_id}")]
    NotClaimant { task_id: TaskId, worker: WorkerId },

    #[error("action `{action}` denied for {task_id}: {reason}")]
    CapabilityDenied {
        task_id: TaskId,
        action: ActionId,
        reason: DenyReason,
    },

    #[error("budget exceeded for {task_id}: {dimension}")]
    BudgetExceeded {
        task_id: TaskId,
        dimension: BudgetDimension,
    },

    #[error("cancellation requested for {0}")]
    CancelRequested(TaskId),

    #[error("worker disconnected from {task_id}")]
    WorkerDisconnected { task_id: TaskId },

    #[error("validation failed: {0}")]
    ValidationFailed(Diagnostics),

    #[error("submission rejected for conversation {conversation_id}: {reason}")]
    AdmissionRejected {
        conversation_id: ConversationId,
        reason: String,
    },

    #[error("no review for {0}")]
    ReviewNotFound(TaskId),

    #[error("review for {0} is already closed")]
    ReviewClosed(TaskId),

    #[error("approval ticket not found: {0}")]
    TicketNotFound(TicketId),

    #[error("applying operations failed: {0}")]
    ApplyFailed(String),

    #[error("action execution failed: {0}")]
    ActionFailed(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<Diagnostics> for KernelError {
    fn from(value: Diagnostics) -> Self {
        KernelError::ValidationFailed(value)
    }
}
