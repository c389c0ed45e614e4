//! Status views for operators and submitters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AgentId, BudgetRemaining, ConversationId, TaskId, WorkerId};
use crate::queue::TaskStatus;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub pending: usize,
    pub in_progress: usize,
    pub awaiting_clarification: usize,
    pub resumable: usize,
    pub retry_scheduled: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl TaskCounts {
    pub fn add(&mut self, status: &TaskStatus) {
        match status {
            TaskStatus::Pending => self.pending += 1,
            TaskStatus::InProgress => self.in_progress += 1,
            TaskStatus::AwaitingClarification => self.awaiting_clarification += 1,
            TaskStatus::Resumable => self.resumable += 1,
            TaskStatus::RetryScheduled => self.retry_scheduled += 1,
            TaskStatus::Completed => self.completed += 1,
            TaskStatus::Failed(_) => self.failed += 1,
            TaskStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending
            + self.in_progress
            + self.awaiting_clarification
            + self.resumable
            + self.retry_scheduled
            + self.completed
            + self.failed
            + self.cancelled
    }
}

/// Point-in-time view of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub task_id: TaskId,
    pub conversation_id: ConversationId,
    pub agent_id: AgentId,
    pub status: TaskStatus,
    pub claimant: Option<WorkerId>,
    pub attempts: u32,
    pub disconnects: u32,
    pub cancel_requested: bool,
    pub budget: BudgetRemaining,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
