//! Queue module: status machine, records, retry backoff and the in-memory
//! task queue.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::InMemoryTaskQueue;
pub use record::{ClaimInfo, TaskRecord};
pub use retry::RetryPolicy;
pub use state::{FailureReason, TaskStatus};

use crate::domain::{
    AgentId, BudgetDimension, BudgetRemaining, Checkpoint, ProposedOperation, TaskEnvelope,
    TaskId, TrustContextId, WorkerId,
};

/// What a worker receives from `claim_next`.
///
/// On a resume, `resume_from` is the latest checkpoint; the envelope is the
/// original, unchanged one.
#[derive(Debug, Clone)]
pub struct Claim {
    pub envelope: TaskEnvelope,
    pub attempt: u32,
    pub resumed: bool,
    pub resume_from: Option<Checkpoint>,
    pub cancel_requested: bool,
    pub budget: BudgetRemaining,
}

impl Claim {
    pub fn task_id(&self) -> TaskId {
        self.envelope.task_id()
    }
}

/// The slice of a task the policy kernel needs.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyView {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub trust_context: TrustContextId,
    pub status: TaskStatus,
    pub claimant: Option<WorkerId>,
}

/// Why a budget charge did not go through.
#[derive(Debug, Clone)]
pub enum ChargeError {
    NotFound,
    NotActive,
    NotClaimant,
    /// The task has been failed with `budget_exceeded` and its claim released.
    Exhausted {
        dimension: BudgetDimension,
        envelope: TaskEnvelope,
        staged: Vec<ProposedOperation>,
    },
}

/// A task failed for budget reasons outside the policy path.
#[derive(Debug, Clone)]
pub struct BudgetExpiry {
    pub envelope: TaskEnvelope,
    pub staged: Vec<ProposedOperation>,
}

/// Tasks touched by one reaper sweep.
#[derive(Debug, Clone, Default)]
pub struct ReapReport {
    pub resumable: Vec<TaskId>,
    pub disconnected: Vec<TaskId>,
    /// Duration budget ran out while in progress.
    pub budget_exceeded: Vec<BudgetExpiry>,
    pub promoted: Vec<TaskId>,
    pub archived: Vec<TaskId>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.resumable.is_empty()
            && self.disconnected.is_empty()
            && self.budget_exceeded.is_empty()
            && self.promoted.is_empty()
            && self.archived.is_empty()
    }
}
