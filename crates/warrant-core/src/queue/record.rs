//! Task record: envelope + mutable queue metadata.

use chrono::{DateTime, Utc};

use super::TaskStatus;
use crate::domain::{BudgetLedger, BudgetSpec, ProposedOperation, TaskEnvelope, TaskId, WorkerId};
use crate::error::KernelError;

/// The worker currently holding a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimInfo {
    pub worker: WorkerId,
    pub claimed_at: DateTime<Utc>,
    /// Last worker call on this task (heartbeat).
    pub last_seen: DateTime<Utc>,
}

/// Metadata + envelope for a task in the queue.
///
/// - Single source of truth for task status.
/// - Class queues and the retry heap hold `TaskId`s only.
/// - Every status change goes through [`TaskRecord::transition`].
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub status: TaskStatus,
    pub claim: Option<ClaimInfo>,

    /// Fresh starts (claims from `pending`). Resumes do not count.
    pub attempts: u32,
    pub disconnects: u32,

    pub budget: BudgetLedger,

    /// Partial operations offered if the budget runs out.
    pub staged: Vec<ProposedOperation>,
    pub cancel_requested: bool,
    pub last_error: Option<String>,

    /// When to retry next (for `retry_scheduled`).
    pub next_run_at: Option<DateTime<Utc>>,

    /// Submission order, used for FIFO across class heads.
    pub submitted_seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub terminal_at: Option<DateTime<Utc>>,
}

impl TaskRecord {
    pub fn new(envelope: TaskEnvelope, budget: BudgetSpec, submitted_seq: u64, now: DateTime<Utc>) -> Self {
        Self {
            envelope,
            status: TaskStatus::Pending,
            claim: None,
            attempts: 0,
            disconnects: 0,
            budget: BudgetLedger::new(budget),
            staged: Vec::new(),
            cancel_requested: false,
            last_error: None,
            next_run_at: None,
            submitted_seq,
            created_at: now,
            updated_at: now,
            terminal_at: None,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.envelope.task_id()
    }

    /// Moves to `next` if the status machine allows it. Returns the previous
    /// status.
    pub fn transition(&mut self, next: TaskStatus, now: DateTime<Utc>) -> Result<TaskStatus, KernelError> {
        if !self.status.can_transition_to(&next) {
            return Err(KernelError::InvalidTransition {
                task_id: self.task_id(),
                from: self.status.clone(),
                to: next,
            });
        }
        if next.is_terminal() {
            self.terminal_at = Some(now);
            self.claim = None;
        }
        self.updated_at = now;
        Ok(std::mem::replace(&mut self.status, next))
    }

    /// Hands the task to `worker`. Counts an attempt unless this is a resume.
    pub fn claim(&mut self, worker: WorkerId, now: DateTime<Utc>) -> Result<bool, KernelError> {
        let resumed = self.status == TaskStatus::Resumable;
        self.transition(TaskStatus::InProgress, now)?;
        if !resumed {
            self.attempts += 1;
        }
        self.budget.start(now);
        self.claim = Some(ClaimInfo {
            worker,
            claimed_at: now,
            last_seen: now,
        });
        Ok(resumed)
    }

    pub fn release_claim(&mut self) {
        self.claim = None;
    }

    pub fn claimant(&self) -> Option<&WorkerId> {
        self.claim.as_ref().map(|c| &c.worker)
    }

    pub fn is_claimed_by(&self, worker: &WorkerId) -> bool {
        self.claimant() == Some(worker)
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        if let Some(claim) = self.claim.as_mut() {
            claim.last_seen = now;
        }
    }

    /// Heartbeat silence longer than `grace_ms`.
    pub fn is_stale(&self, now: DateTime<Utc>, grace_ms: u64) -> bool {
        match &self.claim {
            Some(claim) => {
                let silent_ms = (now - claim.last_seen).num_milliseconds();
                silent_ms >= 0 && silent_ms as u64 > grace_ms
            }
            None => false,
        }
    }

    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: String, now: DateTime<Utc>) -> Result<(), KernelError> {
        self.transition(TaskStatus::RetryScheduled, now)?;
        self.claim = None;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        Ok(())
    }

    /// `retry_scheduled` -> `pending`.
    pub fn requeue(&mut self, now: DateTime<Utc>) -> Result<(), KernelError> {
        self.transition(TaskStatus::Pending, now)?;
        self.next_run_at = None;
        Ok(())
    }

    /// Terminal and older than `retention_ms`.
    pub fn is_expired(&self, now: DateTime<Utc>, retention_ms: u64) -> bool {
        match self.terminal_at {
            Some(at) => (now - at).num_milliseconds() >= retention_ms as i64,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::TaskSubmission;
    use crate::domain::TrustContextId;
    use chrono::{Duration, TimeZone};
    use ulid::Ulid;

    fn record() -> TaskRecord {
        let env = TaskSubmission::new("conv", "test", "researcher", "go")
            .into_envelope(TaskId::from_ulid(Ulid::new()), TrustContextId::new("shared"));
        TaskRecord::new(env, BudgetSpec::default(), 0, t0())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn resume_does_not_count_an_attempt() {
        let mut r = record();
        assert!(!r.claim(WorkerId::new("w1"), t0()).unwrap());
        assert_eq!(r.attempts, 1);

        r.transition(TaskStatus::Resumable, t0()).unwrap();
        r.release_claim();
        assert!(r.claim(WorkerId::new("w2"), t0()).unwrap());
        assert_eq!(r.attempts, 1);
        assert!(r.is_claimed_by(&WorkerId::new("w2")));
    }

    #[test]
    fn invalid_transition_is_reported() {
        let mut r = record();
        let err = r.transition(TaskStatus::Completed, t0()).unwrap_err();
        assert!(matches!(err, KernelError::InvalidTransition { .. }));
        assert_eq!(r.status, TaskStatus::Pending);
    }

    #[test]
    fn terminal_transition_releases_claim_and_stamps_time() {
        let mut r = record();
        r.claim(WorkerId::new("w1"), t0()).unwrap();
        r.transition(TaskStatus::Completed, t0() + Duration::seconds(1)).unwrap();
        assert!(r.claim.is_none());
        assert!(!r.is_expired(t0() + Duration::seconds(2), 10_000));
        assert!(r.is_expired(t0() + Duration::seconds(11), 10_000));
    }

    #[test]
    fn staleness_follows_last_seen() {
        let mut r = record();
        r.claim(WorkerId::new("w1"), t0()).unwrap();
        assert!(!r.is_stale(t0() + Duration::milliseconds(500), 1_000));
        assert!(r.is_stale(t0() + Duration::milliseconds(1_001), 1_000));
        r.touch(t0() + Duration::milliseconds(900));
        assert!(!r.is_stale(t0() + Duration::milliseconds(1_500), 1_000));
    }
}
