//! In-memory task queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

use super::{
    BudgetExpiry, ChargeError, Claim, FailureReason, PolicyView, ReapReport, TaskRecord,
    TaskStatus,
};
use crate::audit::AuditLog;
use crate::checkpoint::CheckpointManager;
use crate::config::{AdmissionConfig, KernelConfig};
use crate::domain::{
    ActionClass, Actor, AuditDecision, AuditEntry, BudgetDimension, BudgetRemaining, BudgetSpec,
    CapabilitySet, Checkpoint, CheckpointAck, Clarification, ConversationId, EventKind,
    FailureReport, InteractionStyle, LogLevel, ProgressReport, ProposalBundle, ProposedOperation,
    TaskEnvelope, TaskId, WorkerId, proposal,
};
use crate::error::{Diagnostics, KernelError};
use crate::events::EventHub;
use crate::observability::{TaskCounts, TaskView};
use crate::ports::{Clock, ReferenceResolver};

/// Retry entry. Reverse ordering makes `BinaryHeap` a min-heap on time.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    next_run_at: DateTime<Utc>,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .next_run_at
            .cmp(&self.next_run_at)
            .then_with(|| other.task_id.cmp(&self.task_id))
    }
}

/// FIFO of one capability class (tasks with an identical requested set).
struct ClassQueue {
    capabilities: CapabilitySet,
    ids: VecDeque<TaskId>,
}

struct QueueState {
    /// Single source of truth for tasks.
    records: HashMap<TaskId, TaskRecord>,

    /// Class queues, keyed by `CapabilitySet::class_key`. May hold stale ids;
    /// they are skipped when they reach the head.
    classes: HashMap<String, ClassQueue>,

    /// Retry backoff.
    scheduled: BinaryHeap<ScheduledTask>,

    /// Ids of archived tasks, kept so they cannot be reused.
    archived: HashSet<TaskId>,

    last_submit: HashMap<ConversationId, DateTime<Utc>>,

    next_seq: u64,
}

impl QueueState {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            classes: HashMap::new(),
            scheduled: BinaryHeap::new(),
            archived: HashSet::new(),
            last_submit: HashMap::new(),
            next_seq: 0,
        }
    }

    fn enqueue(&mut self, task_id: TaskId, capabilities: &CapabilitySet, front: bool) {
        let class = self
            .classes
            .entry(capabilities.class_key())
            .or_insert_with(|| ClassQueue {
                capabilities: capabilities.clone(),
                ids: VecDeque::new(),
            });
        if front {
            class.ids.push_front(task_id);
        } else {
            class.ids.push_back(task_id);
        }
    }

    /// Oldest eligible class head; resumable heads go first.
    fn pick(&mut self, capabilities: &CapabilitySet) -> Option<TaskId> {
        let QueueState {
            records, classes, ..
        } = self;

        let mut best: Option<((bool, u64), String)> = None;
        for (key, class) in classes.iter_mut() {
            if !capabilities.is_superset_of(&class.capabilities) {
                continue;
            }
            while let Some(head) = class.ids.front() {
                if records.get(head).is_some_and(|r| r.status.is_claimable()) {
                    break;
                }
                class.ids.pop_front();
            }
            let Some(record) = class.ids.front().and_then(|head| records.get(head)) else {
                continue;
            };
            let rank = (
                record.status != TaskStatus::Resumable,
                record.submitted_seq,
            );
            if best.as_ref().is_none_or(|(current, _)| rank < *current) {
                best = Some((rank, key.clone()));
            }
        }

        let (_, key) = best?;
        classes.get_mut(&key)?.ids.pop_front()
    }

    /// Moves due retries back to `pending`.
    fn promote_scheduled(&mut self, now: DateTime<Utc>) -> Vec<TaskId> {
        let mut promoted = Vec::new();
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break; // heap is sorted
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            let Some(record) = self.records.get_mut(&entry.task_id) else {
                continue;
            };
            if record.status != TaskStatus::RetryScheduled
                || record.next_run_at != Some(entry.next_run_at)
            {
                continue;
            }
            if record.requeue(now).is_err() {
                continue;
            }
            let capabilities = record.envelope.requested_capabilities().clone();
            self.enqueue(entry.task_id, &capabilities, false);
            promoted.push(entry.task_id);
        }
        promoted
    }

    /// Per-conversation dispatch guard.
    fn admit(
        &self,
        envelope: &TaskEnvelope,
        admission: &AdmissionConfig,
        now: DateTime<Utc>,
    ) -> Result<(), String> {
        let conversation = envelope.conversation_id();
        if let Some(max) = admission.max_pending_per_conversation {
            let open = self
                .records
                .values()
                .filter(|r| r.envelope.conversation_id() == conversation && !r.status.is_terminal())
                .count();
            if open >= max {
                return Err(format!("{open} tasks already open (max {max})"));
            }
        }
        if let Some(min_ms) = admission.min_submit_interval_ms
            && let Some(last) = self.last_submit.get(conversation)
        {
            let since = (now - *last).num_milliseconds();
            if since < min_ms as i64 {
                return Err(format!(
                    "submitted {since}ms after the previous task (min {min_ms}ms)"
                ));
            }
        }
        Ok(())
    }

    fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts::default();
        for record in self.records.values() {
            counts.add(&record.status);
        }
        counts
    }
}

/// The record `worker` currently holds.
fn held_by<'a>(
    records: &'a mut HashMap<TaskId, TaskRecord>,
    task_id: TaskId,
    worker: &WorkerId,
) -> Result<&'a mut TaskRecord, KernelError> {
    let record = records
        .get_mut(&task_id)
        .ok_or(KernelError::TaskNotFound(task_id))?;
    if !record.is_claimed_by(worker) {
        return Err(KernelError::NotClaimant {
            task_id,
            worker: worker.clone(),
        });
    }
    Ok(record)
}

/// In-memory task queue.
///
/// One `tokio::sync::Mutex` guards all records. Event, audit and checkpoint
/// stores are leaves: they are called with the queue lock held and never call
/// back.
pub struct InMemoryTaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    events: Arc<EventHub>,
    audit: Arc<AuditLog>,
    checkpoints: Arc<CheckpointManager>,
    clock: Arc<dyn Clock>,
    config: KernelConfig,
}

impl InMemoryTaskQueue {
    pub fn new(
        config: KernelConfig,
        clock: Arc<dyn Clock>,
        events: Arc<EventHub>,
        audit: Arc<AuditLog>,
        checkpoints: Arc<CheckpointManager>,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState::new()),
            notify: Notify::new(),
            events,
            audit,
            checkpoints,
            clock,
            config,
        }
    }

    fn publish_status(
        &self,
        task_id: TaskId,
        status: TaskStatus,
        detail: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.events
            .publish(task_id, EventKind::Status { status, detail }, now);
    }

    /// Fails a task for budget exhaustion and hands back its staged operations.
    fn exhaust(
        &self,
        record: &mut TaskRecord,
        dimension: BudgetDimension,
        now: DateTime<Utc>,
    ) -> Result<Vec<ProposedOperation>, KernelError> {
        let task_id = record.task_id();
        record.transition(TaskStatus::Failed(FailureReason::BudgetExceeded), now)?;
        record.last_error = Some(format!("budget exceeded: {dimension}"));
        let staged = std::mem::take(&mut record.staged);
        self.events.publish(
            task_id,
            EventKind::Error {
                code: "budget_exceeded".into(),
                retryable: false,
                message: format!("{dimension} budget exhausted"),
            },
            now,
        );
        self.publish_status(task_id, record.status.clone(), Some(dimension.to_string()), now);
        warn!(task_id = %task_id, %dimension, staged = staged.len(), "budget exceeded");
        Ok(staged)
    }

    /// Adds a sealed envelope in `pending`.
    pub async fn submit(&self, envelope: TaskEnvelope, budget: BudgetSpec) -> Result<TaskId, KernelError> {
        let now = self.clock.now();
        let task_id = envelope.task_id();
        let submitter = Actor::Submitter(envelope.origin().submitter.clone());

        let mut state = self.state.lock().await;
        if state.records.contains_key(&task_id) || state.archived.contains(&task_id) {
            return Err(KernelError::DuplicateTask(task_id));
        }
        if let Err(reason) = state.admit(&envelope, &self.config.admission, now) {
            warn!(task_id = %task_id, conversation = %envelope.conversation_id(), %reason, "submission rejected");
            self.audit
                .append(
                    AuditEntry::lifecycle(task_id, submitter, "submit", AuditDecision::Rejected)
                        .with_detail(reason.clone()),
                )
                .await;
            return Err(KernelError::AdmissionRejected {
                conversation_id: envelope.conversation_id().clone(),
                reason,
            });
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let capabilities = envelope.requested_capabilities().clone();
        state
            .last_submit
            .insert(envelope.conversation_id().clone(), now);
        state
            .records
            .insert(task_id, TaskRecord::new(envelope, budget, seq, now));
        state.enqueue(task_id, &capabilities, false);

        self.publish_status(task_id, TaskStatus::Pending, None, now);
        self.audit
            .append(AuditEntry::lifecycle(
                task_id,
                submitter,
                "submit",
                AuditDecision::Recorded,
            ))
            .await;
        drop(state);

        self.notify.notify_waiters();
        info!(task_id = %task_id, class = %capabilities.class_key(), "task submitted");
        Ok(task_id)
    }

    /// Atomically claims the best eligible task, if any.
    ///
    /// Cancel safe: every wait happens before the queue is touched, so a
    /// dropped call leaves no half-made claim.
    pub async fn claim_next(&self, worker: &WorkerId, capabilities: &CapabilitySet) -> Option<Claim> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let mut audit = self.audit.writer().await;

        for task_id in state.promote_scheduled(now) {
            self.publish_status(task_id, TaskStatus::Pending, Some("retry".into()), now);
        }

        let task_id = state.pick(capabilities)?;
        let record = state.records.get_mut(&task_id)?;
        let resumed = match record.claim(worker.clone(), now) {
            Ok(resumed) => resumed,
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "claim failed");
                return None;
            }
        };

        let claim = Claim {
            envelope: record.envelope.clone(),
            attempt: record.attempts,
            resumed,
            resume_from: self.checkpoints.latest(task_id),
            cancel_requested: record.cancel_requested,
            budget: record.budget.remaining(now),
        };

        let verb = if resumed { "resume" } else { "claim" };
        self.publish_status(
            task_id,
            TaskStatus::InProgress,
            Some(format!("{verb}ed by {worker}")),
            now,
        );
        audit.push(AuditEntry::lifecycle(
            task_id,
            Actor::Worker(worker.clone()),
            verb,
            AuditDecision::Recorded,
        ));

        info!(task_id = %task_id, worker = %worker, attempt = claim.attempt, resumed, "task claimed");
        Some(claim)
    }

    /// Like [`claim_next`](Self::claim_next) but idles until a task appears
    /// or `timeout` passes.
    pub async fn claim_next_wait(
        &self,
        worker: &WorkerId,
        capabilities: &CapabilitySet,
        timeout: Duration,
    ) -> Option<Claim> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register before looking so a submit in between is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(claim) = self.claim_next(worker, capabilities).await {
                return Some(claim);
            }

            tokio::select! {
                _ = notified.as_mut() => {}
                _ = tokio::time::sleep_until(deadline) => return None,
            }
        }
    }

    /// Heartbeat.
    pub async fn touch(&self, task_id: TaskId, worker: &WorkerId) -> Result<(), KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        held_by(&mut state.records, task_id, worker)?.touch(now);
        debug!(task_id = %task_id, worker = %worker, "heartbeat");
        Ok(())
    }

    pub async fn report_progress(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        report: ProgressReport,
    ) -> Result<(), KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = held_by(&mut state.records, task_id, worker)?;
        record.touch(now);

        match report {
            ProgressReport::Status { detail } => {
                self.publish_status(task_id, record.status.clone(), Some(detail), now);
            }
            ProgressReport::Log { level, message } => {
                self.events
                    .publish(task_id, EventKind::Log { level, message }, now);
            }
            ProgressReport::Clarification { question } => {
                if record.envelope.interaction_style() == InteractionStyle::Silent {
                    return Err(KernelError::ValidationFailed(Diagnostics::single(
                        "silent tasks cannot ask for clarification",
                    )));
                }
                // nobody is left to answer
                if record.cancel_requested {
                    return Err(KernelError::CancelRequested(task_id));
                }
                record.transition(TaskStatus::AwaitingClarification, now)?;
                self.events.publish(
                    task_id,
                    EventKind::Clarification(Clarification::Asked { question }),
                    now,
                );
                self.publish_status(task_id, TaskStatus::AwaitingClarification, None, now);
                info!(task_id = %task_id, "awaiting clarification");
            }
            ProgressReport::Staged { ops } => {
                record.staged.extend(ops);
                let message = format!("{} operations staged", record.staged.len());
                self.events.publish(
                    task_id,
                    EventKind::Log {
                        level: LogLevel::Debug,
                        message,
                    },
                    now,
                );
            }
        }
        Ok(())
    }

    /// Resumes a task suspended on a question. The answer is delivered on the
    /// task's event channel.
    pub async fn answer_clarification(&self, task_id: TaskId, answer: String) -> Result<(), KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&task_id)
            .ok_or(KernelError::TaskNotFound(task_id))?;
        if record.status != TaskStatus::AwaitingClarification {
            return Err(KernelError::InvalidTransition {
                task_id,
                from: record.status.clone(),
                to: TaskStatus::InProgress,
            });
        }
        record.transition(TaskStatus::InProgress, now)?;
        record.touch(now);

        self.events.publish(
            task_id,
            EventKind::Clarification(Clarification::Answered { answer }),
            now,
        );
        self.publish_status(
            task_id,
            TaskStatus::InProgress,
            Some("clarification answered".into()),
            now,
        );
        self.audit
            .append(AuditEntry::lifecycle(
                task_id,
                Actor::Human,
                "clarification_answered",
                AuditDecision::Recorded,
            ))
            .await;
        Ok(())
    }

    pub async fn checkpoint(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        marker: Value,
    ) -> Result<CheckpointAck, KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = held_by(&mut state.records, task_id, worker)?;
        record.touch(now);
        let checkpoint = self.checkpoints.record(task_id, marker, now);
        debug!(task_id = %task_id, seq = checkpoint.seq, "checkpoint recorded");
        Ok(CheckpointAck {
            seq: checkpoint.seq,
            cancel_requested: record.cancel_requested,
        })
    }

    /// Latest checkpoint of a known task.
    pub async fn resume_point(&self, task_id: TaskId) -> Result<Option<Checkpoint>, KernelError> {
        let state = self.state.lock().await;
        if !state.records.contains_key(&task_id) {
            return Err(KernelError::TaskNotFound(task_id));
        }
        Ok(self.checkpoints.latest(task_id))
    }

    /// Terminal success. The bundle is validated against `resolver`, or the
    /// envelope's snapshot when none is given; an invalid bundle leaves the
    /// task in progress.
    pub async fn complete(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        bundle: ProposalBundle,
        resolver: Option<&dyn ReferenceResolver>,
    ) -> Result<TaskEnvelope, KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = held_by(&mut state.records, task_id, worker)?;
        record.touch(now);
        if record.status != TaskStatus::InProgress {
            return Err(KernelError::InvalidTransition {
                task_id,
                from: record.status.clone(),
                to: TaskStatus::Completed,
            });
        }

        let checked = match resolver {
            Some(resolver) => proposal::validate(&bundle.proposed_ops, resolver),
            None => proposal::validate(&bundle.proposed_ops, record.envelope.context_snapshot()),
        };
        if let Err(diagnostics) = checked {
            warn!(task_id = %task_id, %diagnostics, "completion rejected");
            self.audit
                .append(
                    AuditEntry::lifecycle(
                        task_id,
                        Actor::Worker(worker.clone()),
                        "complete",
                        AuditDecision::Fault,
                    )
                    .with_detail(diagnostics.to_string()),
                )
                .await;
            return Err(KernelError::ValidationFailed(diagnostics));
        }

        record.transition(TaskStatus::Completed, now)?;
        record.staged.clear();
        let envelope = record.envelope.clone();
        let op_count = bundle.proposed_ops.len();

        self.events
            .publish(task_id, EventKind::ProposedOps(bundle), now);
        self.publish_status(task_id, TaskStatus::Completed, None, now);
        self.audit
            .append(
                AuditEntry::lifecycle(
                    task_id,
                    Actor::Worker(worker.clone()),
                    "complete",
                    AuditDecision::Recorded,
                )
                .with_detail(format!("{op_count} proposed operations")),
            )
            .await;

        info!(task_id = %task_id, worker = %worker, ops = op_count, "task completed");
        Ok(envelope)
    }

    /// Worker-reported failure. Returns the status the task moved to.
    ///
    /// Retryable failures are rescheduled with backoff until `max_attempts`;
    /// code `cancelled` acknowledges a pending cancellation.
    pub async fn fail(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        report: FailureReport,
    ) -> Result<TaskStatus, KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let QueueState {
            records, scheduled, ..
        } = &mut *state;
        let record = held_by(records, task_id, worker)?;

        let next = if report.is_cancellation() && record.cancel_requested {
            TaskStatus::Cancelled
        } else if report.retryable && record.attempts < self.config.max_attempts {
            TaskStatus::RetryScheduled
        } else if report.retryable {
            TaskStatus::Failed(FailureReason::RetriesExhausted {
                code: report.code.clone(),
            })
        } else {
            TaskStatus::Failed(FailureReason::Worker {
                code: report.code.clone(),
            })
        };

        let error = if report.message.is_empty() {
            report.code.clone()
        } else {
            format!("{}: {}", report.code, report.message)
        };

        if next == TaskStatus::RetryScheduled {
            let delay = self.config.retry.next_delay(record.attempts);
            let next_run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            record.schedule_retry(next_run_at, error.clone(), now)?;
            scheduled.push(ScheduledTask {
                next_run_at,
                task_id,
            });
            info!(task_id = %task_id, attempt = record.attempts, delay_ms = delay.as_millis() as u64, "retry scheduled");
        } else {
            record.transition(next.clone(), now)?;
            record.last_error = Some(error.clone());
            info!(task_id = %task_id, status = %next, "task ended");
        }

        if next != TaskStatus::Cancelled {
            self.events.publish(
                task_id,
                EventKind::Error {
                    code: report.code.clone(),
                    retryable: report.retryable,
                    message: report.message.clone(),
                },
                now,
            );
        }
        self.publish_status(task_id, next.clone(), None, now);
        self.audit
            .append(
                AuditEntry::lifecycle(
                    task_id,
                    Actor::Worker(worker.clone()),
                    "fail",
                    if next == TaskStatus::Cancelled {
                        AuditDecision::Recorded
                    } else {
                        AuditDecision::Fault
                    },
                )
                .with_detail(error),
            )
            .await;
        Ok(next)
    }

    /// Submitter cancellation.
    ///
    /// Queued tasks end at once. Held tasks get `cancel_requested`, which the
    /// worker sees as a status event and on its next checkpoint ack.
    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskStatus, KernelError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state
            .records
            .get_mut(&task_id)
            .ok_or(KernelError::TaskNotFound(task_id))?;
        let submitter = Actor::Submitter(record.envelope.origin().submitter.clone());

        match record.status {
            TaskStatus::Pending | TaskStatus::Resumable | TaskStatus::RetryScheduled => {
                record.transition(TaskStatus::Cancelled, now)?;
                record.next_run_at = None;
                self.publish_status(task_id, TaskStatus::Cancelled, None, now);
                self.audit
                    .append(AuditEntry::lifecycle(
                        task_id,
                        submitter,
                        "cancel",
                        AuditDecision::Recorded,
                    ))
                    .await;
                info!(task_id = %task_id, "task cancelled");
                Ok(TaskStatus::Cancelled)
            }
            TaskStatus::InProgress | TaskStatus::AwaitingClarification => {
                if !record.cancel_requested {
                    record.cancel_requested = true;
                    self.publish_status(
                        task_id,
                        record.status.clone(),
                        Some("cancel_requested".into()),
                        now,
                    );
                    self.audit
                        .append(AuditEntry::lifecycle(
                            task_id,
                            submitter,
                            "cancel_requested",
                            AuditDecision::Recorded,
                        ))
                        .await;
                    info!(task_id = %task_id, "cancellation requested");
                }
                Ok(record.status.clone())
            }
            _ => Err(KernelError::InvalidTransition {
                task_id,
                from: record.status.clone(),
                to: TaskStatus::Cancelled,
            }),
        }
    }

    /// Identity and status for the policy kernel. Counts as a heartbeat for
    /// the claimant.
    pub async fn policy_view(&self, task_id: TaskId, worker: &WorkerId) -> Option<PolicyView> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&task_id)?;
        if record.is_claimed_by(worker) {
            record.touch(now);
        }
        Some(PolicyView {
            task_id,
            agent_id: record.envelope.agent_id().clone(),
            trust_context: record.envelope.trust_context().clone(),
            status: record.status.clone(),
            claimant: record.claimant().cloned(),
        })
    }

    /// Charges one allowed action to the task budget.
    ///
    /// On exhaustion the task is failed with `budget_exceeded` before this
    /// returns.
    pub async fn charge(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        class: &ActionClass,
    ) -> Result<BudgetRemaining, ChargeError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let record = state.records.get_mut(&task_id).ok_or(ChargeError::NotFound)?;
        if record.status != TaskStatus::InProgress {
            return Err(ChargeError::NotActive);
        }
        if !record.is_claimed_by(worker) {
            return Err(ChargeError::NotClaimant);
        }
        record.touch(now);

        match record.budget.consume(class, now) {
            Ok(()) => Ok(record.budget.remaining(now)),
            Err(dimension) => {
                let staged = self
                    .exhaust(record, dimension, now)
                    .map_err(|_| ChargeError::NotActive)?;
                Err(ChargeError::Exhausted {
                    dimension,
                    envelope: record.envelope.clone(),
                    staged,
                })
            }
        }
    }

    /// One reaper sweep: duration budgets, disconnects, due retries and
    /// archival.
    pub async fn reap(&self) -> ReapReport {
        let now = self.clock.now();
        let grace_ms = self.config.disconnect_grace_ms;
        let mut report = ReapReport::default();
        let mut audits = Vec::new();
        let mut requeue = Vec::new();

        let mut state = self.state.lock().await;
        for record in state.records.values_mut() {
            if record.status != TaskStatus::InProgress {
                continue;
            }
            let task_id = record.task_id();

            if record.budget.duration_expired(now) {
                match self.exhaust(record, BudgetDimension::Duration, now) {
                    Ok(staged) => {
                        audits.push(
                            AuditEntry::lifecycle(task_id, Actor::Reaper, "budget_exceeded", AuditDecision::Fault)
                                .with_detail(BudgetDimension::Duration.to_string()),
                        );
                        report.budget_exceeded.push(BudgetExpiry {
                            envelope: record.envelope.clone(),
                            staged,
                        });
                    }
                    Err(err) => warn!(task_id = %task_id, error = %err, "duration expiry failed"),
                }
                continue;
            }

            if !record.is_stale(now, grace_ms) {
                continue;
            }
            let worker = record
                .claimant()
                .map(ToString::to_string)
                .unwrap_or_default();
            if let Err(err) = record.transition(TaskStatus::Resumable, now) {
                warn!(task_id = %task_id, error = %err, "disconnect handling failed");
                continue;
            }
            record.release_claim();
            record.disconnects += 1;

            if record.disconnects > self.config.max_disconnects {
                let failed = TaskStatus::Failed(FailureReason::Disconnected);
                if record.transition(failed.clone(), now).is_ok() {
                    record.last_error = Some("worker disconnected".into());
                    self.events.publish(
                        task_id,
                        EventKind::Error {
                            code: "disconnected".into(),
                            retryable: false,
                            message: format!("{} disconnects", record.disconnects),
                        },
                        now,
                    );
                    self.publish_status(task_id, failed, None, now);
                    audits.push(
                        AuditEntry::lifecycle(task_id, Actor::Reaper, "disconnect", AuditDecision::Fault)
                            .with_detail(format!("worker {worker}; giving up after {} disconnects", record.disconnects)),
                    );
                    report.disconnected.push(task_id);
                    warn!(task_id = %task_id, worker = %worker, "task failed after repeated disconnects");
                }
            } else {
                self.publish_status(
                    task_id,
                    TaskStatus::Resumable,
                    Some(format!("worker {worker} went silent")),
                    now,
                );
                audits.push(
                    AuditEntry::lifecycle(task_id, Actor::Reaper, "disconnect", AuditDecision::Recorded)
                        .with_detail(format!("worker {worker}")),
                );
                requeue.push((task_id, record.envelope.requested_capabilities().clone()));
                report.resumable.push(task_id);
                warn!(task_id = %task_id, worker = %worker, disconnects = record.disconnects, "worker disconnected; task resumable");
            }
        }

        for (task_id, capabilities) in requeue {
            state.enqueue(task_id, &capabilities, true);
        }

        for task_id in state.promote_scheduled(now) {
            self.publish_status(task_id, TaskStatus::Pending, Some("retry".into()), now);
            report.promoted.push(task_id);
        }

        let retention_ms = self.config.retention_ms;
        let expired: Vec<TaskId> = state
            .records
            .values()
            .filter(|r| r.is_expired(now, retention_ms))
            .map(TaskRecord::task_id)
            .collect();
        for task_id in expired {
            state.records.remove(&task_id);
            state.archived.insert(task_id);
            self.events.remove(task_id);
            self.checkpoints.remove(task_id);
            report.archived.push(task_id);
        }

        for entry in audits {
            self.audit.append(entry).await;
        }
        drop(state);

        if !report.resumable.is_empty() || !report.promoted.is_empty() {
            self.notify.notify_waiters();
        }
        if !report.is_empty() {
            info!(
                resumable = report.resumable.len(),
                disconnected = report.disconnected.len(),
                budget_exceeded = report.budget_exceeded.len(),
                promoted = report.promoted.len(),
                archived = report.archived.len(),
                "reaper sweep"
            );
        }
        report
    }

    pub async fn counts(&self) -> TaskCounts {
        self.state.lock().await.counts()
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskView, KernelError> {
        let now = self.clock.now();
        let state = self.state.lock().await;
        let record = state
            .records
            .get(&task_id)
            .ok_or(KernelError::TaskNotFound(task_id))?;
        Ok(TaskView {
            task_id,
            conversation_id: record.envelope.conversation_id().clone(),
            agent_id: record.envelope.agent_id().clone(),
            status: record.status.clone(),
            claimant: record.claimant().cloned(),
            attempts: record.attempts,
            disconnects: record.disconnects,
            cancel_requested: record.cancel_requested,
            budget: record.budget.remaining(now),
            last_error: record.last_error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    pub async fn envelope(&self, task_id: TaskId) -> Result<TaskEnvelope, KernelError> {
        let state = self.state.lock().await;
        state
            .records
            .get(&task_id)
            .map(|r| r.envelope.clone())
            .ok_or(KernelError::TaskNotFound(task_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ContextSnapshot, NodeId, TaskSubmission, TrustContextId};
    use crate::ports::{FixedClock, UlidGenerator};
    use chrono::TimeZone;
    use serde_json::json;
    use ulid::Ulid;

    struct Fixture {
        queue: InMemoryTaskQueue,
        clock: Arc<FixedClock>,
        events: Arc<EventHub>,
        audit: Arc<AuditLog>,
    }

    fn fixture(config: KernelConfig) -> Fixture {
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let events = Arc::new(EventHub::new());
        let audit = Arc::new(AuditLog::new(
            Arc::clone(&dyn_clock),
            Arc::new(UlidGenerator::new(Arc::clone(&dyn_clock))),
        ));
        let queue = InMemoryTaskQueue::new(
            config,
            dyn_clock,
            Arc::clone(&events),
            Arc::clone(&audit),
            Arc::new(CheckpointManager::new()),
        );
        Fixture {
            queue,
            clock,
            events,
            audit,
        }
    }

    fn envelope(conversation: &str, caps: &[&str]) -> TaskEnvelope {
        TaskSubmission::new(conversation, "test", "researcher", "look into it")
            .with_capabilities(caps.iter().copied().collect())
            .with_snapshot(ContextSnapshot::new(1, [NodeId::new("root")]))
            .into_envelope(
                TaskId::from_ulid(Ulid::new()),
                TrustContextId::new("shared"),
            )
    }

    fn caps(caps: &[&str]) -> CapabilitySet {
        caps.iter().copied().collect()
    }

    fn w(name: &str) -> WorkerId {
        WorkerId::new(name)
    }

    #[tokio::test]
    async fn submit_and_counts() {
        let f = fixture(KernelConfig::default());
        f.queue
            .submit(envelope("c1", &["research"]), BudgetSpec::default())
            .await
            .unwrap();

        let counts = f.queue.counts().await;
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.in_progress, 0);
    }

    #[tokio::test]
    async fn abandoned_claim_leaves_the_task_pending() {
        let f = fixture(KernelConfig::default());
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();

        // the audit log is busy, so the claim is still waiting when dropped
        let busy = f.audit.writer().await;
        let dropped =
            tokio::time::timeout(Duration::from_millis(10), f.queue.claim_next(&w("w1"), &caps(&[])))
                .await;
        assert!(dropped.is_err());
        drop(busy);

        assert_eq!(f.queue.status(id).await.unwrap().status, TaskStatus::Pending);
        let claim = f.queue.claim_next(&w("w2"), &caps(&[])).await.unwrap();
        assert_eq!(claim.task_id(), id);
        assert_eq!(claim.attempt, 1);
    }

    #[tokio::test]
    async fn duplicate_ids_are_rejected() {
        let f = fixture(KernelConfig::default());
        let env = envelope("c1", &[]);
        f.queue.submit(env.clone(), BudgetSpec::default()).await.unwrap();
        let err = f.queue.submit(env, BudgetSpec::default()).await.unwrap_err();
        assert!(matches!(err, KernelError::DuplicateTask(_)));
    }

    #[tokio::test]
    async fn claim_requires_capability_superset() {
        let f = fixture(KernelConfig::default());
        let id = f
            .queue
            .submit(envelope("c1", &["research", "web"]), BudgetSpec::default())
            .await
            .unwrap();

        assert!(f.queue.claim_next(&w("w1"), &caps(&["research"])).await.is_none());
        let claim = f
            .queue
            .claim_next(&w("w2"), &caps(&["research", "web", "image"]))
            .await
            .unwrap();
        assert_eq!(claim.task_id(), id);
        assert_eq!(claim.attempt, 1);
        assert!(!claim.resumed);
    }

    #[tokio::test]
    async fn fifo_within_a_class() {
        let f = fixture(KernelConfig::default());
        let first = f.queue.submit(envelope("c1", &["research"]), BudgetSpec::default()).await.unwrap();
        let second = f.queue.submit(envelope("c2", &["research"]), BudgetSpec::default()).await.unwrap();

        let a = f.queue.claim_next(&w("w1"), &caps(&["research"])).await.unwrap();
        let b = f.queue.claim_next(&w("w2"), &caps(&["research"])).await.unwrap();
        assert_eq!(a.task_id(), first);
        assert_eq!(b.task_id(), second);
    }

    #[tokio::test]
    async fn worker_calls_require_the_claim() {
        let f = fixture(KernelConfig::default());
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();

        let err = f.queue.touch(id, &w("intruder")).await.unwrap_err();
        assert!(matches!(err, KernelError::NotClaimant { .. }));
        let err = f
            .queue
            .complete(id, &w("intruder"), ProposalBundle::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::NotClaimant { .. }));
    }

    #[tokio::test]
    async fn invalid_completion_keeps_task_open() {
        let f = fixture(KernelConfig::default());
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();

        let bad = ProposalBundle::new(vec![ProposedOperation::Delete { target_id: NodeId::new("ghost") }], "");
        let err = f.queue.complete(id, &w("w1"), bad, None).await.unwrap_err();
        assert!(matches!(err, KernelError::ValidationFailed(_)));
        assert_eq!(f.queue.status(id).await.unwrap().status, TaskStatus::InProgress);

        let good = ProposalBundle::new(vec![ProposedOperation::create("n1", Some(NodeId::new("root")))], "ok");
        f.queue.complete(id, &w("w1"), good, None).await.unwrap();
        assert_eq!(f.queue.status(id).await.unwrap().status, TaskStatus::Completed);

        let kinds: Vec<_> = f.events.history(id).into_iter().map(|e| e.kind).collect();
        assert!(matches!(kinds[kinds.len() - 2], EventKind::ProposedOps(_)));
        assert!(matches!(kinds[kinds.len() - 1], EventKind::Status { status: TaskStatus::Completed, .. }));
    }

    #[tokio::test]
    async fn retryable_failures_back_off_then_exhaust() {
        let mut config = KernelConfig::default();
        config.max_attempts = 2;
        let f = fixture(config);
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();

        f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();
        let status = f.queue.fail(id, &w("w1"), FailureReport::new("timeout", true)).await.unwrap();
        assert_eq!(status, TaskStatus::RetryScheduled);

        // not yet due
        assert!(f.queue.claim_next(&w("w1"), &caps(&[])).await.is_none());

        f.clock.advance(chrono::Duration::seconds(2));
        let claim = f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();
        assert_eq!(claim.attempt, 2);

        let status = f.queue.fail(id, &w("w1"), FailureReport::new("timeout", true)).await.unwrap();
        assert_eq!(
            status,
            TaskStatus::Failed(FailureReason::RetriesExhausted { code: "timeout".into() })
        );
    }

    #[tokio::test]
    async fn cancel_of_held_task_is_advisory() {
        let f = fixture(KernelConfig::default());
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();

        assert_eq!(f.queue.cancel(id).await.unwrap(), TaskStatus::InProgress);
        let ack = f.queue.checkpoint(id, &w("w1"), json!({ "step": 1 })).await.unwrap();
        assert!(ack.cancel_requested);
        assert_eq!(ack.seq, 1);

        let status = f.queue.fail(id, &w("w1"), FailureReport::cancelled()).await.unwrap();
        assert_eq!(status, TaskStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_of_pending_task_is_immediate() {
        let f = fixture(KernelConfig::default());
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        assert_eq!(f.queue.cancel(id).await.unwrap(), TaskStatus::Cancelled);
        assert!(f.queue.claim_next(&w("w1"), &caps(&[])).await.is_none());
        assert!(f.queue.cancel(id).await.is_err());
    }

    #[tokio::test]
    async fn silent_tasks_cannot_ask() {
        let f = fixture(KernelConfig::default());
        let env = TaskSubmission::new("c1", "test", "researcher", "enrich")
            .with_style(InteractionStyle::Silent)
            .into_envelope(TaskId::from_ulid(Ulid::new()), TrustContextId::new("shared"));
        let id = f.queue.submit(env, BudgetSpec::default()).await.unwrap();
        f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();

        let err = f
            .queue
            .report_progress(id, &w("w1"), ProgressReport::Clarification { question: "?".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, KernelError::ValidationFailed(_)));
    }

    #[tokio::test]
    async fn clarification_round_trip() {
        let f = fixture(KernelConfig::default());
        let id = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        f.queue.claim_next(&w("w1"), &caps(&[])).await.unwrap();

        f.queue
            .report_progress(id, &w("w1"), ProgressReport::Clarification { question: "which?".into() })
            .await
            .unwrap();
        assert_eq!(f.queue.status(id).await.unwrap().status, TaskStatus::AwaitingClarification);

        f.queue.answer_clarification(id, "the second".into()).await.unwrap();
        assert_eq!(f.queue.status(id).await.unwrap().status, TaskStatus::InProgress);
        assert!(f.queue.answer_clarification(id, "again".into()).await.is_err());

        let answered = f.events.history(id).into_iter().any(|e| {
            matches!(e.kind, EventKind::Clarification(Clarification::Answered { ref answer }) if answer == "the second")
        });
        assert!(answered);
    }

    #[tokio::test]
    async fn admission_caps_open_tasks_per_conversation() {
        let mut config = KernelConfig::default();
        config.admission.max_pending_per_conversation = Some(2);
        let f = fixture(config);

        f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        let err = f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap_err();
        assert!(matches!(err, KernelError::AdmissionRejected { .. }));

        // other conversations are unaffected
        f.queue.submit(envelope("c2", &[]), BudgetSpec::default()).await.unwrap();
        let rejected = f
            .audit
            .all()
            .await
            .into_iter()
            .filter(|r| r.decision == AuditDecision::Rejected)
            .count();
        assert_eq!(rejected, 1);
    }

    #[tokio::test]
    async fn admission_debounces_rapid_submissions() {
        let mut config = KernelConfig::default();
        config.admission.min_submit_interval_ms = Some(5_000);
        let f = fixture(config);

        f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.unwrap();
        f.clock.advance(chrono::Duration::seconds(1));
        assert!(f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.is_err());
        f.clock.advance(chrono::Duration::seconds(5));
        assert!(f.queue.submit(envelope("c1", &[]), BudgetSpec::default()).await.is_ok());
    }

    #[tokio::test]
    async fn claim_next_wait_wakes_on_submit() {
        let f = Arc::new(fixture(KernelConfig::default()));
        let waiter = {
            let f = Arc::clone(&f);
            tokio::spawn(async move {
                f.queue
                    .claim_next_wait(&w("w1"), &caps(&["research"]), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let id = f.queue.submit(envelope("c1", &["research"]), BudgetSpec::default()).await.unwrap();

        let claim = waiter.await.unwrap().unwrap();
        assert_eq!(claim.task_id(), id);
    }

    #[tokio::test]
    async fn claim_next_wait_times_out() {
        let f = fixture(KernelConfig::default());
        let claim = f
            .queue
            .claim_next_wait(&w("w1"), &caps(&[]), Duration::from_millis(20))
            .await;
        assert!(claim.is_none());
    }
}
