//! Kernel - 各コンポーネントを束ねるファサード
//!
//! ワーカー側（claim / progress / checkpoint / authorize / complete）と
//! 利用側（submit / subscribe / review / approval）の入口をまとめる。
//! Clone は安価（中身はすべて Arc）。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::checkpoint::CheckpointManager;
use crate::config::KernelConfig;
use crate::domain::{
    ActionId, AgentDefinition, AgentId, AuditRecord, CapabilityManifest, CapabilitySet, Checkpoint,
    CheckpointAck, FailureReport, ProgressReport, ProposalBundle, TaskEvent, TaskId,
    TaskSubmission, TicketId, TrustContextId, WorkerId,
};
use crate::error::{Diagnostics, KernelError};
use crate::events::{EventHub, EventSubscription};
use crate::inbox::{Enrichment, ProposalInbox, Review, ReviewKind, ReviewResponse, ReviewStatus};
use crate::observability::{TaskCounts, TaskView};
use crate::policy::{ApprovalState, ApprovalTicket, Invocation, PolicyKernel, Verdict};
use crate::ports::{Clock, IdGenerator};
use crate::queue::{Claim, InMemoryTaskQueue, ReapReport, TaskStatus};
use crate::registry::CapabilityRegistry;

#[derive(Clone)]
pub struct Kernel {
    pub(crate) config: Arc<KernelConfig>,
    pub(crate) registry: Arc<CapabilityRegistry>,
    pub(crate) queue: Arc<InMemoryTaskQueue>,
    pub(crate) policy: Arc<PolicyKernel>,
    pub(crate) inbox: Arc<ProposalInbox>,
    pub(crate) events: Arc<EventHub>,
    pub(crate) audit: Arc<AuditLog>,
    pub(crate) checkpoints: Arc<CheckpointManager>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Kernel {
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // ---- collaborator side ----

    /// Seals and enqueues a submission under the default trust context.
    /// The agent must be registered; its budget template is copied into the
    /// task.
    pub async fn submit(&self, submission: TaskSubmission) -> Result<TaskId, KernelError> {
        let trust = self.config.default_trust_context.clone();
        self.submit_as(submission, trust).await
    }

    /// Like [`Kernel::submit`], for a collaborator that knows where the task
    /// came from and vouches for `trust`.
    pub async fn submit_as(
        &self,
        submission: TaskSubmission,
        trust: TrustContextId,
    ) -> Result<TaskId, KernelError> {
        let agent = self
            .registry
            .agent(&submission.agent_id)
            .await
            .ok_or_else(|| {
                KernelError::ValidationFailed(Diagnostics::single(format!(
                    "unknown agent `{}`",
                    submission.agent_id
                )))
            })?;
        let task_id = submission
            .task_id
            .unwrap_or_else(|| self.ids.generate_task_id());
        let envelope = submission.into_envelope(task_id, trust);
        self.queue.submit(envelope, agent.budget).await
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<TaskStatus, KernelError> {
        let status = self.queue.cancel(task_id).await?;
        if status.is_terminal() {
            self.policy.abandon_approvals(task_id);
        }
        Ok(status)
    }

    pub async fn answer_clarification(
        &self,
        task_id: TaskId,
        answer: impl Into<String>,
    ) -> Result<(), KernelError> {
        self.queue.answer_clarification(task_id, answer.into()).await
    }

    /// Follows a task's events from the first one. Archived tasks have no
    /// stream left.
    pub fn subscribe(&self, task_id: TaskId) -> Result<EventSubscription, KernelError> {
        self.events
            .subscribe(task_id)
            .ok_or(KernelError::TaskNotFound(task_id))
    }

    pub fn events(&self, task_id: TaskId) -> Vec<TaskEvent> {
        self.events.history(task_id)
    }

    pub async fn counts(&self) -> TaskCounts {
        self.queue.counts().await
    }

    pub async fn status(&self, task_id: TaskId) -> Result<TaskView, KernelError> {
        self.queue.status(task_id).await
    }

    // ---- worker side ----

    pub async fn claim_next(&self, worker: &WorkerId, capabilities: &CapabilitySet) -> Option<Claim> {
        self.queue.claim_next(worker, capabilities).await
    }

    pub async fn claim_next_wait(
        &self,
        worker: &WorkerId,
        capabilities: &CapabilitySet,
        timeout: Duration,
    ) -> Option<Claim> {
        self.queue.claim_next_wait(worker, capabilities, timeout).await
    }

    pub async fn heartbeat(&self, task_id: TaskId, worker: &WorkerId) -> Result<(), KernelError> {
        self.queue.touch(task_id, worker).await
    }

    pub async fn progress(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        report: ProgressReport,
    ) -> Result<(), KernelError> {
        self.queue.report_progress(task_id, worker, report).await
    }

    pub async fn checkpoint(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        marker: Value,
    ) -> Result<CheckpointAck, KernelError> {
        self.queue.checkpoint(task_id, worker, marker).await
    }

    pub fn checkpoints(&self, task_id: TaskId) -> Vec<Checkpoint> {
        self.checkpoints.history(task_id)
    }

    /// Latest marker of a task, if any.
    pub async fn resume(&self, task_id: TaskId) -> Result<Option<Checkpoint>, KernelError> {
        self.queue.resume_point(task_id).await
    }

    /// Terminal success; the bundle goes to the inbox.
    pub async fn complete(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        bundle: ProposalBundle,
    ) -> Result<ReviewStatus, KernelError> {
        let envelope = self
            .queue
            .complete(task_id, worker, bundle.clone(), None)
            .await?;
        self.policy.abandon_approvals(task_id);
        self.inbox.present(&envelope, bundle, ReviewKind::Result).await
    }

    pub async fn fail(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        report: FailureReport,
    ) -> Result<TaskStatus, KernelError> {
        let status = self.queue.fail(task_id, worker, report).await?;
        if status.is_terminal() {
            self.policy.abandon_approvals(task_id);
        }
        Ok(status)
    }

    pub async fn authorize(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
    ) -> Verdict {
        self.policy.authorize(task_id, worker, action, params).await
    }

    pub async fn invoke(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
    ) -> Result<Invocation, KernelError> {
        self.policy.invoke(task_id, worker, action, params).await
    }

    pub async fn invoke_blocking(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
    ) -> Result<Value, KernelError> {
        self.policy.invoke_blocking(task_id, worker, action, params).await
    }

    pub async fn await_approval(&self, ticket_id: TicketId) -> Result<ApprovalState, KernelError> {
        self.policy.await_approval(ticket_id).await
    }

    // ---- human side ----

    pub async fn decide_approval(
        &self,
        ticket_id: TicketId,
        approve: bool,
    ) -> Result<ApprovalState, KernelError> {
        self.policy.decide_approval(ticket_id, approve).await
    }

    pub fn pending_approvals(&self) -> Vec<ApprovalTicket> {
        self.policy.pending_approvals()
    }

    pub async fn respond_review(
        &self,
        task_id: TaskId,
        response: ReviewResponse,
    ) -> Result<ReviewStatus, KernelError> {
        self.inbox.respond(task_id, response).await
    }

    pub async fn review(&self, task_id: TaskId) -> Option<Review> {
        self.inbox.review(task_id).await
    }

    pub async fn open_reviews(&self) -> Vec<TaskId> {
        self.inbox.open_reviews().await
    }

    pub async fn enrichments(&self) -> Vec<Enrichment> {
        self.inbox.enrichments().await
    }

    pub async fn allow_auto_approve(&self, agent: impl Into<AgentId>, trust: impl Into<TrustContextId>) {
        self.inbox.allow_auto_approve(agent.into(), trust.into()).await;
    }

    // ---- registry ----

    pub async fn register_agent(&self, agent: AgentDefinition) {
        self.registry.register_agent(agent).await;
    }

    pub async fn set_trust_context(&self, id: impl Into<TrustContextId>, manifest: CapabilityManifest) {
        self.registry.set_trust_context(id.into(), manifest).await;
    }

    // ---- audit ----

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub async fn audit_for(&self, task_id: TaskId) -> Vec<AuditRecord> {
        self.audit.for_task(task_id).await
    }

    /// Whether this invocation was already allowed, for replay after resume.
    pub async fn was_allowed(&self, task_id: TaskId, action: &ActionId, params: &Value) -> bool {
        self.audit.was_allowed(task_id, action, params).await
    }

    // ---- maintenance ----

    /// One reaper sweep. Tasks that ran out of time have their staged
    /// operations offered as partial results.
    pub async fn reap(&self) -> ReapReport {
        let report = self.queue.reap().await;
        for expired in &report.budget_exceeded {
            let task_id = expired.envelope.task_id();
            self.policy.abandon_approvals(task_id);
            if expired.staged.is_empty() {
                continue;
            }
            let bundle = ProposalBundle::new(
                expired.staged.clone(),
                "partial result: duration budget exhausted",
            );
            match self.inbox.present(&expired.envelope, bundle, ReviewKind::Partial).await {
                Ok(_) => info!(task_id = %task_id, "partial result offered"),
                Err(err) => warn!(task_id = %task_id, error = %err, "partial result not offered"),
            }
        }
        for task_id in &report.disconnected {
            self.policy.abandon_approvals(*task_id);
        }
        for task_id in &report.archived {
            self.policy.forget_task(*task_id);
        }
        report
    }
}
