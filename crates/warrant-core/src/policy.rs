//! Policy kernel: the single checkpoint every attempted action goes through.
//!
//! `authorize` runs, in order: task lookup, claim check, action vocabulary,
//! effective manifest, approval, resource-class token bucket, task budget.
//! Every call leaves exactly one audit record. An allowed action yields a
//! [`Permit`], which only this module can mint and which
//! [`ActionExecutor`] requires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::domain::{
    ActionClass, ActionId, Actor, AuditAction, AuditDecision, AuditEntry, AuditId,
    BudgetRemaining, DenyReason, Permission, ProposalBundle, TaskId, TicketId, WorkerId,
};
use crate::error::KernelError;
use crate::inbox::{ProposalInbox, ReviewKind};
use crate::ports::{ActionExecutor, Clock, IdGenerator};
use crate::queue::{ChargeError, InMemoryTaskQueue, TaskStatus};
use crate::rate_limit::RateLimiters;
use crate::registry::CapabilityRegistry;

/// Proof that one invocation was authorized and audited.
///
/// No public constructor.
#[derive(Debug, Clone, PartialEq)]
pub struct Permit {
    task_id: TaskId,
    worker: WorkerId,
    action: ActionId,
    params: Value,
    audit_id: AuditId,
    remaining: BudgetRemaining,
}

impl Permit {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn action(&self) -> &ActionId {
        &self.action
    }

    pub fn params(&self) -> &Value {
        &self.params
    }

    /// The `allow` record this permit was issued under.
    pub fn audit_id(&self) -> AuditId {
        self.audit_id
    }

    /// Budget left after this action was charged.
    pub fn remaining(&self) -> BudgetRemaining {
        self.remaining
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    /// The task ended before anyone decided.
    Abandoned,
}

/// A request for a human decision on one action with specific parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalTicket {
    pub ticket_id: TicketId,
    pub task_id: TaskId,
    pub action: ActionId,
    pub params: Value,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Allow(Permit),
    Deny(DenyReason),
    NeedsApproval(ApprovalTicket),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow(_))
    }

    pub fn deny_reason(&self) -> Option<DenyReason> {
        match self {
            Verdict::Deny(reason) => Some(*reason),
            _ => None,
        }
    }
}

/// Result of [`PolicyKernel::invoke`].
#[derive(Debug, Clone, PartialEq)]
pub enum Invocation {
    Completed(Value),
    AwaitingApproval(ApprovalTicket),
}

struct TicketEntry {
    ticket: ApprovalTicket,
    state: watch::Sender<ApprovalState>,
    /// An approval is good for one authorization.
    consumed: bool,
}

impl TicketEntry {
    fn state(&self) -> ApprovalState {
        *self.state.borrow()
    }

    fn matches(&self, task_id: TaskId, action: &ActionId, params: &Value) -> bool {
        !self.consumed
            && self.ticket.task_id == task_id
            && &self.ticket.action == action
            && &self.ticket.params == params
    }
}

/// What the ticket table says about a flagged action.
enum Grant {
    Approved(TicketId),
    Denied(TicketId),
    Pending(ApprovalTicket),
    None,
}

pub struct PolicyKernel {
    registry: Arc<CapabilityRegistry>,
    queue: Arc<InMemoryTaskQueue>,
    audit: Arc<AuditLog>,
    inbox: Arc<ProposalInbox>,
    limiters: RateLimiters,
    executor: Option<Arc<dyn ActionExecutor>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    /// Serializes authorizations of one task.
    guards: StdMutex<HashMap<TaskId, Arc<Mutex<()>>>>,
    tickets: StdMutex<HashMap<TicketId, TicketEntry>>,
}

impl PolicyKernel {
    pub fn new(
        registry: Arc<CapabilityRegistry>,
        queue: Arc<InMemoryTaskQueue>,
        audit: Arc<AuditLog>,
        inbox: Arc<ProposalInbox>,
        limiters: RateLimiters,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            queue,
            audit,
            inbox,
            limiters,
            executor: None,
            ids,
            clock,
            guards: StdMutex::new(HashMap::new()),
            tickets: StdMutex::new(HashMap::new()),
        }
    }

    pub fn with_executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    fn task_guard(&self, task_id: TaskId) -> Arc<Mutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(guards.entry(task_id).or_default())
    }

    fn forget_guard(&self, task_id: TaskId) {
        self.guards
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&task_id);
    }

    fn tickets(&self) -> std::sync::MutexGuard<'_, HashMap<TicketId, TicketEntry>> {
        self.tickets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decides one attempted action.
    ///
    /// Approval-flagged actions return `NeedsApproval` until a human approves
    /// the ticket; the approval then admits exactly one matching call, which
    /// still goes through the rate limit and budget.
    pub async fn authorize(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
    ) -> Verdict {
        let guard = self.task_guard(task_id);
        let _serialized = guard.lock().await;

        let Some(view) = self.queue.policy_view(task_id, worker).await else {
            self.forget_guard(task_id);
            return self
                .deny(task_id, worker, action, params, DenyReason::TaskNotFound, None)
                .await;
        };
        if view.status != TaskStatus::InProgress {
            let detail = Some(format!("task is {}", view.status));
            return self
                .deny(task_id, worker, action, params, DenyReason::TaskNotActive, detail)
                .await;
        }
        if view.claimant.as_ref() != Some(worker) {
            return self
                .deny(task_id, worker, action, params, DenyReason::NotClaimant, None)
                .await;
        }
        if !action.is_known() {
            return self
                .deny(task_id, worker, action, params, DenyReason::UnknownAction, None)
                .await;
        }

        let effective = match self
            .registry
            .effective(&view.agent_id, &view.trust_context)
            .await
        {
            Ok(effective) => effective,
            Err(reason) => {
                let detail = Some(format!(
                    "agent {} under trust context {}",
                    view.agent_id, view.trust_context
                ));
                return self.deny(task_id, worker, action, params, reason, detail).await;
            }
        };

        let mut grant = None;
        match effective.permission(&action) {
            Permission::Denied => {
                return self
                    .deny(task_id, worker, action, params, DenyReason::NotInManifest, None)
                    .await;
            }
            Permission::Allowed => {}
            Permission::RequiresApproval => match self.find_grant(task_id, &action, &params) {
                Grant::Approved(ticket_id) => grant = Some(ticket_id),
                Grant::Denied(ticket_id) => {
                    self.consume(ticket_id);
                    let detail = Some(format!("ticket {ticket_id}"));
                    return self
                        .deny(task_id, worker, action, params, DenyReason::ApprovalDenied, detail)
                        .await;
                }
                Grant::Pending(ticket) => {
                    return self.needs_approval(worker, ticket).await;
                }
                Grant::None => {
                    let ticket = self.open_ticket(task_id, action, params);
                    return self.needs_approval(worker, ticket).await;
                }
            },
        }

        let class = action.class();
        if let ActionClass::ExternalRequest(resource) = &class
            && !self.limiters.try_acquire(resource, self.clock.now())
        {
            let detail = Some(format!("resource class {resource}"));
            return self
                .deny(task_id, worker, action, params, DenyReason::RateLimited, detail)
                .await;
        }

        let charged = self.queue.charge(task_id, worker, &class).await;
        if charged.is_err()
            && let ActionClass::ExternalRequest(resource) = &class
        {
            // the call never goes out
            self.limiters.release(resource);
        }
        let remaining = match charged {
            Ok(remaining) => remaining,
            Err(ChargeError::NotFound) => {
                return self
                    .deny(task_id, worker, action, params, DenyReason::TaskNotFound, None)
                    .await;
            }
            Err(ChargeError::NotActive) => {
                return self
                    .deny(task_id, worker, action, params, DenyReason::TaskNotActive, None)
                    .await;
            }
            Err(ChargeError::NotClaimant) => {
                return self
                    .deny(task_id, worker, action, params, DenyReason::NotClaimant, None)
                    .await;
            }
            Err(ChargeError::Exhausted {
                dimension,
                envelope,
                staged,
            }) => {
                let verdict = self
                    .deny(
                        task_id,
                        worker,
                        action,
                        params,
                        DenyReason::BudgetExceeded,
                        Some(dimension.to_string()),
                    )
                    .await;
                self.abandon_approvals(task_id);
                if !staged.is_empty() {
                    let bundle = ProposalBundle::new(
                        staged,
                        format!("partial result: {dimension} budget exhausted"),
                    );
                    if let Err(err) = self.inbox.present(&envelope, bundle, ReviewKind::Partial).await {
                        warn!(task_id = %task_id, error = %err, "partial result not offered");
                    }
                }
                return verdict;
            }
        };

        if let Some(ticket_id) = grant {
            self.consume(ticket_id);
        }
        let audit_id = self
            .audit
            .append(AuditEntry::new(
                task_id,
                Actor::Worker(worker.clone()),
                AuditAction::Invoke {
                    action: action.clone(),
                    params: params.clone(),
                },
                AuditDecision::Allow,
            ))
            .await;
        debug!(
            task_id = %task_id,
            worker = %worker,
            action = %action,
            tool_calls_left = remaining.tool_calls,
            "action allowed"
        );
        Verdict::Allow(Permit {
            task_id,
            worker: worker.clone(),
            action,
            params,
            audit_id,
            remaining,
        })
    }

    async fn deny(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
        reason: DenyReason,
        detail: Option<String>,
    ) -> Verdict {
        warn!(task_id = %task_id, worker = %worker, action = %action, %reason, "action denied");
        let mut entry = AuditEntry::new(
            task_id,
            Actor::Worker(worker.clone()),
            AuditAction::Invoke { action, params },
            AuditDecision::Deny(reason),
        );
        if let Some(detail) = detail {
            entry = entry.with_detail(detail);
        }
        self.audit.append(entry).await;
        Verdict::Deny(reason)
    }

    async fn needs_approval(&self, worker: &WorkerId, ticket: ApprovalTicket) -> Verdict {
        info!(task_id = %ticket.task_id, ticket = %ticket.ticket_id, action = %ticket.action, "approval required");
        self.audit
            .append(
                AuditEntry::new(
                    ticket.task_id,
                    Actor::Worker(worker.clone()),
                    AuditAction::Invoke {
                        action: ticket.action.clone(),
                        params: ticket.params.clone(),
                    },
                    AuditDecision::NeedsApproval,
                )
                .with_detail(ticket.ticket_id.to_string()),
            )
            .await;
        Verdict::NeedsApproval(ticket)
    }

    fn find_grant(&self, task_id: TaskId, action: &ActionId, params: &Value) -> Grant {
        let tickets = self.tickets();
        let mut pending = None;
        for (ticket_id, entry) in tickets.iter() {
            if !entry.matches(task_id, action, params) {
                continue;
            }
            match entry.state() {
                ApprovalState::Approved => return Grant::Approved(*ticket_id),
                ApprovalState::Denied => return Grant::Denied(*ticket_id),
                ApprovalState::Pending => pending = Some(entry.ticket.clone()),
                ApprovalState::Abandoned => {}
            }
        }
        pending.map_or(Grant::None, Grant::Pending)
    }

    fn consume(&self, ticket_id: TicketId) {
        if let Some(entry) = self.tickets().get_mut(&ticket_id) {
            entry.consumed = true;
        }
    }

    fn open_ticket(&self, task_id: TaskId, action: ActionId, params: Value) -> ApprovalTicket {
        let ticket = ApprovalTicket {
            ticket_id: self.ids.generate_ticket_id(),
            task_id,
            action,
            params,
            requested_at: self.clock.now(),
        };
        let (state, _) = watch::channel(ApprovalState::Pending);
        self.tickets().insert(
            ticket.ticket_id,
            TicketEntry {
                ticket: ticket.clone(),
                state,
                consumed: false,
            },
        );
        ticket
    }

    /// Records a human decision on a ticket and wakes its waiter.
    ///
    /// Deciding an already decided ticket changes nothing and returns the
    /// existing state. A ticket whose task has ended is abandoned instead.
    pub async fn decide_approval(
        &self,
        ticket_id: TicketId,
        approve: bool,
    ) -> Result<ApprovalState, KernelError> {
        let task_id = self
            .tickets()
            .get(&ticket_id)
            .map(|entry| entry.ticket.task_id)
            .ok_or(KernelError::TicketNotFound(ticket_id))?;
        let guard = self.task_guard(task_id);
        let _serialized = guard.lock().await;

        let live = matches!(
            self.queue.status(task_id).await,
            Ok(view) if !view.status.is_terminal()
        );
        if !live {
            self.abandon_approvals(task_id);
        }

        let (action, state) = {
            let tickets = self.tickets();
            let entry = tickets
                .get(&ticket_id)
                .ok_or(KernelError::TicketNotFound(ticket_id))?;
            let current = entry.state();
            if current != ApprovalState::Pending {
                return Ok(current);
            }
            let next = if approve {
                ApprovalState::Approved
            } else {
                ApprovalState::Denied
            };
            entry.state.send_replace(next);
            (entry.ticket.action.clone(), next)
        };

        let decision = if approve {
            AuditDecision::Approved
        } else {
            AuditDecision::Rejected
        };
        self.audit
            .append(
                AuditEntry::new(task_id, Actor::Human, AuditAction::Approval { action }, decision)
                    .with_detail(ticket_id.to_string()),
            )
            .await;
        info!(task_id = %task_id, ticket = %ticket_id, approve, "approval decided");
        Ok(state)
    }

    /// Suspends until the ticket is decided or abandoned.
    pub async fn await_approval(&self, ticket_id: TicketId) -> Result<ApprovalState, KernelError> {
        let mut rx = self
            .tickets()
            .get(&ticket_id)
            .map(|entry| entry.state.subscribe())
            .ok_or(KernelError::TicketNotFound(ticket_id))?;
        let state = match rx.wait_for(|state| *state != ApprovalState::Pending).await {
            Ok(state) => *state,
            Err(_) => ApprovalState::Abandoned,
        };
        Ok(state)
    }

    pub fn ticket(&self, ticket_id: TicketId) -> Option<(ApprovalTicket, ApprovalState)> {
        self.tickets()
            .get(&ticket_id)
            .map(|entry| (entry.ticket.clone(), entry.state()))
    }

    /// Tickets waiting for a human, oldest first.
    pub fn pending_approvals(&self) -> Vec<ApprovalTicket> {
        let mut pending: Vec<ApprovalTicket> = self
            .tickets()
            .values()
            .filter(|entry| entry.state() == ApprovalState::Pending)
            .map(|entry| entry.ticket.clone())
            .collect();
        pending.sort_by_key(|ticket| ticket.requested_at);
        pending
    }

    /// Ends every open ticket of a task that can no longer act. Waiters see
    /// `Abandoned`.
    pub fn abandon_approvals(&self, task_id: TaskId) {
        let mut abandoned = 0;
        for entry in self.tickets().values_mut() {
            if entry.ticket.task_id != task_id {
                continue;
            }
            entry.consumed = true;
            if entry.state() == ApprovalState::Pending {
                entry.state.send_replace(ApprovalState::Abandoned);
                abandoned += 1;
            }
        }
        self.forget_guard(task_id);
        if abandoned > 0 {
            debug!(task_id = %task_id, abandoned, "approval tickets abandoned");
        }
    }

    /// Drops every ticket of an archived task. Later lookups of those
    /// tickets are `TicketNotFound`.
    pub fn forget_task(&self, task_id: TaskId) {
        self.abandon_approvals(task_id);
        self.tickets()
            .retain(|_, entry| entry.ticket.task_id != task_id);
    }

    /// Authorize-then-execute. The only path from a worker to an
    /// [`ActionExecutor`].
    ///
    /// A denial surfaces as `CapabilityDenied` carrying the reason; an
    /// executor failure is audited as a fault.
    pub async fn invoke(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
    ) -> Result<Invocation, KernelError> {
        let executor = self
            .executor
            .clone()
            .ok_or_else(|| KernelError::Config("no action executor configured".into()))?;

        let permit = match self.authorize(task_id, worker, action.clone(), params).await {
            Verdict::Allow(permit) => permit,
            Verdict::NeedsApproval(ticket) => return Ok(Invocation::AwaitingApproval(ticket)),
            Verdict::Deny(reason) => {
                return Err(KernelError::CapabilityDenied {
                    task_id,
                    action,
                    reason,
                });
            }
        };

        match executor.execute(&permit, permit.params()).await {
            Ok(output) => Ok(Invocation::Completed(output)),
            Err(message) => {
                warn!(task_id = %task_id, action = %action, error = %message, "action failed");
                self.audit
                    .append(
                        AuditEntry::new(
                            task_id,
                            Actor::Worker(worker.clone()),
                            AuditAction::Invoke {
                                action,
                                params: permit.params.clone(),
                            },
                            AuditDecision::Fault,
                        )
                        .with_detail(message.clone()),
                    )
                    .await;
                Err(KernelError::ActionFailed(message))
            }
        }
    }

    /// Like [`invoke`](Self::invoke) but waits out an approval and retries
    /// once it is granted.
    pub async fn invoke_blocking(
        &self,
        task_id: TaskId,
        worker: &WorkerId,
        action: ActionId,
        params: Value,
    ) -> Result<Value, KernelError> {
        loop {
            match self.invoke(task_id, worker, action.clone(), params.clone()).await? {
                Invocation::Completed(output) => return Ok(output),
                Invocation::AwaitingApproval(ticket) => {
                    match self.await_approval(ticket.ticket_id).await? {
                        // the next invoke consumes the grant or reports the denial
                        ApprovalState::Approved | ApprovalState::Denied => continue,
                        ApprovalState::Pending | ApprovalState::Abandoned => {
                            return Err(KernelError::CapabilityDenied {
                                task_id,
                                action,
                                reason: DenyReason::TaskNotActive,
                            });
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointManager;
    use crate::config::{KernelConfig, RateLimitConfig};
    use crate::domain::{
        AgentDefinition, BudgetSpec, CapabilityManifest, CapabilitySet, NodeId, ProgressReport,
        ProposedOperation, ResourceClass, TaskSubmission, TrustContextId,
    };
    use crate::events::EventHub;
    use crate::impls::InMemoryApplier;
    use crate::inbox::ReviewStatus;
    use crate::queue::FailureReason;
    use crate::ports::{FixedClock, UlidGenerator};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;
    use ulid::Ulid;

    struct Echo;

    #[async_trait]
    impl ActionExecutor for Echo {
        async fn execute(&self, permit: &Permit, params: &Value) -> Result<Value, String> {
            Ok(json!({ "action": permit.action().as_str(), "params": params }))
        }
    }

    struct Fixture {
        policy: Arc<PolicyKernel>,
        queue: Arc<InMemoryTaskQueue>,
        audit: Arc<AuditLog>,
        inbox: Arc<ProposalInbox>,
        task: TaskId,
        worker: WorkerId,
    }

    async fn fixture(budget: BudgetSpec, limits: Vec<RateLimitConfig>) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        let audit = Arc::new(AuditLog::new(Arc::clone(&clock), Arc::clone(&ids)));
        let queue = Arc::new(InMemoryTaskQueue::new(
            KernelConfig::default(),
            Arc::clone(&clock),
            Arc::new(EventHub::new()),
            Arc::clone(&audit),
            Arc::new(CheckpointManager::new()),
        ));
        let applier = Arc::new(InMemoryApplier::with_nodes([NodeId::new("root")]));
        let inbox = Arc::new(ProposalInbox::new(applier, Arc::clone(&audit), Arc::clone(&clock)));

        let agent = CapabilityManifest::new(
            [ActionId::Read, ActionId::Navigate, ActionId::WebFetch],
            [ActionId::Delete],
        )
        .unwrap();
        let trust = CapabilityManifest::new(
            [ActionId::Read, ActionId::Navigate, ActionId::WebFetch, ActionId::Delete],
            [],
        )
        .unwrap();
        let registry = Arc::new(CapabilityRegistry::with_entries(
            [AgentDefinition::new("researcher", agent, budget)],
            [(TrustContextId::new("shared"), trust)],
        ));

        let policy = Arc::new(
            PolicyKernel::new(
                registry,
                Arc::clone(&queue),
                Arc::clone(&audit),
                Arc::clone(&inbox),
                RateLimiters::from_config(&limits),
                ids,
                clock,
            )
            .with_executor(Arc::new(Echo)),
        );

        let envelope = TaskSubmission::new("c1", "sidebar", "researcher", "summarise the page")
            .with_capabilities(["research"].into_iter().collect())
            .with_snapshot(crate::domain::ContextSnapshot::new(1, [NodeId::new("root")]))
            .into_envelope(TaskId::from_ulid(Ulid::new()), TrustContextId::new("shared"));
        let task = queue.submit(envelope, budget).await.unwrap();
        let worker = WorkerId::new("w1");
        let caps: CapabilitySet = ["research"].into_iter().collect();
        queue.claim_next(&worker, &caps).await.unwrap();

        Fixture {
            policy,
            queue,
            audit,
            inbox,
            task,
            worker,
        }
    }

    #[tokio::test]
    async fn action_outside_manifest_is_denied_and_audited_once() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let verdict = f
            .policy
            .authorize(f.task, &f.worker, ActionId::MailSend, json!({}))
            .await;
        assert_eq!(verdict, Verdict::Deny(DenyReason::NotInManifest));

        let records = f.audit.for_task(f.task).await;
        let denies: Vec<_> = records
            .iter()
            .filter(|r| matches!(r.decision, AuditDecision::Deny(_)))
            .collect();
        assert_eq!(denies.len(), 1);
        assert_eq!(f.queue.status(f.task).await.unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn unknown_actions_and_strangers_are_denied() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let verdict = f
            .policy
            .authorize(f.task, &f.worker, ActionId::parse("shell.exec"), json!({}))
            .await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::UnknownAction));

        let verdict = f
            .policy
            .authorize(f.task, &WorkerId::new("w2"), ActionId::Read, json!({}))
            .await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::NotClaimant));

        let verdict = f
            .policy
            .authorize(TaskId::from_ulid(Ulid::new()), &f.worker, ActionId::Read, json!({}))
            .await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::TaskNotFound));
    }

    #[tokio::test]
    async fn approval_grant_is_single_use() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let params = json!({ "targetId": "n4" });

        let Verdict::NeedsApproval(ticket) = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, params.clone())
            .await
        else {
            panic!("expected an approval request");
        };
        // asking again while pending reuses the ticket
        let Verdict::NeedsApproval(again) = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, params.clone())
            .await
        else {
            panic!("expected an approval request");
        };
        assert_eq!(again.ticket_id, ticket.ticket_id);
        assert_eq!(f.policy.pending_approvals().len(), 1);

        let waiter = {
            let policy = Arc::clone(&f.policy);
            let id = ticket.ticket_id;
            tokio::spawn(async move { policy.await_approval(id).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        f.policy.decide_approval(ticket.ticket_id, true).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap(), ApprovalState::Approved);

        let verdict = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, params.clone())
            .await;
        assert!(verdict.is_allowed());

        let verdict = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, params)
            .await;
        assert!(matches!(verdict, Verdict::NeedsApproval(t) if t.ticket_id != ticket.ticket_id));
    }

    #[tokio::test]
    async fn denied_approval_is_reported_once() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let Verdict::NeedsApproval(ticket) = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, json!({}))
            .await
        else {
            panic!("expected an approval request");
        };
        f.policy.decide_approval(ticket.ticket_id, false).await.unwrap();

        let verdict = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, json!({}))
            .await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::ApprovalDenied));
        assert!(matches!(
            f.policy.authorize(f.task, &f.worker, ActionId::Delete, json!({})).await,
            Verdict::NeedsApproval(_)
        ));
    }

    #[tokio::test]
    async fn approval_after_the_task_ended_is_abandoned() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let Verdict::NeedsApproval(ticket) = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, json!({}))
            .await
        else {
            panic!("expected an approval request");
        };
        // the queue ends the task before anyone tidies up the tickets
        f.queue
            .fail(f.task, &f.worker, crate::domain::FailureReport::new("gave_up", false))
            .await
            .unwrap();

        let state = f.policy.decide_approval(ticket.ticket_id, true).await.unwrap();
        assert_eq!(state, ApprovalState::Abandoned);
        let approved = f
            .audit
            .for_task(f.task)
            .await
            .into_iter()
            .any(|r| r.decision == AuditDecision::Approved);
        assert!(!approved);
    }

    #[tokio::test]
    async fn forgotten_tasks_leave_no_tickets_or_guards() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let Verdict::NeedsApproval(ticket) = f
            .policy
            .authorize(f.task, &f.worker, ActionId::Delete, json!({}))
            .await
        else {
            panic!("expected an approval request");
        };
        f.policy.forget_task(f.task);
        assert!(f.policy.ticket(ticket.ticket_id).is_none());
        assert!(matches!(
            f.policy.decide_approval(ticket.ticket_id, true).await,
            Err(KernelError::TicketNotFound(_))
        ));

        let ghost = TaskId::from_ulid(Ulid::new());
        f.policy.authorize(ghost, &f.worker, ActionId::Read, json!({})).await;
        let guards = f.policy.guards.lock().unwrap();
        assert!(!guards.contains_key(&ghost));
        assert!(!guards.contains_key(&f.task));
    }

    #[tokio::test]
    async fn rate_limit_refusal_is_not_fatal() {
        let limits = vec![RateLimitConfig {
            resource_class: ResourceClass::new("web"),
            rate_per_sec: 1.0,
            burst: 1,
        }];
        let f = fixture(BudgetSpec::default(), limits).await;
        let url = json!({ "url": "https://example.org" });

        assert!(f.policy.authorize(f.task, &f.worker, ActionId::WebFetch, url.clone()).await.is_allowed());
        let verdict = f.policy.authorize(f.task, &f.worker, ActionId::WebFetch, url).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::RateLimited));
        // tree actions do not draw from the bucket
        assert!(f.policy.authorize(f.task, &f.worker, ActionId::Read, json!({})).await.is_allowed());
        assert_eq!(f.queue.status(f.task).await.unwrap().status, TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn budget_exhaustion_fails_task_and_offers_staged_ops() {
        let budget = BudgetSpec {
            max_tool_calls: 2,
            ..BudgetSpec::default()
        };
        let f = fixture(budget, vec![]).await;
        f.queue
            .report_progress(
                f.task,
                &f.worker,
                ProgressReport::Staged {
                    ops: vec![ProposedOperation::create("draft", Some(NodeId::new("root")))],
                },
            )
            .await
            .unwrap();

        for _ in 0..2 {
            assert!(f.policy.authorize(f.task, &f.worker, ActionId::Read, json!({})).await.is_allowed());
        }
        let verdict = f.policy.authorize(f.task, &f.worker, ActionId::Read, json!({})).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::BudgetExceeded));
        assert_eq!(
            f.queue.status(f.task).await.unwrap().status,
            TaskStatus::Failed(FailureReason::BudgetExceeded)
        );

        let review = f.inbox.review(f.task).await.unwrap();
        assert_eq!(review.kind, ReviewKind::Partial);
        assert_eq!(review.status, ReviewStatus::Open);

        // nothing further is authorized
        let verdict = f.policy.authorize(f.task, &f.worker, ActionId::Read, json!({})).await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::TaskNotActive));
    }

    #[tokio::test]
    async fn budget_refusal_returns_the_rate_limit_token() {
        let limits = vec![RateLimitConfig {
            resource_class: ResourceClass::new("web"),
            rate_per_sec: 0.0,
            burst: 1,
        }];
        let budget = BudgetSpec {
            max_external_requests: 0,
            ..BudgetSpec::default()
        };
        let f = fixture(budget, limits).await;
        let verdict = f
            .policy
            .authorize(f.task, &f.worker, ActionId::WebFetch, json!({ "url": "https://example.org" }))
            .await;
        assert_eq!(verdict.deny_reason(), Some(DenyReason::BudgetExceeded));
        assert!(f.policy.limiters.try_acquire(&ResourceClass::new("web"), Utc::now()));
    }

    #[tokio::test]
    async fn invoke_executes_only_with_a_permit() {
        let f = fixture(BudgetSpec::default(), vec![]).await;
        let out = f
            .policy
            .invoke(f.task, &f.worker, ActionId::Read, json!({ "targetId": "root" }))
            .await
            .unwrap();
        assert_eq!(
            out,
            Invocation::Completed(json!({ "action": "read", "params": { "targetId": "root" } }))
        );
        assert!(f.audit.was_allowed(f.task, &ActionId::Read, &json!({ "targetId": "root" })).await);

        let err = f
            .policy
            .invoke(f.task, &f.worker, ActionId::MailSend, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::CapabilityDenied { reason: DenyReason::NotInManifest, .. }
        ));
    }
}
