//! Proposed-operations inbox.
//!
//! Bundles wait here for a human decision. Durable state changes only through
//! an explicit approval or an auto-approve policy for the exact
//! (agent, trust context) pair, and the decision is audited before the
//! applier runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::audit::AuditLog;
use crate::domain::{
    Actor, AgentId, AuditAction, AuditDecision, AuditEntry, ContextSnapshot, ProposalBundle,
    ProposedOperation, ReviewResponseKind, TaskEnvelope, TaskId, TrustContextId, proposal,
};
use crate::error::KernelError;
use crate::ports::{Clock, DurableStateApplier, ReferenceResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    /// Bundle of a completed task.
    Result,
    /// Staged operations of a task that ran out of budget.
    Partial,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewStatus {
    Open,
    Applied,
    Rejected,
}

/// Human response to a review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "camelCase")]
pub enum ReviewResponse {
    ApproveAll,
    Reject {
        #[serde(default)]
        feedback: Option<String>,
    },
    EditThenApply {
        ops: Vec<ProposedOperation>,
    },
}

impl ReviewResponse {
    pub fn kind(&self) -> ReviewResponseKind {
        match self {
            ReviewResponse::ApproveAll => ReviewResponseKind::ApproveAll,
            ReviewResponse::Reject { .. } => ReviewResponseKind::Reject,
            ReviewResponse::EditThenApply { .. } => ReviewResponseKind::EditThenApply,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub trust_context: TrustContextId,
    pub kind: ReviewKind,
    pub bundle: ProposalBundle,
    pub status: ReviewStatus,
    /// What was actually applied (the edit, for `editThenApply`).
    pub applied_ops: Option<Vec<ProposedOperation>>,
    pub feedback: Option<String>,
    #[serde(skip)]
    snapshot: ContextSnapshot,
    pub presented_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
}

/// One line of the enrichment summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Enrichment {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub kind: ReviewKind,
    pub status: ReviewStatus,
    pub rationale: String,
    pub op_count: usize,
    pub sources: Vec<String>,
}

pub struct ProposalInbox {
    reviews: Mutex<HashMap<TaskId, Review>>,
    auto_approve: RwLock<HashSet<(AgentId, TrustContextId)>>,
    applier: Arc<dyn DurableStateApplier>,
    /// Live view of existing nodes; the task's snapshot when unset.
    resolver: Option<Arc<dyn ReferenceResolver>>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
}

impl ProposalInbox {
    pub fn new(
        applier: Arc<dyn DurableStateApplier>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            reviews: Mutex::new(HashMap::new()),
            auto_approve: RwLock::new(HashSet::new()),
            applier,
            resolver: None,
            audit,
            clock,
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ReferenceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_auto_approve(
        self,
        pairs: impl IntoIterator<Item = (AgentId, TrustContextId)>,
    ) -> Self {
        Self {
            auto_approve: RwLock::new(pairs.into_iter().collect()),
            ..self
        }
    }

    /// Pre-authorizes results of `agent` running under `trust`.
    pub async fn allow_auto_approve(&self, agent: AgentId, trust: TrustContextId) {
        info!(agent_id = %agent, trust_context = %trust, "auto-approve enabled");
        self.auto_approve.write().await.insert((agent, trust));
    }

    pub async fn revoke_auto_approve(&self, agent: &AgentId, trust: &TrustContextId) {
        self.auto_approve
            .write()
            .await
            .remove(&(agent.clone(), trust.clone()));
    }

    fn validate(&self, review: &Review, ops: &[ProposedOperation]) -> Result<(), KernelError> {
        match &self.resolver {
            Some(resolver) => proposal::validate(ops, resolver.as_ref())?,
            None => proposal::validate(ops, &review.snapshot)?,
        }
        Ok(())
    }

    /// Opens a review for the bundle. Results under an auto-approve pair are
    /// applied at once; partials always wait for a human.
    pub async fn present(
        &self,
        envelope: &TaskEnvelope,
        bundle: ProposalBundle,
        kind: ReviewKind,
    ) -> Result<ReviewStatus, KernelError> {
        let task_id = envelope.task_id();
        let mut reviews = self.reviews.lock().await;
        if reviews.contains_key(&task_id) {
            return Err(KernelError::ReviewClosed(task_id));
        }

        let op_count = bundle.proposed_ops.len();
        let review = reviews.entry(task_id).or_insert(Review {
            task_id,
            agent_id: envelope.agent_id().clone(),
            trust_context: envelope.trust_context().clone(),
            kind,
            bundle,
            status: ReviewStatus::Open,
            applied_ops: None,
            feedback: None,
            snapshot: envelope.context_snapshot().clone(),
            presented_at: self.clock.now(),
            decided_at: None,
        });
        info!(task_id = %task_id, ?kind, ops = op_count, "review presented");

        let pair = (review.agent_id.clone(), review.trust_context.clone());
        if kind != ReviewKind::Result || !self.auto_approve.read().await.contains(&pair) {
            return Ok(ReviewStatus::Open);
        }

        let actor = Actor::AutoApprove {
            agent: pair.0,
            trust: pair.1,
        };
        let ops = review.bundle.proposed_ops.clone();
        match self.approve(review, actor, ReviewResponseKind::ApproveAll, ops).await {
            Ok(status) => Ok(status),
            Err(err) => {
                warn!(task_id = %task_id, error = %err, "auto-approve failed; review left open");
                Ok(ReviewStatus::Open)
            }
        }
    }

    /// Applies a human decision. Rejected edits and applier failures keep
    /// the review open.
    pub async fn respond(
        &self,
        task_id: TaskId,
        response: ReviewResponse,
    ) -> Result<ReviewStatus, KernelError> {
        let mut reviews = self.reviews.lock().await;
        let review = reviews
            .get_mut(&task_id)
            .ok_or(KernelError::ReviewNotFound(task_id))?;
        if review.status != ReviewStatus::Open {
            return Err(KernelError::ReviewClosed(task_id));
        }

        let kind = response.kind();
        match response {
            ReviewResponse::Reject { feedback } => {
                let mut entry = AuditEntry::new(
                    task_id,
                    Actor::Human,
                    AuditAction::Review { response: kind },
                    AuditDecision::Rejected,
                );
                if let Some(feedback) = &feedback {
                    entry = entry.with_detail(feedback.clone());
                }
                self.audit.append(entry).await;
                review.status = ReviewStatus::Rejected;
                review.feedback = feedback;
                review.decided_at = Some(self.clock.now());
                info!(task_id = %task_id, "review rejected");
                Ok(ReviewStatus::Rejected)
            }
            ReviewResponse::ApproveAll => {
                let ops = review.bundle.proposed_ops.clone();
                self.approve(review, Actor::Human, kind, ops).await
            }
            ReviewResponse::EditThenApply { ops } => {
                self.approve(review, Actor::Human, kind, ops).await
            }
        }
    }

    /// Validate, audit the approval, then apply.
    async fn approve(
        &self,
        review: &mut Review,
        actor: Actor,
        kind: ReviewResponseKind,
        ops: Vec<ProposedOperation>,
    ) -> Result<ReviewStatus, KernelError> {
        let task_id = review.task_id;
        let action = AuditAction::Review { response: kind };

        if let Err(err) = self.validate(review, &ops) {
            warn!(task_id = %task_id, error = %err, "edited bundle rejected");
            self.audit
                .append(
                    AuditEntry::new(task_id, actor, action, AuditDecision::Fault)
                        .with_detail(err.to_string()),
                )
                .await;
            return Err(err);
        }

        self.audit
            .append(AuditEntry::new(task_id, actor.clone(), action.clone(), AuditDecision::Approved))
            .await;

        if let Err(message) = self.applier.apply(task_id, &ops).await {
            warn!(task_id = %task_id, error = %message, "applier failed; review left open");
            self.audit
                .append(
                    AuditEntry::new(task_id, actor, action, AuditDecision::Fault)
                        .with_detail(message.clone()),
                )
                .await;
            return Err(KernelError::ApplyFailed(message));
        }

        self.audit
            .append(
                AuditEntry::new(task_id, actor, action, AuditDecision::Applied)
                    .with_detail(format!("{} operations", ops.len())),
            )
            .await;
        info!(task_id = %task_id, ops = ops.len(), "operations applied");
        review.status = ReviewStatus::Applied;
        review.applied_ops = Some(ops);
        review.decided_at = Some(self.clock.now());
        Ok(ReviewStatus::Applied)
    }

    pub async fn review(&self, task_id: TaskId) -> Option<Review> {
        self.reviews.lock().await.get(&task_id).cloned()
    }

    pub async fn open_reviews(&self) -> Vec<TaskId> {
        let reviews = self.reviews.lock().await;
        let mut open: Vec<&Review> = reviews
            .values()
            .filter(|r| r.status == ReviewStatus::Open)
            .collect();
        open.sort_by_key(|r| r.presented_at);
        open.into_iter().map(|r| r.task_id).collect()
    }

    /// Applied and pending results, oldest first. Rejected reviews are left
    /// out.
    pub async fn enrichments(&self) -> Vec<Enrichment> {
        let reviews = self.reviews.lock().await;
        let mut listed: Vec<&Review> = reviews
            .values()
            .filter(|r| r.status != ReviewStatus::Rejected)
            .collect();
        listed.sort_by_key(|r| r.presented_at);
        listed
            .into_iter()
            .map(|r| Enrichment {
                task_id: r.task_id,
                agent_id: r.agent_id.clone(),
                kind: r.kind,
                status: r.status,
                rationale: r.bundle.rationale.clone(),
                op_count: r
                    .applied_ops
                    .as_ref()
                    .map_or(r.bundle.proposed_ops.len(), Vec::len),
                sources: r.bundle.sources.clone(),
            })
            .collect()
    }
}
