//! Audit record vocabulary.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::action::ActionId;
use super::ids::{AgentId, AuditId, TaskId, TrustContextId, WorkerId};

/// Who caused the recorded event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Actor {
    Worker(WorkerId),
    Human,
    Submitter(String),
    Kernel,
    Reaper,
    /// Pre-authorized policy for an (agent, trust context) pair.
    AutoApprove {
        agent: AgentId,
        trust: TrustContextId,
    },
}

/// Why an action was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    NotInManifest,
    UnknownAction,
    NoManifest,
    ApprovalDenied,
    BudgetExceeded,
    RateLimited,
    TaskNotActive,
    NotClaimant,
    TaskNotFound,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::NotInManifest => "not_in_manifest",
            DenyReason::UnknownAction => "unknown_action",
            DenyReason::NoManifest => "no_manifest",
            DenyReason::ApprovalDenied => "approval_denied",
            DenyReason::BudgetExceeded => "budget_exceeded",
            DenyReason::RateLimited => "rate_limited",
            DenyReason::TaskNotActive => "task_not_active",
            DenyReason::NotClaimant => "not_claimant",
            DenyReason::TaskNotFound => "task_not_found",
        }
    }
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Human response to a review, as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewResponseKind {
    ApproveAll,
    Reject,
    EditThenApply,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditAction {
    /// An attempted action through the policy kernel.
    Invoke { action: ActionId, params: Value },
    /// Task lifecycle (submit, claim, fail, reap, ...).
    Lifecycle { event: String },
    /// A decision on an inbox review.
    Review { response: ReviewResponseKind },
    /// A decision on an approval ticket.
    Approval { action: ActionId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum AuditDecision {
    Allow,
    Deny(DenyReason),
    NeedsApproval,
    Approved,
    Rejected,
    Applied,
    Recorded,
    Fault,
}

/// Append-only audit entry. Outlives the task it references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub audit_id: AuditId,
    pub task_id: TaskId,
    pub actor: Actor,
    pub action: AuditAction,
    pub decision: AuditDecision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn is_allowed_invoke(&self, action: &ActionId, params: &Value) -> bool {
        self.decision == AuditDecision::Allow
            && matches!(&self.action, AuditAction::Invoke { action: a, params: p } if a == action && p == params)
    }
}

/// An entry before the log stamps it with an id and time.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub task_id: TaskId,
    pub actor: Actor,
    pub action: AuditAction,
    pub decision: AuditDecision,
    pub detail: Option<String>,
}

impl AuditEntry {
    pub fn new(task_id: TaskId, actor: Actor, action: AuditAction, decision: AuditDecision) -> Self {
        Self {
            task_id,
            actor,
            action,
            decision,
            detail: None,
        }
    }

    pub fn lifecycle(task_id: TaskId, actor: Actor, event: &str, decision: AuditDecision) -> Self {
        Self::new(
            task_id,
            actor,
            AuditAction::Lifecycle {
                event: event.to_string(),
            },
            decision,
        )
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}
