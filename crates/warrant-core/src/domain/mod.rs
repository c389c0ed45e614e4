//! Domain model (ids, envelopes, manifests, proposals, events, audit records).

pub mod action;
pub mod audit;
pub mod budget;
pub mod capability;
pub mod checkpoint;
pub mod envelope;
pub mod events;
pub mod ids;
pub mod manifest;
pub mod proposal;

pub use action::{ActionClass, ActionDomain, ActionId, ResourceClass};
pub use audit::{
    Actor, AuditAction, AuditDecision, AuditEntry, AuditRecord, DenyReason, ReviewResponseKind,
};
pub use budget::{BudgetDimension, BudgetLedger, BudgetRemaining, BudgetSpec};
pub use capability::{Capability, CapabilitySet};
pub use checkpoint::{Checkpoint, CheckpointAck};
pub use envelope::{
    ContextSnapshot, InteractionStyle, Origin, TaskEnvelope, TaskPayload, TaskSubmission,
};
pub use events::{Clarification, EventKind, FailureReport, LogLevel, ProgressReport, TaskEvent};
pub use ids::{
    AgentId, AuditId, ConversationId, Id, IdMarker, NodeId, TaskId, TicketId, TrustContextId,
    WorkerId,
};
pub use manifest::{AgentDefinition, CapabilityManifest, EffectiveManifest, ManifestDocument, Permission};
pub use proposal::{ProposalBundle, ProposedOperation};
