//! Task envelope: the immutable unit of work a collaborator submits.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::capability::CapabilitySet;
use super::ids::{AgentId, ConversationId, NodeId, TaskId, TrustContextId};

/// Whether the agent may stop and ask the user questions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionStyle {
    #[default]
    Interactive,
    /// Background enrichment; clarification requests are refused.
    Silent,
}

/// Versioned copy of the application state the task was dispatched against.
///
/// `known_ids` are the node ids proposals may reference without creating them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshot {
    pub version: u64,
    #[serde(default)]
    pub known_ids: BTreeSet<NodeId>,
    #[serde(default)]
    pub data: Value,
}

impl ContextSnapshot {
    pub fn new(version: u64, known_ids: impl IntoIterator<Item = NodeId>) -> Self {
        Self {
            version,
            known_ids: known_ids.into_iter().collect(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Origin {
    /// Submitting collaborator (e.g. "sidebar", "doc-import").
    pub submitter: String,
    pub requested_capabilities: CapabilitySet,
    pub interaction_style: InteractionStyle,
    pub trust_context: TrustContextId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub agent_id: AgentId,
    /// Forwarded to the worker verbatim. Never consulted by the policy path.
    pub instruction: String,
    pub target_ref: Option<NodeId>,
    pub context_snapshot: ContextSnapshot,
    pub memory_ref: Option<String>,
}

/// Immutable envelope. Status lives in the queue's record beside it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskEnvelope {
    task_id: TaskId,
    conversation_id: ConversationId,
    origin: Origin,
    payload: TaskPayload,
}

impl TaskEnvelope {
    pub fn new(
        task_id: TaskId,
        conversation_id: ConversationId,
        origin: Origin,
        payload: TaskPayload,
    ) -> Self {
        Self {
            task_id,
            conversation_id,
            origin,
            payload,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn origin(&self) -> &Origin {
        &self.origin
    }

    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    pub fn agent_id(&self) -> &AgentId {
        &self.payload.agent_id
    }

    pub fn trust_context(&self) -> &TrustContextId {
        &self.origin.trust_context
    }

    pub fn requested_capabilities(&self) -> &CapabilitySet {
        &self.origin.requested_capabilities
    }

    pub fn interaction_style(&self) -> InteractionStyle {
        self.origin.interaction_style
    }

    pub fn context_snapshot(&self) -> &ContextSnapshot {
        &self.payload.context_snapshot
    }
}

/// Submission message as sent by a collaborator.
///
/// The trust context is not part of the message. Whoever hands the message
/// to the kernel decides it (see `Kernel::submit_as`), so a task defined in
/// shared content cannot name a more trusted context for itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSubmission {
    #[serde(default)]
    pub task_id: Option<TaskId>,
    pub conversation_id: ConversationId,
    pub origin: String,
    #[serde(default)]
    pub requested_capabilities: CapabilitySet,
    #[serde(default)]
    pub interaction_style: InteractionStyle,
    pub agent_id: AgentId,
    pub instruction: String,
    #[serde(default)]
    pub target_ref: Option<NodeId>,
    #[serde(default)]
    pub context_snapshot: ContextSnapshot,
    #[serde(default)]
    pub memory_ref: Option<String>,
}

impl TaskSubmission {
    pub fn new(
        conversation_id: impl Into<ConversationId>,
        origin: impl Into<String>,
        agent_id: impl Into<AgentId>,
        instruction: impl Into<String>,
    ) -> Self {
        Self {
            task_id: None,
            conversation_id: conversation_id.into(),
            origin: origin.into(),
            requested_capabilities: CapabilitySet::default(),
            interaction_style: InteractionStyle::default(),
            agent_id: agent_id.into(),
            instruction: instruction.into(),
            target_ref: None,
            context_snapshot: ContextSnapshot::default(),
            memory_ref: None,
        }
    }

    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn with_task_id(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.requested_capabilities = capabilities;
        self
    }

    pub fn with_style(mut self, style: InteractionStyle) -> Self {
        self.interaction_style = style;
        self
    }

    pub fn with_target(mut self, target: impl Into<NodeId>) -> Self {
        self.target_ref = Some(target.into());
        self
    }

    pub fn with_snapshot(mut self, snapshot: ContextSnapshot) -> Self {
        self.context_snapshot = snapshot;
        self
    }

    /// Seals the submission under `trust`.
    pub fn into_envelope(self, task_id: TaskId, trust: TrustContextId) -> TaskEnvelope {
        let origin = Origin {
            submitter: self.origin,
            requested_capabilities: self.requested_capabilities,
            interaction_style: self.interaction_style,
            trust_context: trust,
        };
        let payload = TaskPayload {
            agent_id: self.agent_id,
            instruction: self.instruction,
            target_ref: self.target_ref,
            context_snapshot: self.context_snapshot,
            memory_ref: self.memory_ref,
        };
        TaskEnvelope::new(task_id, self.conversation_id, origin, payload)
    }
}
