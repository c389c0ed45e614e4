//! Proposed operations: the only form in which an agent's work reaches
//! durable state.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ids::NodeId;
use crate::error::Diagnostics;
use crate::ports::ReferenceResolver;

/// One structural change, addressed by stable node ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ProposedOperation {
    #[serde(rename_all = "camelCase")]
    Create {
        target_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<NodeId>,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        target_id: NodeId,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    #[serde(rename_all = "camelCase")]
    Delete { target_id: NodeId },
    /// Links `target_id` to `parent_id`.
    #[serde(rename_all = "camelCase")]
    Relate {
        target_id: NodeId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<NodeId>,
    },
}

impl ProposedOperation {
    pub fn target_id(&self) -> &NodeId {
        match self {
            ProposedOperation::Create { target_id, .. }
            | ProposedOperation::Update { target_id, .. }
            | ProposedOperation::Delete { target_id }
            | ProposedOperation::Relate { target_id, .. } => target_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProposedOperation::Create { .. } => "create",
            ProposedOperation::Update { .. } => "update",
            ProposedOperation::Delete { .. } => "delete",
            ProposedOperation::Relate { .. } => "relate",
        }
    }

    pub fn create(target_id: impl Into<NodeId>, parent_id: Option<NodeId>) -> Self {
        ProposedOperation::Create {
            target_id: target_id.into(),
            parent_id,
            fields: Map::new(),
        }
    }
}

/// What a worker hands back on completion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalBundle {
    pub proposed_ops: Vec<ProposedOperation>,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub sources: Vec<String>,
}

impl ProposalBundle {
    pub fn new(proposed_ops: Vec<ProposedOperation>, rationale: impl Into<String>) -> Self {
        Self {
            proposed_ops,
            rationale: rationale.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<String>) -> Self {
        self.sources = sources;
        self
    }
}

/// Checks a bundle in order against `existing`, simulating creates and
/// deletes as it goes. Every problem is reported; nothing is coerced.
pub fn validate(ops: &[ProposedOperation], existing: &dyn ReferenceResolver) -> Result<(), Diagnostics> {
    let mut diagnostics = Diagnostics::default();
    let mut created: HashSet<&NodeId> = HashSet::new();
    let mut deleted: HashSet<&NodeId> = HashSet::new();

    let resolves = |id: &NodeId, created: &HashSet<&NodeId>, deleted: &HashSet<&NodeId>| {
        !deleted.contains(id) && (created.contains(id) || existing.exists(id))
    };

    for (index, op) in ops.iter().enumerate() {
        let target = op.target_id();
        let at = format!("op[{index}] {}", op.kind());

        if target.as_str().is_empty() {
            diagnostics.push(format!("{at}: empty targetId"));
            continue;
        }
        if deleted.contains(target) {
            diagnostics.push(format!("{at}: `{target}` was deleted earlier in the bundle"));
            continue;
        }

        match op {
            ProposedOperation::Create { parent_id, .. } => {
                if created.contains(target) || existing.exists(target) {
                    diagnostics.push(format!("{at}: `{target}` already exists"));
                }
                if let Some(parent) = parent_id
                    && !resolves(parent, &created, &deleted)
                {
                    diagnostics.push(format!("{at}: parent `{parent}` cannot be resolved"));
                }
                created.insert(target);
            }
            ProposedOperation::Update { fields, .. } => {
                if !resolves(target, &created, &deleted) {
                    diagnostics.push(format!("{at}: `{target}` does not exist"));
                }
                if fields.is_empty() {
                    diagnostics.push(format!("{at}: no fields to update"));
                }
            }
            ProposedOperation::Delete { .. } => {
                if !resolves(target, &created, &deleted) {
                    diagnostics.push(format!("{at}: `{target}` does not exist"));
                }
                deleted.insert(target);
            }
            ProposedOperation::Relate { parent_id, .. } => {
                if !resolves(target, &created, &deleted) {
                    diagnostics.push(format!("{at}: `{target}` does not exist"));
                }
                match parent_id {
                    None => diagnostics.push(format!("{at}: relate requires parentId")),
                    Some(parent) if !resolves(parent, &created, &deleted) => {
                        diagnostics.push(format!("{at}: parent `{parent}` cannot be resolved"));
                    }
                    Some(_) => {}
                }
            }
        }
    }

    diagnostics.into_result()
}
