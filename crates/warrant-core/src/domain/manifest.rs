//! Capability manifests and effective-permission computation.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::action::ActionId;
use super::budget::BudgetSpec;
use super::ids::AgentId;
use crate::error::Diagnostics;

/// Manifest as it arrives on the wire.
///
/// `agentId` and `budget` are meaningful on agent manifests only; a trust
/// context ignores both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    #[serde(default)]
    pub allow: Vec<ActionId>,
    #[serde(default)]
    pub require_approval: Vec<ActionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<BudgetSpec>,
}

impl ManifestDocument {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }
}

/// Permission of one action under a manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Allowed,
    RequiresApproval,
    Denied,
}

/// A validated allow set plus a disjoint require-approval set.
///
/// Anything in neither set is denied. Only constructed through
/// [`CapabilityManifest::new`], so it has no `Deserialize`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityManifest {
    allow: BTreeSet<ActionId>,
    require_approval: BTreeSet<ActionId>,
}

impl CapabilityManifest {
    /// Builds a manifest, rejecting overlap between the two sets and any
    /// action outside the known vocabulary.
    pub fn new(
        allow: impl IntoIterator<Item = ActionId>,
        require_approval: impl IntoIterator<Item = ActionId>,
    ) -> Result<Self, Diagnostics> {
        let allow: BTreeSet<ActionId> = allow.into_iter().collect();
        let require_approval: BTreeSet<ActionId> = require_approval.into_iter().collect();

        let mut diagnostics = Diagnostics::default();
        for action in allow.iter().chain(require_approval.iter()) {
            if !action.is_known() {
                diagnostics.push(format!("unknown action id `{action}`"));
            }
        }
        for action in allow.intersection(&require_approval) {
            diagnostics.push(format!(
                "`{action}` appears in both allow and requireApproval"
            ));
        }
        diagnostics.into_result()?;

        Ok(Self {
            allow,
            require_approval,
        })
    }

    /// Convenience for the wire form.
    pub fn from_document(doc: &ManifestDocument) -> Result<Self, Diagnostics> {
        Self::new(doc.allow.iter().cloned(), doc.require_approval.iter().cloned())
    }

    pub fn permission(&self, action: &ActionId) -> Permission {
        if self.allow.contains(action) {
            Permission::Allowed
        } else if self.require_approval.contains(action) {
            Permission::RequiresApproval
        } else {
            Permission::Denied
        }
    }

    pub fn allow(&self) -> &BTreeSet<ActionId> {
        &self.allow
    }

    pub fn require_approval(&self) -> &BTreeSet<ActionId> {
        &self.require_approval
    }
}

/// Intersection of an agent manifest and a trust-context manifest.
///
/// Computed per authorization and never cached, so registry updates apply to
/// the next check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveManifest {
    agent: CapabilityManifest,
    trust: CapabilityManifest,
}

impl EffectiveManifest {
    pub fn intersect(agent: CapabilityManifest, trust: CapabilityManifest) -> Self {
        Self { agent, trust }
    }

    /// Present in both manifests; approval required if either one asks.
    pub fn permission(&self, action: &ActionId) -> Permission {
        use Permission::*;
        match (self.agent.permission(action), self.trust.permission(action)) {
            (Denied, _) | (_, Denied) => Denied,
            (Allowed, Allowed) => Allowed,
            _ => RequiresApproval,
        }
    }
}

/// An agent definition: identity, manifest and budget template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentDefinition {
    pub agent_id: AgentId,
    pub manifest: CapabilityManifest,
    pub budget: BudgetSpec,
}

impl AgentDefinition {
    pub fn new(agent_id: impl Into<AgentId>, manifest: CapabilityManifest, budget: BudgetSpec) -> Self {
        Self {
            agent_id: agent_id.into(),
            manifest,
            budget,
        }
    }

    /// Reads an agent manifest document. `agentId` is required here.
    pub fn from_document(doc: &ManifestDocument) -> Result<Self, Diagnostics> {
        let Some(agent_id) = doc.agent_id.clone() else {
            return Err(Diagnostics::single("agent manifest is missing agentId"));
        };
        let manifest = CapabilityManifest::from_document(doc)?;
        Ok(Self {
            agent_id,
            manifest,
            budget: doc.budget.unwrap_or_default(),
        })
    }
}
