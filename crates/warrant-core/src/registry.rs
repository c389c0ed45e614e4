//! Capability registry: manifests per agent definition and per trust context.

use std::collections::HashMap;

use tokio::sync::RwLock;
use tracing::info;

use crate::domain::{
    AgentDefinition, AgentId, CapabilityManifest, DenyReason, EffectiveManifest, TrustContextId,
};

/// Read-concurrent store of manifests.
///
/// Registering the same agent or trust context again replaces it; tasks pick
/// up the change on their next authorization since effective manifests are
/// never cached. Budget templates are copied at submission, so a replaced
/// agent budget affects only later tasks.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    agents: RwLock<HashMap<AgentId, AgentDefinition>>,
    trust_contexts: RwLock<HashMap<TrustContextId, CapabilityManifest>>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds the registry outside an async context (builder).
    pub fn with_entries(
        agents: impl IntoIterator<Item = AgentDefinition>,
        trust_contexts: impl IntoIterator<Item = (TrustContextId, CapabilityManifest)>,
    ) -> Self {
        Self {
            agents: RwLock::new(
                agents
                    .into_iter()
                    .map(|agent| (agent.agent_id.clone(), agent))
                    .collect(),
            ),
            trust_contexts: RwLock::new(trust_contexts.into_iter().collect()),
        }
    }

    pub async fn register_agent(&self, agent: AgentDefinition) {
        info!(agent_id = %agent.agent_id, allow = agent.manifest.allow().len(), "agent manifest registered");
        self.agents.write().await.insert(agent.agent_id.clone(), agent);
    }

    pub async fn set_trust_context(&self, id: TrustContextId, manifest: CapabilityManifest) {
        info!(trust_context = %id, allow = manifest.allow().len(), "trust context registered");
        self.trust_contexts.write().await.insert(id, manifest);
    }

    pub async fn agent(&self, agent_id: &AgentId) -> Option<AgentDefinition> {
        self.agents.read().await.get(agent_id).cloned()
    }

    pub async fn trust_context(&self, id: &TrustContextId) -> Option<CapabilityManifest> {
        self.trust_contexts.read().await.get(id).cloned()
    }

    pub async fn agent_ids(&self) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self.agents.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Intersection of the agent's manifest and the trust context's,
    /// computed fresh. Either side missing is `no_manifest`.
    pub async fn effective(
        &self,
        agent_id: &AgentId,
        trust: &TrustContextId,
    ) -> Result<EffectiveManifest, DenyReason> {
        let agent = self
            .agents
            .read()
            .await
            .get(agent_id)
            .map(|a| a.manifest.clone())
            .ok_or(DenyReason::NoManifest)?;
        let trust = self
            .trust_contexts
            .read()
            .await
            .get(trust)
            .cloned()
            .ok_or(DenyReason::NoManifest)?;
        Ok(EffectiveManifest::intersect(agent, trust))
    }
}
