//! KernelBuilder - カーネルの構築とワイヤリング
//!
//! # 学習ポイント
//! - Builder パターンの実装
//! - 起動時検証（Fail-fast 設計）
//! - 開発体験の改善（明確なエラーメッセージ）

use std::collections::HashSet;
use std::sync::Arc;

use crate::app::Kernel;
use crate::audit::AuditLog;
use crate::checkpoint::CheckpointManager;
use crate::config::{KernelConfig, RateLimitConfig};
use crate::domain::{
    AgentDefinition, AgentId, CapabilityManifest, ManifestDocument, TrustContextId,
};
use crate::error::{Diagnostics, KernelError};
use crate::events::EventHub;
use crate::inbox::ProposalInbox;
use crate::policy::PolicyKernel;
use crate::ports::{
    ActionExecutor, Clock, DurableStateApplier, IdGenerator, ReferenceResolver, SystemClock,
    UlidGenerator,
};
use crate::queue::InMemoryTaskQueue;
use crate::rate_limit::RateLimiters;
use crate::registry::CapabilityRegistry;

/// KernelBuilder はカーネルを構築
///
/// # 使用例
/// ```ignore
/// let kernel = KernelBuilder::new()
///     .agent_document(ManifestDocument::from_json_str(raw)?)
///     .trust_context("shared", CapabilityManifest::new([ActionId::Read], [])?)
///     .applier(Arc::new(InMemoryApplier::new()))
///     .expect_agents(&["researcher"])
///     .build()?;
/// ```
///
/// # Fail-fast 設計
/// - マニフェストの検証は build() でまとめて行う
/// - expect_agents() で期待される agent を登録
/// - build() 時に「期待集合 ⊆ 登録済み集合」をチェック
/// - applier が無ければ BuildError
pub struct KernelBuilder {
    config: KernelConfig,
    agents: Vec<AgentDefinition>,
    agent_documents: Vec<ManifestDocument>,
    trust_contexts: Vec<(TrustContextId, CapabilityManifest)>,
    trust_documents: Vec<(TrustContextId, ManifestDocument)>,
    auto_approve: Vec<(AgentId, TrustContextId)>,
    expected_agents: Option<Vec<String>>,
    applier: Option<Arc<dyn DurableStateApplier>>,
    resolver: Option<Arc<dyn ReferenceResolver>>,
    executor: Option<Arc<dyn ActionExecutor>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
}

/// BuildError はカーネル構築時のエラー
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing agents: {0:?}. These agents were expected but not registered.")]
    MissingAgents(Vec<String>),
    #[error("Agent `{0}` is registered more than once.")]
    DuplicateAgent(AgentId),
    #[error("Invalid manifest `{name}`: {diagnostics}")]
    InvalidManifest { name: String, diagnostics: Diagnostics },
    #[error("Auto-approve names unregistered agent `{0}`.")]
    UnknownAutoApproveAgent(AgentId),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] KernelError),
    #[error("No DurableStateApplier configured; approved operations would have nowhere to go.")]
    MissingApplier,
}

impl KernelBuilder {
    pub fn new() -> Self {
        Self {
            config: KernelConfig::default(),
            agents: Vec::new(),
            agent_documents: Vec::new(),
            trust_contexts: Vec::new(),
            trust_documents: Vec::new(),
            auto_approve: Vec::new(),
            expected_agents: None,
            applier: None,
            resolver: None,
            executor: None,
            clock: None,
            ids: None,
        }
    }

    pub fn config(mut self, config: KernelConfig) -> Self {
        self.config = config;
        self
    }

    /// 検証済みの agent 定義を登録
    pub fn agent(mut self, agent: AgentDefinition) -> Self {
        self.agents.push(agent);
        self
    }

    /// wire 形式の agent マニフェスト（検証は build 時）
    pub fn agent_document(mut self, doc: ManifestDocument) -> Self {
        self.agent_documents.push(doc);
        self
    }

    pub fn trust_context(mut self, id: impl Into<TrustContextId>, manifest: CapabilityManifest) -> Self {
        self.trust_contexts.push((id.into(), manifest));
        self
    }

    /// wire 形式の trust context マニフェスト（agentId と budget は無視）
    pub fn trust_document(mut self, id: impl Into<TrustContextId>, doc: ManifestDocument) -> Self {
        self.trust_documents.push((id.into(), doc));
        self
    }

    /// (agent, trust context) の組に対する事前承認
    pub fn auto_approve(mut self, agent: impl Into<AgentId>, trust: impl Into<TrustContextId>) -> Self {
        self.auto_approve.push((agent.into(), trust.into()));
        self
    }

    pub fn rate_limit(mut self, limit: RateLimitConfig) -> Self {
        self.config.rate_limits.push(limit);
        self
    }

    pub fn applier(mut self, applier: Arc<dyn DurableStateApplier>) -> Self {
        self.applier = Some(applier);
        self
    }

    /// 編集された bundle の検証に使う現在の状態（未設定ならタスクのスナップショット）
    pub fn resolver(mut self, resolver: Arc<dyn ReferenceResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// 期待される agent のリストを設定
    pub fn expect_agents(mut self, agents: &[&str]) -> Self {
        self.expected_agents = Some(agents.iter().map(|a| a.to_string()).collect());
        self
    }

    /// KernelBuilder を構築して Kernel を生成
    ///
    /// # 検証
    /// - 設定値
    /// - マニフェスト（未知のアクション、allow と requireApproval の重複）
    /// - agent の重複、expect_agents() の不足
    /// - auto-approve の agent が登録済みか
    /// - applier の有無
    pub fn build(self) -> Result<Kernel, BuildError> {
        self.config.validate()?;

        let mut agents = self.agents;
        for doc in &self.agent_documents {
            let name = doc
                .agent_id
                .as_ref()
                .map_or_else(|| "<agent>".to_string(), ToString::to_string);
            let agent = AgentDefinition::from_document(doc)
                .map_err(|diagnostics| BuildError::InvalidManifest { name, diagnostics })?;
            agents.push(agent);
        }

        let mut seen = HashSet::new();
        for agent in &agents {
            if !seen.insert(agent.agent_id.clone()) {
                return Err(BuildError::DuplicateAgent(agent.agent_id.clone()));
            }
        }

        if let Some(expected) = &self.expected_agents {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !seen.contains(&AgentId::new(name.as_str())))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingAgents(missing));
            }
        }

        for (agent, _) in &self.auto_approve {
            if !seen.contains(agent) {
                return Err(BuildError::UnknownAutoApproveAgent(agent.clone()));
            }
        }

        let mut trust_contexts = self.trust_contexts;
        for (id, doc) in &self.trust_documents {
            let manifest = CapabilityManifest::from_document(doc).map_err(|diagnostics| {
                BuildError::InvalidManifest {
                    name: id.to_string(),
                    diagnostics,
                }
            })?;
            trust_contexts.push((id.clone(), manifest));
        }

        let applier = self.applier.ok_or(BuildError::MissingApplier)?;
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(Arc::clone(&clock))));

        let config = Arc::new(self.config);
        let registry = Arc::new(CapabilityRegistry::with_entries(agents, trust_contexts));
        let events = Arc::new(EventHub::new());
        let audit = Arc::new(AuditLog::new(Arc::clone(&clock), Arc::clone(&ids)));
        let checkpoints = Arc::new(CheckpointManager::new());
        let queue = Arc::new(InMemoryTaskQueue::new(
            config.as_ref().clone(),
            Arc::clone(&clock),
            Arc::clone(&events),
            Arc::clone(&audit),
            Arc::clone(&checkpoints),
        ));

        let mut inbox = ProposalInbox::new(applier, Arc::clone(&audit), Arc::clone(&clock))
            .with_auto_approve(self.auto_approve);
        if let Some(resolver) = self.resolver {
            inbox = inbox.with_resolver(resolver);
        }
        let inbox = Arc::new(inbox);

        let mut policy = PolicyKernel::new(
            Arc::clone(&registry),
            Arc::clone(&queue),
            Arc::clone(&audit),
            Arc::clone(&inbox),
            RateLimiters::from_config(&config.rate_limits),
            Arc::clone(&ids),
            Arc::clone(&clock),
        );
        if let Some(executor) = self.executor {
            policy = policy.with_executor(executor);
        }

        Ok(Kernel {
            config,
            registry,
            queue,
            policy: Arc::new(policy),
            inbox,
            events,
            audit,
            checkpoints,
            ids,
            clock,
        })
    }
}

impl Default for KernelBuilder {
    fn default() -> Self {
        Self::new()
    }
}
