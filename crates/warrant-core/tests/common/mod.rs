#![allow(dead_code)]

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{Value, json};

use warrant_core::Kernel;
use warrant_core::app::KernelBuilder;
use warrant_core::config::KernelConfig;
use warrant_core::domain::{
    ActionId, AgentDefinition, AuditAction, AuditDecision, AuditRecord, BudgetSpec,
    CapabilityManifest, CapabilitySet, TaskId, TaskSubmission, WorkerId,
};
use warrant_core::impls::InMemoryApplier;
use warrant_core::policy::Permit;
use warrant_core::ports::{ActionExecutor, FixedClock};

/// Echoes the action and params back.
pub struct Echo;

#[async_trait]
impl ActionExecutor for Echo {
    async fn execute(&self, permit: &Permit, params: &Value) -> Result<Value, String> {
        Ok(json!({ "action": permit.action().as_str(), "params": params }))
    }
}

pub struct Harness {
    pub kernel: Kernel,
    pub clock: Arc<FixedClock>,
    pub applier: Arc<InMemoryApplier>,
}

pub fn clock() -> Arc<FixedClock> {
    Arc::new(FixedClock::new(
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
    ))
}

pub fn manifest(allow: &[&str], require_approval: &[&str]) -> CapabilityManifest {
    CapabilityManifest::new(
        allow.iter().map(|a| ActionId::parse(a)),
        require_approval.iter().map(|a| ActionId::parse(a)),
    )
    .unwrap()
}

/// "researcher" with the given manifest and budget under a permissive
/// "shared" trust context.
pub fn builder(allow: &[&str], require_approval: &[&str], budget: BudgetSpec) -> (KernelBuilder, Arc<FixedClock>, Arc<InMemoryApplier>) {
    let clock = clock();
    let applier = Arc::new(InMemoryApplier::new());
    let builder = KernelBuilder::new()
        .agent(AgentDefinition::new(
            "researcher",
            manifest(allow, require_approval),
            budget,
        ))
        .trust_context(
            "shared",
            manifest(
                &["read", "navigate", "search", "delete", "web.fetch", "web.search"],
                &[],
            ),
        )
        .applier(applier.clone())
        .executor(Arc::new(Echo))
        .clock(clock.clone());
    (builder, clock, applier)
}

pub fn harness(allow: &[&str], require_approval: &[&str], budget: BudgetSpec) -> Harness {
    harness_with(allow, require_approval, budget, KernelConfig::default())
}

pub fn harness_with(
    allow: &[&str],
    require_approval: &[&str],
    budget: BudgetSpec,
    config: KernelConfig,
) -> Harness {
    let (builder, clock, applier) = builder(allow, require_approval, budget);
    let kernel = builder.config(config).build().unwrap();
    Harness {
        kernel,
        clock,
        applier,
    }
}

pub fn research() -> CapabilitySet {
    ["research"].into_iter().collect()
}

pub fn submission(conversation: &str) -> TaskSubmission {
    TaskSubmission::new(conversation, "tests", "researcher", "look into it")
        .with_capabilities(research())
}

/// Submits one research task and claims it as `worker`.
pub async fn claimed(kernel: &Kernel, worker: &str) -> (TaskId, WorkerId) {
    let task_id = kernel.submit(submission("conv")).await.unwrap();
    let worker = WorkerId::new(worker);
    let claim = kernel.claim_next(&worker, &research()).await.unwrap();
    assert_eq!(claim.task_id(), task_id);
    (task_id, worker)
}

pub fn invoke_decisions(records: &[AuditRecord]) -> Vec<AuditDecision> {
    records
        .iter()
        .filter(|r| matches!(r.action, AuditAction::Invoke { .. }))
        .map(|r| r.decision.clone())
        .collect()
}
