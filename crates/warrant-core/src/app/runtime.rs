//! Runtime - ワーカー側でエージェントを動かす
//!
//! agent_id → AgentRunner の対応表と、実行中のタスクに渡す TaskContext。
//! ランナーは TaskContext 越しにしか kernel に触れない。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::app::Kernel;
use crate::domain::{
    ActionId, AgentId, Checkpoint, CheckpointAck, Clarification, EventKind, FailureReport,
    LogLevel, ProgressReport, ProposalBundle, ProposedOperation, TaskEnvelope, TaskId, WorkerId,
};
use crate::error::KernelError;
use crate::policy::Verdict;
use crate::queue::Claim;

/// Runs one task for one agent definition.
///
/// On resume, `ctx.resume_from()` holds the last checkpoint; the runner is
/// expected to skip work it already did (see [`TaskContext::already_done`]).
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, ctx: &mut TaskContext) -> Result<ProposalBundle, FailureReport>;
}

/// Registry of runners (agent_id -> runner).
///
/// Design:
/// - Built during initialization (mutable).
/// - Used during runtime (immutable).
#[derive(Default)]
pub struct RunnerRegistry {
    runners: HashMap<AgentId, Arc<dyn AgentRunner>>,
}

#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("a runner for agent `{0}` is already registered")]
    Duplicate(AgentId),
}

impl RunnerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        agent_id: impl Into<AgentId>,
        runner: Arc<dyn AgentRunner>,
    ) -> Result<(), RunnerError> {
        let agent_id = agent_id.into();
        if self.runners.contains_key(&agent_id) {
            return Err(RunnerError::Duplicate(agent_id));
        }
        self.runners.insert(agent_id, runner);
        Ok(())
    }

    pub fn get(&self, agent_id: &AgentId) -> Option<&Arc<dyn AgentRunner>> {
        self.runners.get(agent_id)
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }
}

/// Runtime dispatches a claimed task to the runner of its agent.
pub struct Runtime {
    registry: Arc<RunnerRegistry>,
}

impl Runtime {
    pub fn new(registry: Arc<RunnerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RunnerRegistry {
        &self.registry
    }

    pub async fn execute(&self, ctx: &mut TaskContext) -> Result<ProposalBundle, FailureReport> {
        let agent_id = ctx.envelope().agent_id().clone();
        let runner = self.registry.get(&agent_id).cloned().ok_or_else(|| {
            FailureReport::new("no_runner", false)
                .with_message(format!("no runner for agent `{agent_id}`"))
        })?;
        runner.run(ctx).await
    }
}

/// What a runner sees of the kernel while it holds a task.
pub struct TaskContext {
    kernel: Kernel,
    worker: WorkerId,
    claim: Claim,
}

impl TaskContext {
    pub fn new(kernel: Kernel, worker: WorkerId, claim: Claim) -> Self {
        Self {
            kernel,
            worker,
            claim,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.claim.task_id()
    }

    pub fn worker(&self) -> &WorkerId {
        &self.worker
    }

    pub fn envelope(&self) -> &TaskEnvelope {
        &self.claim.envelope
    }

    pub fn claim(&self) -> &Claim {
        &self.claim
    }

    pub fn is_resumed(&self) -> bool {
        self.claim.resumed
    }

    pub fn resume_from(&self) -> Option<&Checkpoint> {
        self.claim.resume_from.as_ref()
    }

    pub async fn authorize(&self, action: ActionId, params: Value) -> Verdict {
        self.kernel
            .authorize(self.task_id(), &self.worker, action, params)
            .await
    }

    /// Runs an action through the policy kernel, waiting out any approval.
    pub async fn invoke(&self, action: ActionId, params: Value) -> Result<Value, KernelError> {
        self.kernel
            .invoke_blocking(self.task_id(), &self.worker, action, params)
            .await
    }

    /// Whether this exact call was allowed before, e.g. by the worker that
    /// disconnected.
    pub async fn already_done(&self, action: &ActionId, params: &Value) -> bool {
        self.kernel.was_allowed(self.task_id(), action, params).await
    }

    pub async fn checkpoint(&self, marker: Value) -> Result<CheckpointAck, KernelError> {
        self.kernel
            .checkpoint(self.task_id(), &self.worker, marker)
            .await
    }

    pub async fn log(&self, level: LogLevel, message: impl Into<String>) -> Result<(), KernelError> {
        self.report(ProgressReport::Log {
            level,
            message: message.into(),
        })
        .await
    }

    pub async fn status(&self, detail: impl Into<String>) -> Result<(), KernelError> {
        self.report(ProgressReport::Status {
            detail: detail.into(),
        })
        .await
    }

    /// Keeps partial work aside so it can be offered if the budget runs out.
    pub async fn stage(&self, ops: Vec<ProposedOperation>) -> Result<(), KernelError> {
        self.report(ProgressReport::Staged { ops }).await
    }

    /// Asks the submitter a question and waits for the answer.
    ///
    /// There is no timeout. A cancellation request, before or after the
    /// question, ends the wait with `Ok(None)`.
    pub async fn ask(&self, question: impl Into<String>) -> Result<Option<String>, KernelError> {
        let mut events = self.kernel.subscribe(self.task_id())?;
        // skip what was published before the question
        events.try_batch();
        let asked = self
            .report(ProgressReport::Clarification {
                question: question.into(),
            })
            .await;
        match asked {
            Ok(()) => {}
            Err(KernelError::CancelRequested(_)) => return Ok(None),
            Err(err) => return Err(err),
        }

        while let Some(batch) = events.next_batch().await {
            for event in batch {
                match event.kind {
                    EventKind::Clarification(Clarification::Answered { answer }) => {
                        return Ok(Some(answer));
                    }
                    EventKind::Status {
                        detail: Some(detail),
                        ..
                    } if detail == "cancel_requested" => return Ok(None),
                    _ => {}
                }
            }
        }
        Ok(None)
    }

    async fn report(&self, report: ProgressReport) -> Result<(), KernelError> {
        self.kernel
            .progress(self.task_id(), &self.worker, report)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::KernelBuilder;
    use crate::domain::{AgentDefinition, BudgetSpec, CapabilityManifest, CapabilitySet, TaskSubmission};
    use crate::impls::InMemoryApplier;

    struct OkRunner;

    #[async_trait]
    impl AgentRunner for OkRunner {
        async fn run(&self, _ctx: &mut TaskContext) -> Result<ProposalBundle, FailureReport> {
            Ok(ProposalBundle::new(vec![], "nothing to add"))
        }
    }

    async fn claimed(agent: &str) -> TaskContext {
        let kernel = KernelBuilder::new()
            .agent(AgentDefinition::new(
                agent,
                CapabilityManifest::new([ActionId::Read], []).unwrap(),
                BudgetSpec::default(),
            ))
            .trust_context("shared", CapabilityManifest::new([ActionId::Read], []).unwrap())
            .applier(Arc::new(InMemoryApplier::new()))
            .build()
            .unwrap();
        kernel
            .submit(TaskSubmission::new("c1", "test", agent, "do it"))
            .await
            .unwrap();
        let worker = WorkerId::new("w1");
        let claim = kernel.claim_next(&worker, &CapabilitySet::new()).await.unwrap();
        TaskContext::new(kernel, worker, claim)
    }

    #[tokio::test]
    async fn runtime_executes_registered_runner() {
        let mut reg = RunnerRegistry::new();
        reg.register("ok", Arc::new(OkRunner)).unwrap();
        assert!(reg.register("ok", Arc::new(OkRunner)).is_err());

        let rt = Runtime::new(Arc::new(reg));
        let mut ctx = claimed("ok").await;
        let bundle = rt.execute(&mut ctx).await.unwrap();
        assert_eq!(bundle.rationale, "nothing to add");
    }

    #[tokio::test]
    async fn ask_after_cancel_returns_none() {
        let ctx = claimed("ok").await;
        ctx.kernel.cancel(ctx.task_id()).await.unwrap();

        let answer = tokio::time::timeout(std::time::Duration::from_millis(500), ctx.ask("which?"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, None);
        let view = ctx.kernel.status(ctx.task_id()).await.unwrap();
        assert_eq!(view.status, crate::queue::TaskStatus::InProgress);
    }

    #[tokio::test]
    async fn cancel_while_asking_ends_the_wait() {
        let ctx = claimed("ok").await;
        let kernel = ctx.kernel.clone();
        let task_id = ctx.task_id();
        let canceller = tokio::spawn(async move {
            while kernel.status(task_id).await.unwrap().status
                != crate::queue::TaskStatus::AwaitingClarification
            {
                tokio::task::yield_now().await;
            }
            kernel.cancel(task_id).await.unwrap();
        });

        let answer = tokio::time::timeout(std::time::Duration::from_secs(1), ctx.ask("which?"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(answer, None);
        canceller.await.unwrap();
    }

    #[tokio::test]
    async fn runtime_fails_when_runner_missing() {
        let rt = Runtime::new(Arc::new(RunnerRegistry::new()));
        let mut ctx = claimed("missing").await;
        let err = rt.execute(&mut ctx).await.unwrap_err();
        assert_eq!(err.code, "no_runner");
        assert!(!err.retryable);
    }
}
