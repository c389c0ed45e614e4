use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warrant_core::app::{
    AgentRunner, KernelBuilder, ReaperLoop, RunnerRegistry, Runtime, TaskContext, WorkerGroup,
    WorkerOptions,
};
use warrant_core::domain::{
    ActionId, CapabilitySet, FailureReport, LogLevel, ManifestDocument, ProposalBundle,
    ProposedOperation, TaskSubmission,
};
use warrant_core::impls::InMemoryApplier;
use warrant_core::inbox::ReviewResponse;
use warrant_core::policy::Permit;
use warrant_core::ports::ActionExecutor;

const RESEARCHER: &str = r#"{
    "agentId": "researcher",
    "allow": ["read", "navigate", "search", "web.search", "web.fetch"],
    "requireApproval": [],
    "budget": { "maxDurationMs": 60000, "maxToolCalls": 10, "maxExternalRequests": 5 }
}"#;

const SHARED: &str = r#"{
    "allow": ["read", "navigate", "search", "web.search", "web.fetch", "create", "relate"]
}"#;

/// Pretends to fetch pages.
struct CannedWeb;

#[async_trait]
impl ActionExecutor for CannedWeb {
    async fn execute(&self, permit: &Permit, params: &Value) -> Result<Value, String> {
        match permit.action() {
            ActionId::WebFetch => {
                let url = params["url"].as_str().ok_or("missing url")?;
                Ok(json!({ "url": url, "title": format!("Notes on {url}") }))
            }
            ActionId::Read => Ok(json!({ "nodes": [] })),
            other => Err(format!("no canned answer for `{other}`")),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Page {
    url: String,
    title: String,
}

/// researcher: read the target, fetch two pages, propose one node per page.
struct Researcher;

#[async_trait]
impl AgentRunner for Researcher {
    async fn run(&self, ctx: &mut TaskContext) -> Result<ProposalBundle, FailureReport> {
        let io = |e: warrant_core::KernelError| FailureReport::new("kernel", false).with_message(e.to_string());

        ctx.status("reading target").await.map_err(io)?;
        ctx.invoke(ActionId::Read, json!({})).await.map_err(io)?;

        let mut ops = Vec::new();
        let mut sources = Vec::new();
        for (i, url) in ["https://example.org/a", "https://example.org/b"].iter().enumerate() {
            let raw = ctx
                .invoke(ActionId::WebFetch, json!({ "url": url }))
                .await
                .map_err(io)?;
            let page: Page = serde_json::from_value(raw)
                .map_err(|e| FailureReport::new("bad_page", false).with_message(e.to_string()))?;
            ctx.log(LogLevel::Info, format!("fetched {}", page.url)).await.map_err(io)?;

            let mut op = ProposedOperation::create(format!("note-{i}"), None);
            if let ProposedOperation::Create { fields, .. } = &mut op {
                fields.insert("title".into(), Value::String(page.title));
            }
            ctx.stage(vec![op.clone()]).await.map_err(io)?;
            ctx.checkpoint(json!({ "fetched": i + 1 })).await.map_err(io)?;
            ops.push(op);
            sources.push(page.url);
        }

        Ok(ProposalBundle::new(ops, "two pages worth keeping").with_sources(sources))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,warrant_core=debug".into()),
        )
        .init();

    // (A) kernel: manifests + applier + executor
    let applier = Arc::new(InMemoryApplier::new());
    let kernel = KernelBuilder::new()
        .agent_document(ManifestDocument::from_json_str(RESEARCHER)?)
        .trust_document("shared", ManifestDocument::from_json_str(SHARED)?)
        .applier(applier.clone())
        .executor(Arc::new(CannedWeb))
        .expect_agents(&["researcher"])
        .build()?;

    // (B) runners + workers + reaper
    let mut runners = RunnerRegistry::new();
    runners.register("researcher", Arc::new(Researcher))?;
    let runtime = Arc::new(Runtime::new(Arc::new(runners)));

    let caps: CapabilitySet = ["research"].into_iter().collect();
    let workers = WorkerGroup::spawn(
        2,
        "worker",
        caps.clone(),
        kernel.clone(),
        runtime,
        WorkerOptions {
            poll_timeout: Duration::from_millis(200),
            heartbeat_interval: Duration::from_secs(1),
        },
    );
    let reaper = ReaperLoop::new(kernel.clone()).spawn();

    // (C) submit and follow the event stream
    let task_id = kernel
        .submit(
            TaskSubmission::new("demo-conversation", "cli", "researcher", "collect notes")
                .with_capabilities(caps),
        )
        .await?;
    info!(task_id = %task_id, "submitted");

    let mut events = kernel.subscribe(task_id)?;
    while let Some(batch) = events.next_batch().await {
        for event in batch {
            println!("{}", serde_json::to_string(&event)?);
        }
    }

    // (D) the review shows up right after the terminal event
    let mut review = None;
    for _ in 0..50 {
        review = kernel.review(task_id).await;
        if review.is_some() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    match review {
        Some(review) => {
            println!("review: {} ops, rationale={:?}", review.bundle.proposed_ops.len(), review.bundle.rationale);
            let status = kernel.respond_review(task_id, ReviewResponse::ApproveAll).await?;
            println!("review status: {status:?}, applier now holds {} nodes", applier.len());
        }
        None => warn!(task_id = %task_id, "no review presented"),
    }

    for record in kernel.audit_for(task_id).await {
        println!("audit: {}", serde_json::to_string(&record)?);
    }
    println!("counts: {:?}", kernel.counts().await);

    // (E) graceful shutdown
    workers.shutdown_and_join().await;
    reaper.shutdown().await;
    Ok(())
}
