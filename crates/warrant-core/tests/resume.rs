mod common;

use chrono::Duration;
use serde_json::json;

use common::{claimed, harness_with, research};
use warrant_core::config::KernelConfig;
use warrant_core::domain::{ActionId, BudgetSpec, DenyReason, WorkerId};
use warrant_core::error::KernelError;
use warrant_core::queue::{FailureReason, TaskStatus};

fn config(max_disconnects: u32) -> KernelConfig {
    KernelConfig {
        disconnect_grace_ms: 1_000,
        max_disconnects,
        ..KernelConfig::default()
    }
}

#[tokio::test]
async fn disconnected_task_resumes_from_latest_checkpoint_elsewhere() {
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config(3));
    let (task_id, w1) = claimed(&h.kernel, "w1").await;

    h.kernel.checkpoint(task_id, &w1, json!({ "step": 1 })).await.unwrap();
    let last = h.kernel.checkpoint(task_id, &w1, json!({ "step": 2 })).await.unwrap();

    // w1 goes silent past the grace period
    h.clock.advance(Duration::seconds(2));
    let report = h.kernel.reap().await;
    assert_eq!(report.resumable, vec![task_id]);
    assert_eq!(h.kernel.status(task_id).await.unwrap().status, TaskStatus::Resumable);

    // the old worker has lost the task
    assert!(matches!(
        h.kernel.heartbeat(task_id, &w1).await,
        Err(KernelError::NotClaimant { .. })
    ));
    let stale = h.kernel.authorize(task_id, &w1, ActionId::Read, json!({})).await;
    assert_eq!(stale.deny_reason(), Some(DenyReason::TaskNotActive));

    let w2 = WorkerId::new("w2");
    let claim = h.kernel.claim_next(&w2, &research()).await.unwrap();
    assert!(claim.resumed);
    assert_eq!(claim.attempt, 1);
    let from = claim.resume_from.unwrap();
    assert_eq!(from.seq, last.seq);
    assert_eq!(from.marker, json!({ "step": 2 }));

    let next = h.kernel.checkpoint(task_id, &w2, json!({ "step": 3 })).await.unwrap();
    assert!(next.seq > last.seq);

    let seqs: Vec<u64> = h.kernel.checkpoints(task_id).iter().map(|c| c.seq).collect();
    assert!(seqs.windows(2).all(|w| w[0] < w[1]));

    let view = h.kernel.status(task_id).await.unwrap();
    assert_eq!(view.disconnects, 1);
    assert_eq!(view.claimant, Some(w2));
}

#[tokio::test]
async fn heartbeats_keep_the_claim_alive() {
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config(3));
    let (task_id, w1) = claimed(&h.kernel, "w1").await;

    for _ in 0..3 {
        h.clock.advance(Duration::milliseconds(800));
        h.kernel.heartbeat(task_id, &w1).await.unwrap();
        assert!(h.kernel.reap().await.resumable.is_empty());
    }
    assert_eq!(h.kernel.status(task_id).await.unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn repeated_disconnects_fail_the_task() {
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config(1));
    let (task_id, _) = claimed(&h.kernel, "w1").await;

    h.clock.advance(Duration::seconds(2));
    assert_eq!(h.kernel.reap().await.resumable, vec![task_id]);

    let w2 = WorkerId::new("w2");
    assert!(h.kernel.claim_next(&w2, &research()).await.unwrap().resumed);
    h.clock.advance(Duration::seconds(2));
    let report = h.kernel.reap().await;
    assert_eq!(report.disconnected, vec![task_id]);
    assert_eq!(
        h.kernel.status(task_id).await.unwrap().status,
        TaskStatus::Failed(FailureReason::Disconnected)
    );
}

#[tokio::test]
async fn resume_point_without_checkpoints_is_none() {
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config(3));
    let (task_id, _) = claimed(&h.kernel, "w1").await;
    assert_eq!(h.kernel.resume(task_id).await.unwrap(), None);
}

#[tokio::test]
async fn answered_clarification_puts_the_task_back_in_progress() {
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config(3));
    let (task_id, w1) = claimed(&h.kernel, "w1").await;

    h.kernel
        .progress(
            task_id,
            &w1,
            warrant_core::domain::ProgressReport::Clarification {
                question: "which folder?".into(),
            },
        )
        .await
        .unwrap();
    assert_eq!(
        h.kernel.status(task_id).await.unwrap().status,
        TaskStatus::AwaitingClarification
    );

    // waiting on a human is not a disconnect
    h.clock.advance(Duration::seconds(10));
    assert!(h.kernel.reap().await.resumable.is_empty());
    let verdict = h.kernel.authorize(task_id, &w1, ActionId::Read, json!({})).await;
    assert_eq!(verdict.deny_reason(), Some(DenyReason::TaskNotActive));

    h.kernel.answer_clarification(task_id, "inbox").await.unwrap();
    assert_eq!(h.kernel.status(task_id).await.unwrap().status, TaskStatus::InProgress);
    assert!(h.kernel.authorize(task_id, &w1, ActionId::Read, json!({})).await.is_allowed());
}
