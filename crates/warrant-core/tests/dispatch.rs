mod common;

use chrono::Duration;

use common::{harness, harness_with, research, submission};
use warrant_core::config::{AdmissionConfig, KernelConfig};
use warrant_core::domain::{BudgetSpec, CapabilitySet, EventKind, FailureReport, WorkerId};
use warrant_core::error::KernelError;
use warrant_core::queue::{FailureReason, TaskStatus};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn two_workers_race_one_task_and_only_one_wins() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let task_id = h.kernel.submit(submission("conv")).await.unwrap();

    let spawn_claim = |name: &'static str| {
        let kernel = h.kernel.clone();
        tokio::spawn(async move { kernel.claim_next(&WorkerId::new(name), &research()).await })
    };
    let (a, b) = tokio::join!(spawn_claim("w1"), spawn_claim("w2"));
    let claims: Vec<_> = [a.unwrap(), b.unwrap()].into_iter().flatten().collect();

    assert_eq!(claims.len(), 1);
    assert_eq!(claims[0].task_id(), task_id);
    assert_eq!(h.kernel.status(task_id).await.unwrap().status, TaskStatus::InProgress);
}

#[tokio::test]
async fn worker_without_required_capability_gets_nothing() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    h.kernel.submit(submission("conv")).await.unwrap();

    let image: CapabilitySet = ["image"].into_iter().collect();
    assert!(h.kernel.claim_next(&WorkerId::new("painter"), &image).await.is_none());

    let both: CapabilitySet = ["image", "research"].into_iter().collect();
    assert!(h.kernel.claim_next(&WorkerId::new("generalist"), &both).await.is_some());
}

#[tokio::test]
async fn same_class_is_served_in_submission_order() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let first = h.kernel.submit(submission("a")).await.unwrap();
    let second = h.kernel.submit(submission("b")).await.unwrap();

    let w = WorkerId::new("w1");
    assert_eq!(h.kernel.claim_next(&w, &research()).await.unwrap().task_id(), first);
    assert_eq!(h.kernel.claim_next(&w, &research()).await.unwrap().task_id(), second);
}

#[tokio::test]
async fn unknown_agent_is_rejected_at_submit() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let sub = warrant_core::domain::TaskSubmission::new("conv", "tests", "ghost", "hi");
    let err = h.kernel.submit(sub).await.unwrap_err();
    assert!(matches!(err, KernelError::ValidationFailed(_)));
}

#[tokio::test]
async fn admission_caps_open_tasks_per_conversation() {
    let config = KernelConfig {
        admission: AdmissionConfig {
            max_pending_per_conversation: Some(1),
            min_submit_interval_ms: None,
        },
        ..KernelConfig::default()
    };
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config);

    h.kernel.submit(submission("conv")).await.unwrap();
    let err = h.kernel.submit(submission("conv")).await.unwrap_err();
    assert!(matches!(err, KernelError::AdmissionRejected { .. }));

    // other conversations are unaffected
    assert!(h.kernel.submit(submission("other")).await.is_ok());
}

#[tokio::test]
async fn admission_debounces_rapid_submissions() {
    let config = KernelConfig {
        admission: AdmissionConfig {
            max_pending_per_conversation: None,
            min_submit_interval_ms: Some(500),
        },
        ..KernelConfig::default()
    };
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config);

    h.kernel.submit(submission("conv")).await.unwrap();
    assert!(h.kernel.submit(submission("conv")).await.is_err());

    h.clock.advance(Duration::milliseconds(600));
    assert!(h.kernel.submit(submission("conv")).await.is_ok());
}

#[tokio::test]
async fn cancel_pending_task_ends_it_at_once() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let task_id = h.kernel.submit(submission("conv")).await.unwrap();

    assert_eq!(h.kernel.cancel(task_id).await.unwrap(), TaskStatus::Cancelled);
    assert!(h.kernel.claim_next(&WorkerId::new("w1"), &research()).await.is_none());
}

#[tokio::test]
async fn cancel_in_progress_task_is_a_request_the_worker_acknowledges() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let (task_id, worker) = common::claimed(&h.kernel, "w1").await;

    assert_eq!(h.kernel.cancel(task_id).await.unwrap(), TaskStatus::InProgress);
    let ack = h
        .kernel
        .checkpoint(task_id, &worker, serde_json::json!({ "step": 1 }))
        .await
        .unwrap();
    assert!(ack.cancel_requested);

    let status = h
        .kernel
        .fail(task_id, &worker, FailureReport::cancelled())
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn retryable_failure_is_rescheduled_then_promoted() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let (task_id, worker) = common::claimed(&h.kernel, "w1").await;

    let status = h
        .kernel
        .fail(task_id, &worker, FailureReport::new("flaky", true))
        .await
        .unwrap();
    assert_eq!(status, TaskStatus::RetryScheduled);
    assert!(h.kernel.claim_next(&worker, &research()).await.is_none());

    h.clock.advance(Duration::seconds(3));
    let report = h.kernel.reap().await;
    assert_eq!(report.promoted, vec![task_id]);

    let claim = h.kernel.claim_next(&worker, &research()).await.unwrap();
    assert_eq!(claim.attempt, 2);
    assert!(!claim.resumed);
}

#[tokio::test]
async fn non_retryable_failure_is_final() {
    let h = harness(&["read"], &[], BudgetSpec::default());
    let (task_id, worker) = common::claimed(&h.kernel, "w1").await;

    let status = h
        .kernel
        .fail(task_id, &worker, FailureReport::new("bad_input", false).with_message("no target"))
        .await
        .unwrap();
    assert_eq!(
        status,
        TaskStatus::Failed(FailureReason::Worker {
            code: "bad_input".into()
        })
    );

    let events = h.kernel.events(task_id);
    assert!(events.iter().any(|e| matches!(&e.kind, EventKind::Error { code, .. } if code == "bad_input")));
    assert!(events.last().unwrap().is_terminal());
}

#[tokio::test]
async fn terminal_tasks_are_archived_after_retention() {
    let config = KernelConfig {
        retention_ms: 1_000,
        ..KernelConfig::default()
    };
    let h = harness_with(&["read"], &[], BudgetSpec::default(), config);
    let task_id = h.kernel.submit(submission("conv")).await.unwrap();
    h.kernel.cancel(task_id).await.unwrap();

    h.clock.advance(Duration::seconds(2));
    let report = h.kernel.reap().await;
    assert_eq!(report.archived, vec![task_id]);
    assert!(matches!(h.kernel.status(task_id).await, Err(KernelError::TaskNotFound(_))));

    // the audit trail outlives the task
    assert!(!h.kernel.audit_for(task_id).await.is_empty());
}
