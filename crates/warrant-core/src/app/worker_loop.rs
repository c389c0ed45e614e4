//! WorkerLoop - タスク実行ループ
//!
//! claim_next_wait → run → complete / fail を繰り返す。
//! 実行中は heartbeat を別タスクで送り続ける（止まると reaper が resumable にする）。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::app::Kernel;
use crate::app::runtime::{Runtime, TaskContext};
use crate::domain::{CapabilitySet, WorkerId};

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Idle wait per claim attempt.
    pub poll_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// Worker group handle.
/// - `shutdown_tx` を drop するとワーカー全体が止まる
/// - `join()` で全ワーカーの終了を待てる
pub struct WorkerGroup {
    shutdown_tx: watch::Sender<bool>,
    joins: Vec<JoinHandle<()>>,
}

impl WorkerGroup {
    /// Spawn `n` workers named `{prefix}-{i}`, all declaring `capabilities`.
    pub fn spawn(
        n: usize,
        prefix: &str,
        capabilities: CapabilitySet,
        kernel: Kernel,
        runtime: Arc<Runtime>,
        options: WorkerOptions,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut joins = Vec::with_capacity(n);
        for i in 0..n {
            let worker = WorkerId::new(format!("{prefix}-{i}"));
            let kernel = kernel.clone();
            let rt = Arc::clone(&runtime);
            let caps = capabilities.clone();
            let options = options.clone();
            let mut rx = shutdown_rx.clone();

            let join = tokio::spawn(async move {
                worker_loop(worker, kernel, rt, caps, options, &mut rx).await;
            });
            joins.push(join);
        }

        Self { shutdown_tx, joins }
    }

    /// Request shutdown for all workers.
    /// 実行中のランナーは止めない。新しい claim を取らなくなるだけ。
    pub fn request_shutdown(&self) {
        // ignore send error: receivers may already be dropped
        let _ = self.shutdown_tx.send(true);
    }

    /// Shutdown and wait for all workers.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        for j in self.joins {
            let _ = j.await;
        }
    }
}

async fn worker_loop(
    worker: WorkerId,
    kernel: Kernel,
    runtime: Arc<Runtime>,
    capabilities: CapabilitySet,
    options: WorkerOptions,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    info!(worker = %worker, class = %capabilities.class_key(), "worker started");
    loop {
        // shutdown が来ていたら抜ける
        if *shutdown_rx.borrow() {
            break;
        }

        let claim = tokio::select! {
            changed = shutdown_rx.changed() => {
                // sender が drop された場合も停止
                if changed.is_err() {
                    break;
                }
                // 変更が入ったら次のループで判定
                continue;
            }
            claim = kernel.claim_next_wait(&worker, &capabilities, options.poll_timeout) => claim,
        };
        let Some(claim) = claim else {
            continue;
        };
        let task_id = claim.task_id();

        // heartbeat は別タスク。ランナーが await 中でも claim を生かしておく
        let heartbeat = {
            let kernel = kernel.clone();
            let worker = worker.clone();
            let every = options.heartbeat_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if kernel.heartbeat(task_id, &worker).await.is_err() {
                        break;
                    }
                }
            })
        };

        let mut ctx = TaskContext::new(kernel.clone(), worker.clone(), claim);
        let result = runtime.execute(&mut ctx).await;
        heartbeat.abort();

        match result {
            Ok(bundle) => match kernel.complete(task_id, &worker, bundle).await {
                Ok(review) => info!(task_id = %task_id, worker = %worker, ?review, "result handed to inbox"),
                Err(err) => warn!(task_id = %task_id, worker = %worker, error = %err, "complete rejected"),
            },
            Err(report) => match kernel.fail(task_id, &worker, report).await {
                Ok(status) => debug!(task_id = %task_id, worker = %worker, %status, "failure reported"),
                // budget exhaustion already ended the task and released the claim
                Err(err) => debug!(task_id = %task_id, worker = %worker, error = %err, "failure report dropped"),
            },
        }
    }
    info!(worker = %worker, "worker stopped");
}
