//! ReaperLoop - 定期的な掃除
//!
//! # フロー（1 tick）
//! 1. in_progress で duration budget を超えたタスク → failed(budget_exceeded)
//! 2. heartbeat が途絶えたタスク → resumable（上限を超えたら failed(disconnected)）
//! 3. 期限の来た retry → pending
//! 4. retention を過ぎた終了タスク → archive

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::app::Kernel;
use crate::queue::ReapReport;

pub struct ReaperLoop {
    kernel: Kernel,
    interval: Duration,
}

/// Running reaper. Dropping it without `shutdown` leaves the task running.
pub struct ReaperHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ReaperLoop {
    /// Ticks at `reaper_interval_ms` from the kernel's config.
    pub fn new(kernel: Kernel) -> Self {
        let interval = kernel.config().reaper_interval();
        Self { kernel, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run_once(&self) -> ReapReport {
        self.kernel.reap().await
    }

    pub fn spawn(self) -> ReaperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval_ms = self.interval.as_millis() as u64, "reaper started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
            info!("reaper stopped");
        });
        ReaperHandle { shutdown_tx, join }
    }
}

impl ReaperHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}
