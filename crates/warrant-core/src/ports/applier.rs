//! DurableStateApplier port - 承認済み操作の適用
//!
//! 永続状態を持つのは利用側アプリケーション。kernel は承認後に一度だけ呼ぶ。

use async_trait::async_trait;

use crate::domain::{ProposedOperation, TaskId};

/// Applies an approved bundle all-or-nothing.
///
/// On `Err` nothing may have been written; the review stays open.
#[async_trait]
pub trait DurableStateApplier: Send + Sync {
    async fn apply(&self, task_id: TaskId, ops: &[ProposedOperation]) -> Result<(), String>;
}
