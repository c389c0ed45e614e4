//! ActionExecutor port - 許可済みアクションの実行
//!
//! 実装側（web fetch, mail, ...）は kernel の外にある。

use async_trait::async_trait;
use serde_json::Value;

use crate::policy::Permit;

/// Performs one action the policy kernel has already allowed.
///
/// A `Permit` can only be minted by the policy kernel, so an executor cannot
/// be driven around it.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, permit: &Permit, params: &Value) -> Result<Value, String>;
}
