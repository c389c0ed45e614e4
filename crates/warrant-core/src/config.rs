//! Kernel configuration.
//!
//! Every field has a default, so `{}` is a valid configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::{ResourceClass, TrustContextId};
use crate::error::KernelError;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Heartbeat silence before an in-progress task becomes resumable.
    pub disconnect_grace_ms: u64,
    /// Disconnects tolerated before `failed(disconnected)`.
    pub max_disconnects: u32,
    /// Attempts allowed for retryable failures.
    pub max_attempts: u32,
    pub retry: RetryPolicy,
    /// Age of a terminal task before it is archived.
    pub retention_ms: u64,
    pub reaper_interval_ms: u64,
    /// Trust context for submissions that name none.
    pub default_trust_context: TrustContextId,
    pub admission: AdmissionConfig,
    pub rate_limits: Vec<RateLimitConfig>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            disconnect_grace_ms: 30_000,
            max_disconnects: 3,
            max_attempts: 5,
            retry: RetryPolicy::default(),
            retention_ms: 24 * 60 * 60 * 1000,
            reaper_interval_ms: 1_000,
            default_trust_context: TrustContextId::new("shared"),
            admission: AdmissionConfig::default(),
            rate_limits: Vec::new(),
        }
    }
}

/// Per-conversation dispatch guard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// Cap on non-terminal tasks per conversation.
    pub max_pending_per_conversation: Option<usize>,
    /// Minimum spacing between submissions in one conversation.
    pub min_submit_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub resource_class: ResourceClass,
    pub rate_per_sec: f64,
    pub burst: u32,
}

impl KernelConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, KernelError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| KernelError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), KernelError> {
        if self.max_attempts == 0 {
            return Err(KernelError::Config("max_attempts must be at least 1".into()));
        }
        if self.reaper_interval_ms == 0 {
            return Err(KernelError::Config("reaper_interval_ms must be positive".into()));
        }
        if !(self.retry.multiplier >= 1.0) {
            return Err(KernelError::Config("retry.multiplier must be >= 1.0".into()));
        }
        for limit in &self.rate_limits {
            if !(limit.rate_per_sec > 0.0) || limit.burst == 0 {
                return Err(KernelError::Config(format!(
                    "rate limit for `{}` needs a positive rate and burst",
                    limit.resource_class
                )));
            }
        }
        Ok(())
    }

    pub fn disconnect_grace(&self) -> Duration {
        Duration::from_millis(self.disconnect_grace_ms)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }
}
