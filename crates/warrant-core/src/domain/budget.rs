//! Per-task resource ceilings and the ledger that tracks consumption.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::ActionClass;

/// Budget template carried by an agent manifest.
///
/// Copied into each task at submission; later manifest edits do not touch
/// tasks already queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BudgetSpec {
    pub max_duration_ms: u64,
    pub max_tool_calls: u32,
    pub max_external_requests: u32,
}

impl Default for BudgetSpec {
    fn default() -> Self {
        Self {
            max_duration_ms: 10 * 60 * 1000,
            max_tool_calls: 50,
            max_external_requests: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetDimension {
    Duration,
    ToolCalls,
    ExternalRequests,
}

impl fmt::Display for BudgetDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BudgetDimension::Duration => "duration",
            BudgetDimension::ToolCalls => "tool_calls",
            BudgetDimension::ExternalRequests => "external_requests",
        };
        f.write_str(s)
    }
}

/// Remaining allowance, reported to workers and status views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetRemaining {
    pub duration_ms: Option<u64>,
    pub tool_calls: u32,
    pub external_requests: u32,
}

/// Consumption against one task's [`BudgetSpec`].
///
/// Only the policy kernel calls [`BudgetLedger::consume`]. The duration clock
/// starts at the first claim, not at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetLedger {
    pub spec: BudgetSpec,
    pub started_at: Option<DateTime<Utc>>,
    pub tool_calls_used: u32,
    pub external_requests_used: u32,
}

impl BudgetLedger {
    pub fn new(spec: BudgetSpec) -> Self {
        Self {
            spec,
            started_at: None,
            tool_calls_used: 0,
            external_requests_used: 0,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// Whether the wall-clock ceiling has passed.
    pub fn duration_expired(&self, now: DateTime<Utc>) -> bool {
        match self.started_at {
            Some(started) => elapsed_ms(started, now) >= self.spec.max_duration_ms,
            None => false,
        }
    }

    /// Checks whether one more action of `class` fits.
    pub fn check(&self, class: &ActionClass, now: DateTime<Utc>) -> Result<(), BudgetDimension> {
        if self.spec.max_duration_ms == 0 || self.duration_expired(now) {
            return Err(BudgetDimension::Duration);
        }
        if self.tool_calls_used >= self.spec.max_tool_calls {
            return Err(BudgetDimension::ToolCalls);
        }
        if matches!(class, ActionClass::ExternalRequest(_))
            && self.external_requests_used >= self.spec.max_external_requests
        {
            return Err(BudgetDimension::ExternalRequests);
        }
        Ok(())
    }

    /// Checks and, on success, records one action of `class`.
    pub fn consume(&mut self, class: &ActionClass, now: DateTime<Utc>) -> Result<(), BudgetDimension> {
        self.check(class, now)?;
        self.tool_calls_used += 1;
        if matches!(class, ActionClass::ExternalRequest(_)) {
            self.external_requests_used += 1;
        }
        Ok(())
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> BudgetRemaining {
        BudgetRemaining {
            duration_ms: self
                .started_at
                .map(|started| self.spec.max_duration_ms.saturating_sub(elapsed_ms(started, now))),
            tool_calls: self.spec.max_tool_calls.saturating_sub(self.tool_calls_used),
            external_requests: self
                .spec
                .max_external_requests
                .saturating_sub(self.external_requests_used),
        }
    }
}

fn elapsed_ms(from: DateTime<Utc>, to: DateTime<Utc>) -> u64 {
    u64::try_from((to - from).num_milliseconds()).unwrap_or(0)
}
