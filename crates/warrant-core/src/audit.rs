//! Append-only audit log.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{RwLock, RwLockWriteGuard};

use crate::domain::{ActionId, AuditEntry, AuditId, AuditRecord, TaskId};
use crate::ports::{Clock, IdGenerator};

/// In-memory audit log. Reads run concurrently; appends are serialized.
///
/// Records are never removed, including when the task they reference is
/// archived.
pub struct AuditLog {
    records: RwLock<Vec<AuditRecord>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
}

impl AuditLog {
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            clock,
            ids,
        }
    }

    /// Stamps the entry with an id and time and appends it.
    pub async fn append(&self, entry: AuditEntry) -> AuditId {
        self.writer().await.push(entry)
    }

    /// Holds the log for appending without further waits, for callers that
    /// must not be suspended between a state change and its record.
    pub async fn writer(&self) -> AuditWriter<'_> {
        AuditWriter {
            log: self,
            records: self.records.write().await,
        }
    }

    fn stamp(&self, entry: AuditEntry) -> AuditRecord {
        AuditRecord {
            audit_id: self.ids.generate_audit_id(),
            task_id: entry.task_id,
            actor: entry.actor,
            action: entry.action,
            decision: entry.decision,
            detail: entry.detail,
            at: self.clock.now(),
        }
    }

    pub async fn for_task(&self, task_id: TaskId) -> Vec<AuditRecord> {
        self.records
            .read()
            .await
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }

    pub async fn all(&self) -> Vec<AuditRecord> {
        self.records.read().await.clone()
    }

    /// Whether this exact invocation was already allowed for the task.
    ///
    /// Workers resuming from a checkpoint use this to skip effects they
    /// already performed.
    pub async fn was_allowed(&self, task_id: TaskId, action: &ActionId, params: &Value) -> bool {
        self.records
            .read()
            .await
            .iter()
            .any(|r| r.task_id == task_id && r.is_allowed_invoke(action, params))
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

/// Exclusive append access. Readers wait until it is dropped.
pub struct AuditWriter<'a> {
    log: &'a AuditLog,
    records: RwLockWriteGuard<'a, Vec<AuditRecord>>,
}

impl AuditWriter<'_> {
    pub fn push(&mut self, entry: AuditEntry) -> AuditId {
        let record = self.log.stamp(entry);
        let id = record.audit_id;
        self.records.push(record);
        id
    }
}
