//! ReferenceResolver port - ノード ID の存在確認

use crate::domain::{ContextSnapshot, NodeId};

/// Answers whether a node id exists before a bundle is applied.
pub trait ReferenceResolver: Send + Sync {
    fn exists(&self, id: &NodeId) -> bool;
}

/// The snapshot a task was dispatched with is the default view of what exists.
impl ReferenceResolver for ContextSnapshot {
    fn exists(&self, id: &NodeId) -> bool {
        self.known_ids.contains(id)
    }
}
