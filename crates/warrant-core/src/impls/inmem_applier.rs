//! InMemoryApplier - 開発用の永続状態
//!
//! # 学習ポイント
//! - clone → apply → swap による all-or-nothing 適用
//! - 同じ状態を ReferenceResolver としても公開する

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::domain::{NodeId, ProposedOperation, TaskId};
use crate::ports::{DurableStateApplier, ReferenceResolver};

/// One node of the in-memory document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub parent: Option<NodeId>,
    pub fields: Map<String, Value>,
    /// Outgoing `relate` links.
    pub links: BTreeSet<NodeId>,
}

#[derive(Debug, Default)]
struct Document {
    nodes: HashMap<NodeId, Node>,
    /// Tasks whose bundles were applied, in order.
    applied: Vec<TaskId>,
}

/// InMemoryApplier はテストとデモ用の DurableStateApplier
///
/// 失敗した bundle は何も書き込まない。
#[derive(Debug, Default)]
pub struct InMemoryApplier {
    doc: Mutex<Document>,
}

impl InMemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 既存ノード（スナップショットの known_ids と揃える）
    pub fn with_nodes(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let nodes = ids.into_iter().map(|id| (id, Node::default())).collect();
        Self {
            doc: Mutex::new(Document {
                nodes,
                applied: Vec::new(),
            }),
        }
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.lock().nodes.contains_key(id)
    }

    pub fn node(&self, id: &NodeId) -> Option<Node> {
        self.lock().nodes.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().nodes.is_empty()
    }

    pub fn applied(&self) -> Vec<TaskId> {
        self.lock().applied.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Document> {
        self.doc.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn apply_one(nodes: &mut HashMap<NodeId, Node>, op: &ProposedOperation) -> Result<(), String> {
    match op {
        ProposedOperation::Create {
            target_id,
            parent_id,
            fields,
        } => {
            if nodes.contains_key(target_id) {
                return Err(format!("create: `{target_id}` already exists"));
            }
            if let Some(parent) = parent_id
                && !nodes.contains_key(parent)
            {
                return Err(format!("create: parent `{parent}` not found"));
            }
            nodes.insert(
                target_id.clone(),
                Node {
                    parent: parent_id.clone(),
                    fields: fields.clone(),
                    links: BTreeSet::new(),
                },
            );
        }
        ProposedOperation::Update { target_id, fields } => {
            let node = nodes
                .get_mut(target_id)
                .ok_or_else(|| format!("update: `{target_id}` not found"))?;
            for (key, value) in fields {
                node.fields.insert(key.clone(), value.clone());
            }
        }
        ProposedOperation::Delete { target_id } => {
            nodes
                .remove(target_id)
                .ok_or_else(|| format!("delete: `{target_id}` not found"))?;
            for node in nodes.values_mut() {
                node.links.remove(target_id);
            }
        }
        ProposedOperation::Relate {
            target_id,
            parent_id,
        } => {
            let other = parent_id
                .as_ref()
                .ok_or_else(|| format!("relate: `{target_id}` has no parentId"))?;
            if !nodes.contains_key(other) {
                return Err(format!("relate: `{other}` not found"));
            }
            nodes
                .get_mut(target_id)
                .ok_or_else(|| format!("relate: `{target_id}` not found"))?
                .links
                .insert(other.clone());
        }
    }
    Ok(())
}

#[async_trait]
impl DurableStateApplier for InMemoryApplier {
    async fn apply(&self, task_id: TaskId, ops: &[ProposedOperation]) -> Result<(), String> {
        let mut doc = self.lock();
        let mut staged = doc.nodes.clone();
        for op in ops {
            apply_one(&mut staged, op)?;
        }
        doc.nodes = staged;
        doc.applied.push(task_id);
        Ok(())
    }
}

impl ReferenceResolver for InMemoryApplier {
    fn exists(&self, id: &NodeId) -> bool {
        self.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn task() -> TaskId {
        TaskId::from_ulid(Ulid::new())
    }

    #[tokio::test]
    async fn bundle_applies_in_order() {
        let applier = InMemoryApplier::with_nodes([NodeId::new("root")]);
        let mut fields = Map::new();
        fields.insert("title".into(), Value::from("Intro"));
        let ops = vec![
            ProposedOperation::create("a", Some(NodeId::new("root"))),
            ProposedOperation::Update {
                target_id: NodeId::new("a"),
                fields,
            },
            ProposedOperation::Relate {
                target_id: NodeId::new("root"),
                parent_id: Some(NodeId::new("a")),
            },
        ];
        applier.apply(task(), &ops).await.unwrap();

        let a = applier.node(&NodeId::new("a")).unwrap();
        assert_eq!(a.parent, Some(NodeId::new("root")));
        assert_eq!(a.fields["title"], "Intro");
        assert!(applier.node(&NodeId::new("root")).unwrap().links.contains(&NodeId::new("a")));
    }

    #[tokio::test]
    async fn failing_bundle_writes_nothing() {
        let applier = InMemoryApplier::with_nodes([NodeId::new("root")]);
        let ops = vec![
            ProposedOperation::create("a", Some(NodeId::new("root"))),
            ProposedOperation::Delete {
                target_id: NodeId::new("ghost"),
            },
        ];
        let err = applier.apply(task(), &ops).await.unwrap_err();
        assert!(err.contains("ghost"));
        assert!(!applier.contains(&NodeId::new("a")));
        assert_eq!(applier.len(), 1);
        assert!(applier.applied().is_empty());
    }
}
