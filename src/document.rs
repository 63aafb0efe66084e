//! DocumentState: materialized content of one document
//!
//! Content is a tree of nodes (diagram elements, schema tables, spec
//! sections) keyed by node id. Applying an [`Operation`] is a pure
//! reducer: no I/O, deterministic, idempotent on already-applied ids.
//! Only the owning sync session may call [`DocumentState::apply`].

use crate::error::{Result, SyncError};
use crate::operation::{Operation, OperationId, OperationKind};
use crate::{DocumentId, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// One element in the document tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Parent node; `None` for top-level nodes
    pub parent: Option<NodeId>,

    /// Arbitrary attributes (label, position, type-specific fields)
    pub attrs: serde_json::Map<String, serde_json::Value>,
}

/// The node tree. BTreeMap keeps iteration deterministic across sites.
pub type DocumentContent = BTreeMap<NodeId, Node>;

/// Outcome of applying one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// State changed, version bumped
    Changed,
    /// Operation id was already applied; nothing happened
    AlreadyApplied,
}

/// Current materialized state of one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentState {
    pub document_id: DocumentId,

    /// Node tree
    pub content: DocumentContent,

    /// Ids of every operation folded into `content`; no duplicates
    pub applied: HashSet<OperationId>,

    /// Bumped once per applied operation
    pub version: u64,
}

impl DocumentState {
    /// Empty state for a new document
    pub fn new(document_id: impl Into<DocumentId>) -> Self {
        Self {
            document_id: document_id.into(),
            content: DocumentContent::new(),
            applied: HashSet::new(),
            version: 0,
        }
    }

    /// State seeded from an existing snapshot (checkout/restore)
    pub fn from_snapshot(
        document_id: impl Into<DocumentId>,
        content: DocumentContent,
        applied: HashSet<OperationId>,
        version: u64,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            content,
            applied,
            version,
        }
    }

    pub fn contains_node(&self, node_id: &str) -> bool {
        self.content.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&Node> {
        self.content.get(node_id)
    }

    /// Whether `ancestor` is on the parent chain of `node_id`
    pub fn is_ancestor(&self, ancestor: &str, node_id: &str) -> bool {
        let mut current = self.content.get(node_id).and_then(|n| n.parent.as_deref());
        while let Some(parent) = current {
            if parent == ancestor {
                return true;
            }
            current = self.content.get(parent).and_then(|n| n.parent.as_deref());
        }
        false
    }

    /// Apply one operation. Pure reducer: fails with `InvalidOperation`
    /// when the target no longer exists, never silently drops.
    pub fn apply(&mut self, op: &Operation) -> Result<Applied> {
        if self.applied.contains(&op.id) {
            return Ok(Applied::AlreadyApplied);
        }

        match op.kind {
            OperationKind::Insert => self.apply_insert(op)?,
            OperationKind::Update => self.apply_update(op)?,
            OperationKind::Delete => self.apply_delete(op)?,
            OperationKind::Move => self.apply_move(op)?,
        }

        self.applied.insert(op.id);
        self.version += 1;
        Ok(Applied::Changed)
    }

    /// Replay a batch already sorted into the fixed total order
    pub fn replay(&mut self, ops: &[Operation]) -> Result<()> {
        for op in ops {
            self.apply(op)?;
        }
        Ok(())
    }

    fn apply_insert(&mut self, op: &Operation) -> Result<()> {
        let node_id = &op.target.node_id;
        if self.content.contains_key(node_id) {
            return Err(SyncError::InvalidOperation(format!(
                "insert: node '{node_id}' already exists"
            )));
        }

        let parent = op
            .payload
            .get("parent")
            .and_then(|v| v.as_str())
            .map(String::from);
        if let Some(ref p) = parent {
            if !self.content.contains_key(p) {
                return Err(SyncError::InvalidOperation(format!(
                    "insert: parent '{p}' does not exist"
                )));
            }
        }

        let attrs = match op.payload.get("attrs") {
            Some(serde_json::Value::Object(map)) => map.clone(),
            None => serde_json::Map::new(),
            Some(other) => {
                return Err(SyncError::InvalidOperation(format!(
                    "insert: attrs must be an object, got {other}"
                )));
            }
        };

        self.content.insert(node_id.clone(), Node { parent, attrs });
        Ok(())
    }

    fn apply_update(&mut self, op: &Operation) -> Result<()> {
        let node_id = op.target.node_id.clone();
        let node = self.content.get_mut(&node_id).ok_or_else(|| {
            SyncError::InvalidOperation(format!("update: node '{node_id}' does not exist"))
        })?;

        match &op.target.field {
            Some(field) => {
                node.attrs.insert(field.clone(), op.payload.clone());
            }
            None => {
                let serde_json::Value::Object(patch) = &op.payload else {
                    return Err(SyncError::InvalidOperation(format!(
                        "update: payload must be an object, got {}",
                        op.payload
                    )));
                };
                for (key, value) in patch {
                    node.attrs.insert(key.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    fn apply_delete(&mut self, op: &Operation) -> Result<()> {
        let node_id = &op.target.node_id;
        if !self.content.contains_key(node_id) {
            return Err(SyncError::InvalidOperation(format!(
                "delete: node '{node_id}' does not exist"
            )));
        }

        // Remove the node and its whole subtree
        let doomed: Vec<NodeId> = self
            .content
            .keys()
            .filter(|id| *id == node_id || self.is_ancestor(node_id, id))
            .cloned()
            .collect();
        for id in doomed {
            self.content.remove(&id);
        }
        Ok(())
    }

    fn apply_move(&mut self, op: &Operation) -> Result<()> {
        let node_id = &op.target.node_id;
        if !self.content.contains_key(node_id) {
            return Err(SyncError::InvalidOperation(format!(
                "move: node '{node_id}' does not exist"
            )));
        }

        let new_parent = op
            .payload
            .get("parent")
            .and_then(|v| v.as_str())
            .map(String::from);

        if let Some(ref p) = new_parent {
            if !self.content.contains_key(p) {
                return Err(SyncError::InvalidOperation(format!(
                    "move: parent '{p}' does not exist"
                )));
            }
            if p == node_id || self.is_ancestor(node_id, p) {
                return Err(SyncError::InvalidOperation(format!(
                    "move: '{node_id}' under '{p}' would create a cycle"
                )));
            }
        }

        // contains_key checked above
        if let Some(node) = self.content.get_mut(node_id) {
            node.parent = new_parent;
        }
        Ok(())
    }
}
