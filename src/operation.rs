//! Operation: atomic, attributable edit records
//!
//! Every change to a document is an immutable [`Operation`]. Operations
//! carry the set of operation ids their author had applied at creation
//! time (`observed`), which is how concurrency is detected: two operations
//! are concurrent when neither observed the other.
//!
//! Convergence depends on one fixed total order shared by all sites:
//! `(timestamp, user_id, id)` ascending. See [`Operation::order_key`].

use crate::{DocumentId, NodeId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use uuid::Uuid;

/// Unique identifier for an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(pub Uuid);

impl OperationId {
    /// Generate a fresh random id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of edit an operation performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Delete,
    Move,
}

/// Target addressing for operations
///
/// Targets are id references into the document's node tree, never array
/// positions, so concurrent edits cannot drift indexes. `field` narrows an
/// update to a single attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    /// Node the operation addresses
    pub node_id: NodeId,

    /// Optional attribute within the node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl TargetRef {
    /// Target a whole node
    pub fn node(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            field: None,
        }
    }

    /// Target a single attribute of a node
    pub fn field(node_id: impl Into<NodeId>, field: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            field: Some(field.into()),
        }
    }

    /// Whether two targets address overlapping state
    ///
    /// Same node with disjoint fields does not overlap; a whole-node target
    /// overlaps every field of that node.
    pub fn overlaps(&self, other: &TargetRef) -> bool {
        if self.node_id != other.node_id {
            return false;
        }
        match (&self.field, &other.field) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

/// One atomic edit to a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique id
    pub id: OperationId,

    /// Document this operation belongs to
    pub document_id: DocumentId,

    /// Author
    pub user_id: UserId,

    /// Creation timestamp (author's clock)
    pub timestamp: DateTime<Utc>,

    /// What the edit does
    pub kind: OperationKind,

    /// What it addresses
    pub target: TargetRef,

    /// Kind-specific payload (attrs for insert/update, parent for move)
    pub payload: serde_json::Value,

    /// Ids the author had applied when this operation was created.
    /// Used for causality: an operation that appears in another's
    /// `observed` set is its causal ancestor.
    #[serde(default)]
    pub observed: BTreeSet<OperationId>,
}

impl Operation {
    /// Key for the fixed total order shared by all sites
    pub fn order_key(&self) -> (DateTime<Utc>, &UserId, OperationId) {
        (self.timestamp, &self.user_id, self.id)
    }

    /// Compare two operations in the fixed total order
    pub fn order_cmp(&self, other: &Operation) -> Ordering {
        self.order_key().cmp(&other.order_key())
    }

    /// Whether `self` wins the tie-break against `other`
    /// (later in the total order wins, matching last-writer semantics)
    pub fn wins_over(&self, other: &Operation) -> bool {
        self.order_cmp(other) == Ordering::Greater
    }

    /// Whether neither operation is a causal ancestor of the other
    pub fn is_concurrent_with(&self, other: &Operation) -> bool {
        !self.observed.contains(&other.id) && !other.observed.contains(&self.id)
    }
}

/// Sort operations into the fixed total order, in place
pub fn sort_causal(ops: &mut [Operation]) {
    ops.sort_by(|a, b| a.order_cmp(b));
}

/// Delivery state of a locally generated operation
///
/// Explicit tagged union rather than flags, so reconciliation has no
/// hidden state to consult.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryState {
    /// Applied locally, not yet acknowledged by the server
    Pending,
    /// Acknowledged; the operation is immutable from here on
    Acknowledged,
    /// Superseded during reconciliation (e.g. by a concurrent delete of
    /// its target); kept for audit, never retransmitted
    Rejected { reason: String },
}

/// A locally generated operation together with its delivery state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub operation: Operation,
    pub state: DeliveryState,
}

impl QueuedOperation {
    pub fn pending(operation: Operation) -> Self {
        Self {
            operation,
            state: DeliveryState::Pending,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.state == DeliveryState::Pending
    }
}
