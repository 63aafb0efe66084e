//! Conflict prediction and resolution
//!
//! [`predict_conflict`] is pure and side-effect-free, so callers can probe
//! speculatively (UI warnings before transmission). Detected conflicts are
//! recorded in a [`ConflictTracker`]; they are resolved exactly once and
//! never deleted, so the audit trail and stats survive resolution.

use crate::error::{Result, SyncError};
use crate::operation::{Operation, OperationKind, TargetRef};
use crate::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Unique identifier for a conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConflictId(pub Uuid);

impl ConflictId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConflictId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConflictId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Find the subset of `existing` that conflicts with `new_op`:
/// overlapping target and concurrent (neither observed the other).
pub fn predict_conflict(new_op: &Operation, existing: &[Operation]) -> Vec<Operation> {
    existing
        .iter()
        .filter(|op| op.id != new_op.id)
        .filter(|op| op.target.overlaps(&new_op.target))
        .filter(|op| op.is_concurrent_with(new_op))
        .cloned()
        .collect()
}

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionStrategy {
    /// Keep the first recorded side
    Ours,
    /// Keep the last recorded side
    Theirs,
    /// Field-level combination of update payloads
    Merge,
    /// Caller supplies the resulting operation(s)
    Manual,
}

/// Caller-supplied inputs to [`ConflictTracker::resolve`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResolveOptions {
    /// Required for `Manual`: the operations that replace the conflicting pair
    pub operations: Vec<Operation>,
}

/// Recorded outcome of a resolution. Set exactly once per conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub resulting_operations: Vec<Operation>,
    pub resolved_by: UserId,
    pub resolved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStatus {
    Open,
    Resolved,
}

/// A detected overlap between concurrent operations.
/// `operations[0]` is the side that was already present ("ours"); the
/// remainder arrived afterwards ("theirs").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conflict {
    pub id: ConflictId,
    pub operations: Vec<Operation>,
    pub detected_at: DateTime<Utc>,
    pub status: ConflictStatus,
    pub resolution: Option<Resolution>,
}

impl Conflict {
    pub fn is_open(&self) -> bool {
        self.status == ConflictStatus::Open
    }
}

/// Counts by strategy and age, for observability only
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictStats {
    pub open: usize,
    pub resolved: usize,
    pub by_strategy: HashMap<String, usize>,
    /// Open conflicts younger than one minute
    pub open_under_minute: usize,
    /// Open conflicts between one minute and one hour old
    pub open_under_hour: usize,
    /// Open conflicts older than an hour
    pub open_stale: usize,
}

/// Process-wide conflict store, keyed by conflict id.
/// Conflicts from independent documents never contend because each
/// document session records into it sequentially.
#[derive(Debug, Default)]
pub struct ConflictTracker {
    conflicts: HashMap<ConflictId, Conflict>,
}

impl ConflictTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a detected conflict. `operations` must hold at least the
    /// two concurrent sides.
    pub fn record(&mut self, operations: Vec<Operation>) -> Result<ConflictId> {
        if operations.len() < 2 {
            return Err(SyncError::InvalidOperation(
                "a conflict needs at least two operations".to_string(),
            ));
        }
        let id = ConflictId::new();
        tracing::debug!(conflict = %id, ops = operations.len(), "conflict recorded");
        self.conflicts.insert(
            id,
            Conflict {
                id,
                operations,
                detected_at: Utc::now(),
                status: ConflictStatus::Open,
                resolution: None,
            },
        );
        Ok(id)
    }

    /// Record a conflict the transform engine already settled during live
    /// reconciliation. Stored resolved, for the audit trail and stats;
    /// it never blocks targets.
    pub fn record_auto(
        &mut self,
        operations: Vec<Operation>,
        strategy: ResolutionStrategy,
        resulting_operations: Vec<Operation>,
        resolved_by: impl Into<UserId>,
    ) -> Result<ConflictId> {
        if operations.is_empty() {
            return Err(SyncError::InvalidOperation(
                "a conflict needs at least one operation".to_string(),
            ));
        }
        let id = ConflictId::new();
        let now = Utc::now();
        self.conflicts.insert(
            id,
            Conflict {
                id,
                operations,
                detected_at: now,
                status: ConflictStatus::Resolved,
                resolution: Some(Resolution {
                    strategy,
                    resulting_operations,
                    resolved_by: resolved_by.into(),
                    resolved_at: now,
                }),
            },
        );
        Ok(id)
    }

    pub fn get(&self, id: ConflictId) -> Option<&Conflict> {
        self.conflicts.get(&id)
    }

    /// Open conflicts only; resolved ones are excluded but retained
    pub fn active_conflicts(&self) -> Vec<&Conflict> {
        let mut open: Vec<&Conflict> = self.conflicts.values().filter(|c| c.is_open()).collect();
        open.sort_by_key(|c| c.detected_at);
        open
    }

    /// Whether an open conflict touches the given target
    pub fn blocks_target(&self, target: &TargetRef) -> bool {
        self.conflicts
            .values()
            .filter(|c| c.is_open())
            .any(|c| c.operations.iter().any(|op| op.target.overlaps(target)))
    }

    /// Resolve an open conflict. Deterministic: the same (conflict,
    /// strategy, options) always yields the same resulting operations.
    pub fn resolve(
        &mut self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        options: ResolveOptions,
        resolved_by: impl Into<UserId>,
    ) -> Result<Resolution> {
        let conflict = self
            .conflicts
            .get(&id)
            .ok_or_else(|| SyncError::UnknownConflict(id.to_string()))?;

        if conflict.resolution.is_some() {
            return Err(SyncError::InvalidState(format!(
                "conflict '{id}' is already resolved"
            )));
        }

        let resulting_operations = compute_outcome(conflict, strategy, &options)?;

        let resolution = Resolution {
            strategy,
            resulting_operations,
            resolved_by: resolved_by.into(),
            resolved_at: Utc::now(),
        };

        // get() above guarantees presence
        if let Some(conflict) = self.conflicts.get_mut(&id) {
            conflict.status = ConflictStatus::Resolved;
            conflict.resolution = Some(resolution.clone());
        }
        tracing::debug!(conflict = %id, strategy = ?strategy, "conflict resolved");
        Ok(resolution)
    }

    pub fn stats(&self) -> ConflictStats {
        self.stats_at(Utc::now())
    }

    /// Stats against an explicit clock, for deterministic tests
    pub fn stats_at(&self, now: DateTime<Utc>) -> ConflictStats {
        let mut stats = ConflictStats::default();
        for conflict in self.conflicts.values() {
            match &conflict.resolution {
                Some(resolution) => {
                    stats.resolved += 1;
                    let key = format!("{:?}", resolution.strategy).to_lowercase();
                    *stats.by_strategy.entry(key).or_insert(0) += 1;
                }
                None => {
                    stats.open += 1;
                    let age = now.signed_duration_since(conflict.detected_at);
                    if age.num_seconds() < 60 {
                        stats.open_under_minute += 1;
                    } else if age.num_hours() < 1 {
                        stats.open_under_hour += 1;
                    } else {
                        stats.open_stale += 1;
                    }
                }
            }
        }
        stats
    }
}

/// The deterministic outcome for each strategy
fn compute_outcome(
    conflict: &Conflict,
    strategy: ResolutionStrategy,
    options: &ResolveOptions,
) -> Result<Vec<Operation>> {
    match strategy {
        ResolutionStrategy::Ours => Ok(vec![conflict.operations[0].clone()]),
        ResolutionStrategy::Theirs => Ok(vec![conflict
            .operations
            .last()
            .cloned()
            .ok_or_else(|| SyncError::InvalidState("empty conflict".to_string()))?]),
        ResolutionStrategy::Merge => merge_outcome(conflict),
        ResolutionStrategy::Manual => {
            if options.operations.is_empty() {
                return Err(SyncError::InvalidStrategy(
                    "manual resolution requires resulting operations in options".to_string(),
                ));
            }
            Ok(options.operations.clone())
        }
    }
}

/// Field-level merge: only defined over updates. Payload objects are
/// combined key by key; contested keys go to the total-order winner.
fn merge_outcome(conflict: &Conflict) -> Result<Vec<Operation>> {
    if conflict
        .operations
        .iter()
        .any(|op| op.kind != OperationKind::Update)
    {
        return Err(SyncError::InvalidStrategy(format!(
            "merge is only defined for update/update conflicts, got {:?}",
            conflict
                .operations
                .iter()
                .map(|op| op.kind)
                .collect::<Vec<_>>()
        )));
    }

    let mut ordered = conflict.operations.clone();
    crate::operation::sort_causal(&mut ordered);

    let mut merged = serde_json::Map::new();
    for op in &ordered {
        match (&op.target.field, &op.payload) {
            (Some(field), value) => {
                merged.insert(field.clone(), value.clone());
            }
            (None, serde_json::Value::Object(map)) => {
                for (k, v) in map {
                    merged.insert(k.clone(), v.clone());
                }
            }
            (None, other) => {
                return Err(SyncError::InvalidStrategy(format!(
                    "merge requires object payloads, got {other}"
                )));
            }
        }
    }

    // The winner's identity carries the merged payload so the result is
    // stable across repeated resolutions
    let mut result = ordered
        .last()
        .cloned()
        .ok_or_else(|| SyncError::InvalidState("empty conflict".to_string()))?;
    result.target = TargetRef::node(result.target.node_id.clone());
    result.payload = serde_json::Value::Object(merged);
    Ok(vec![result])
}
