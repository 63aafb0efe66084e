//! Version control over the operation log
//!
//! Branches fork a document's history, commits are immutable snapshots
//! chained per branch, and merge requests gate a three-way merge that
//! runs through the same transform engine as live sync. A merge is
//! all-or-nothing: any overlap the engine cannot settle mechanically is
//! registered with the [`ConflictTracker`] and the merge fails without
//! touching either chain.
//!
//! The store is process-wide but keyed by document/branch id, so
//! independent documents never contend.

use crate::conflict::{ConflictId, ConflictTracker};
use crate::document::{DocumentContent, DocumentState};
use crate::error::{Result, SyncError};
use crate::operation::{sort_causal, Operation, OperationId};
use crate::transform::transform;
use crate::{DocumentId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(BranchId);
uuid_id!(CommitId);
uuid_id!(MergeRequestId);

/// A named fork of a document's operation history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionBranch {
    pub id: BranchId,
    pub document_id: DocumentId,
    /// `None` only for the document's root branch
    pub parent_branch_id: Option<BranchId>,
    pub name: String,
    /// The parent branch's head at fork time; the three-way merge base
    /// is found by walking these links
    pub forked_from: Option<CommitId>,
    pub created_at: DateTime<Utc>,
}

/// An immutable snapshot on a branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionCommit {
    pub id: CommitId,
    pub branch_id: BranchId,
    pub message: String,
    pub snapshot: DocumentContent,
    pub changes_summary: Option<String>,
    /// `None` only for the branch's first commit
    pub parent_commit_id: Option<CommitId>,
    /// Operations applied since the parent commit
    pub operations: Vec<Operation>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestStatus {
    Draft,
    Open,
    NeedsChanges,
    Approved,
    Merged,
    Closed,
}

impl MergeRequestStatus {
    /// The review-workflow state machine. `Merged` and `Closed` are
    /// terminal.
    pub fn can_transition_to(self, next: MergeRequestStatus) -> bool {
        use MergeRequestStatus::*;
        matches!(
            (self, next),
            (Draft, Open)
                | (Open, Approved)
                | (Open, NeedsChanges)
                | (Open, Closed)
                | (NeedsChanges, Open)
                | (NeedsChanges, Approved)
                | (NeedsChanges, Closed)
                | (Approved, Merged)
        )
    }
}

/// Outcome of one review pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewVerdict {
    Approve,
    RequestChanges,
}

/// Proposal to merge one branch into another
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeRequest {
    pub id: MergeRequestId,
    pub source_branch_id: BranchId,
    pub target_branch_id: BranchId,
    pub status: MergeRequestStatus,
    pub reviewers: Vec<UserId>,
    pub assignee: Option<UserId>,
    /// Set once the merge commit lands
    pub merged_commit_id: Option<CommitId>,
    pub created_at: DateTime<Utc>,
}

/// Branch, commit and merge-request store for all documents in the
/// process. Constructed explicitly and injected, never ambient.
#[derive(Debug, Default)]
pub struct VersionStore {
    branches: HashMap<BranchId, VersionBranch>,
    commits: HashMap<CommitId, VersionCommit>,
    heads: HashMap<BranchId, CommitId>,
    merge_requests: HashMap<MergeRequestId, MergeRequest>,
    /// Conflicts raised by earlier merge attempts, keyed by the
    /// (target-side, source-side) operation pair; consulted on retry
    merge_conflicts: HashMap<(OperationId, OperationId), ConflictId>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn branch(&self, id: BranchId) -> Option<&VersionBranch> {
        self.branches.get(&id)
    }

    pub fn commit(&self, id: CommitId) -> Option<&VersionCommit> {
        self.commits.get(&id)
    }

    pub fn merge_request(&self, id: MergeRequestId) -> Option<&MergeRequest> {
        self.merge_requests.get(&id)
    }

    /// Head commit of a branch
    pub fn head(&self, branch_id: BranchId) -> Result<&VersionCommit> {
        let commit_id = self
            .heads
            .get(&branch_id)
            .ok_or_else(|| SyncError::BranchNotFound(branch_id.to_string()))?;
        self.commits
            .get(commit_id)
            .ok_or_else(|| SyncError::NotFound(format!("commit '{commit_id}'")))
    }

    /// Branches of one document, oldest first
    pub fn branches_for(&self, document_id: &str) -> Vec<&VersionBranch> {
        let mut branches: Vec<&VersionBranch> = self
            .branches
            .values()
            .filter(|b| b.document_id == document_id)
            .collect();
        branches.sort_by_key(|b| b.created_at);
        branches
    }

    /// Create a branch. The first commit copies the parent's head
    /// snapshot, or starts empty for the root branch. A document has
    /// exactly one root branch; names are unique per document.
    pub fn create_branch(
        &mut self,
        document_id: &str,
        name: &str,
        parent_branch_id: Option<BranchId>,
    ) -> Result<BranchId> {
        if name.trim().is_empty() {
            return Err(SyncError::InvalidState(
                "branch name must be non-empty".to_string(),
            ));
        }
        if self
            .branches
            .values()
            .any(|b| b.document_id == document_id && b.name == name)
        {
            return Err(SyncError::DuplicateName(name.to_string()));
        }

        let (forked_from, snapshot) = match parent_branch_id {
            Some(parent_id) => {
                let parent = self
                    .branches
                    .get(&parent_id)
                    .ok_or_else(|| SyncError::BranchNotFound(parent_id.to_string()))?;
                if parent.document_id != document_id {
                    return Err(SyncError::InvalidState(format!(
                        "parent branch '{}' belongs to another document",
                        parent.name
                    )));
                }
                let head = self.head(parent_id)?;
                (Some(head.id), head.snapshot.clone())
            }
            None => {
                if self
                    .branches
                    .values()
                    .any(|b| b.document_id == document_id && b.parent_branch_id.is_none())
                {
                    return Err(SyncError::InvalidState(format!(
                        "document '{document_id}' already has a root branch"
                    )));
                }
                (None, DocumentContent::new())
            }
        };

        let now = Utc::now();
        let branch_id = BranchId::new();
        let commit_id = CommitId::new();
        self.branches.insert(
            branch_id,
            VersionBranch {
                id: branch_id,
                document_id: document_id.to_string(),
                parent_branch_id,
                name: name.to_string(),
                forked_from,
                created_at: now,
            },
        );
        self.commits.insert(
            commit_id,
            VersionCommit {
                id: commit_id,
                branch_id,
                message: format!("create branch '{name}'"),
                snapshot,
                changes_summary: None,
                parent_commit_id: None,
                operations: Vec::new(),
                created_at: now,
            },
        );
        self.heads.insert(branch_id, commit_id);
        tracing::debug!(document = document_id, branch = %branch_id, name, "branch created");
        Ok(branch_id)
    }

    /// Append a commit to a branch's chain
    pub fn create_commit(
        &mut self,
        branch_id: BranchId,
        message: &str,
        snapshot: DocumentContent,
        operations: Vec<Operation>,
        changes_summary: Option<String>,
    ) -> Result<CommitId> {
        if message.trim().is_empty() {
            return Err(SyncError::InvalidState(
                "commit message must be non-empty".to_string(),
            ));
        }
        if !self.branches.contains_key(&branch_id) {
            return Err(SyncError::BranchNotFound(branch_id.to_string()));
        }

        let parent_commit_id = self.heads.get(&branch_id).copied();
        let commit_id = CommitId::new();
        self.commits.insert(
            commit_id,
            VersionCommit {
                id: commit_id,
                branch_id,
                message: message.to_string(),
                snapshot,
                changes_summary,
                parent_commit_id,
                operations,
                created_at: Utc::now(),
            },
        );
        self.heads.insert(branch_id, commit_id);
        tracing::debug!(branch = %branch_id, commit = %commit_id, "commit created");
        Ok(commit_id)
    }

    /// Materialize the document state at a commit (checkout/restore)
    pub fn checkout(&self, commit_id: CommitId) -> Result<DocumentState> {
        let commit = self
            .commits
            .get(&commit_id)
            .ok_or_else(|| SyncError::NotFound(format!("commit '{commit_id}'")))?;
        let branch = self
            .branches
            .get(&commit.branch_id)
            .ok_or_else(|| SyncError::BranchNotFound(commit.branch_id.to_string()))?;

        let applied: HashSet<OperationId> = self
            .lineage(commit_id)?
            .iter()
            .flat_map(|c| c.operations.iter().map(|op| op.id))
            .collect();
        let version = applied.len() as u64;
        Ok(DocumentState::from_snapshot(
            branch.document_id.clone(),
            commit.snapshot.clone(),
            applied,
            version,
        ))
    }

    /// Full ancestry of a commit, newest first, crossing fork points into
    /// parent branches
    fn lineage(&self, head: CommitId) -> Result<Vec<&VersionCommit>> {
        let mut chain = Vec::new();
        let mut current = Some(head);
        while let Some(id) = current {
            let commit = self
                .commits
                .get(&id)
                .ok_or_else(|| SyncError::NotFound(format!("commit '{id}'")))?;
            current = match commit.parent_commit_id {
                Some(parent) => Some(parent),
                None => self
                    .branches
                    .get(&commit.branch_id)
                    .and_then(|b| b.forked_from),
            };
            chain.push(commit);
        }
        Ok(chain)
    }

    /// Nearest commit shared by both ancestries: the three-way merge base
    fn common_ancestor(&self, a: CommitId, b: CommitId) -> Result<CommitId> {
        let b_lineage: HashSet<CommitId> = self.lineage(b)?.iter().map(|c| c.id).collect();
        self.lineage(a)?
            .iter()
            .map(|c| c.id)
            .find(|id| b_lineage.contains(id))
            .ok_or_else(|| {
                SyncError::InvalidState("branches share no common ancestor".to_string())
            })
    }

    /// Operations on the path from `ancestor` (exclusive) to `head`, in
    /// commit order
    fn operations_since(&self, head: CommitId, ancestor: CommitId) -> Result<Vec<Operation>> {
        let mut ops = Vec::new();
        for commit in self.lineage(head)? {
            if commit.id == ancestor {
                return Ok(ops.into_iter().rev().flatten().collect());
            }
            ops.push(commit.operations.clone());
        }
        Err(SyncError::InvalidState(format!(
            "commit '{ancestor}' is not an ancestor of '{head}'"
        )))
    }

    /// Ordered operation diff between two commits. `from` must be an
    /// ancestor of `to`. Read-only.
    pub fn compare_versions(&self, from: CommitId, to: CommitId) -> Result<Vec<Operation>> {
        self.operations_since(to, from)
    }

    pub fn create_merge_request(
        &mut self,
        source_branch_id: BranchId,
        target_branch_id: BranchId,
        reviewers: Vec<UserId>,
        assignee: Option<UserId>,
    ) -> Result<MergeRequestId> {
        let source = self
            .branches
            .get(&source_branch_id)
            .ok_or_else(|| SyncError::BranchNotFound(source_branch_id.to_string()))?;
        let target = self
            .branches
            .get(&target_branch_id)
            .ok_or_else(|| SyncError::BranchNotFound(target_branch_id.to_string()))?;
        if source.document_id != target.document_id {
            return Err(SyncError::InvalidState(
                "merge request must stay within one document".to_string(),
            ));
        }
        if source_branch_id == target_branch_id {
            return Err(SyncError::InvalidState(
                "cannot merge a branch into itself".to_string(),
            ));
        }

        let id = MergeRequestId::new();
        self.merge_requests.insert(
            id,
            MergeRequest {
                id,
                source_branch_id,
                target_branch_id,
                status: MergeRequestStatus::Draft,
                reviewers,
                assignee,
                merged_commit_id: None,
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    fn transition(&mut self, id: MergeRequestId, next: MergeRequestStatus) -> Result<()> {
        let mr = self
            .merge_requests
            .get_mut(&id)
            .ok_or_else(|| SyncError::NotFound(format!("merge request '{id}'")))?;
        if !mr.status.can_transition_to(next) {
            return Err(SyncError::InvalidState(format!(
                "merge request '{id}': {:?} -> {next:?} is not allowed",
                mr.status
            )));
        }
        tracing::debug!(merge_request = %id, from = ?mr.status, to = ?next, "merge request transition");
        mr.status = next;
        Ok(())
    }

    /// Draft -> Open, or re-open after requested changes
    pub fn open_merge_request(&mut self, id: MergeRequestId) -> Result<()> {
        self.transition(id, MergeRequestStatus::Open)
    }

    /// Record a review verdict; the reviewer is added to the request
    pub fn review_merge_request(
        &mut self,
        id: MergeRequestId,
        reviewer: impl Into<UserId>,
        verdict: ReviewVerdict,
    ) -> Result<()> {
        let next = match verdict {
            ReviewVerdict::Approve => MergeRequestStatus::Approved,
            ReviewVerdict::RequestChanges => MergeRequestStatus::NeedsChanges,
        };
        self.transition(id, next)?;
        let reviewer = reviewer.into();
        // transition() verified the id
        if let Some(mr) = self.merge_requests.get_mut(&id) {
            if !mr.reviewers.contains(&reviewer) {
                mr.reviewers.push(reviewer);
            }
        }
        Ok(())
    }

    /// Close without merging; terminal
    pub fn close_merge_request(&mut self, id: MergeRequestId) -> Result<()> {
        self.transition(id, MergeRequestStatus::Closed)
    }

    /// Three-way merge of an approved merge request.
    ///
    /// Source and target operations since the common ancestor are
    /// reconciled through the transform engine. Overlapping concurrent
    /// pairs where the engine would discard or rewrite a side are not
    /// settled silently in history: they are recorded as open Conflicts
    /// and the merge fails with `MergeBlocked`, leaving both chains
    /// untouched. Once every such conflict is resolved through
    /// [`ConflictTracker::resolve`], retrying the merge substitutes the
    /// resolutions and commits.
    pub fn merge_branch(
        &mut self,
        id: MergeRequestId,
        conflicts: &mut ConflictTracker,
        merged_by: impl Into<UserId>,
    ) -> Result<CommitId> {
        let mr = self
            .merge_requests
            .get(&id)
            .ok_or_else(|| SyncError::NotFound(format!("merge request '{id}'")))?;
        if mr.status != MergeRequestStatus::Approved {
            return Err(SyncError::InvalidState(format!(
                "merge request '{id}' is {:?}, only approved requests merge",
                mr.status
            )));
        }
        let (source_branch, target_branch) = (mr.source_branch_id, mr.target_branch_id);

        let source_head = self.head(source_branch)?.id;
        let target_head = self.head(target_branch)?.id;
        let ancestor = self.common_ancestor(source_head, target_head)?;

        let mut source_ops = self.operations_since(source_head, ancestor)?;
        let mut target_ops = self.operations_since(target_head, ancestor)?;

        // Pass 1: find overlapping concurrent pairs the engine would
        // settle lossily, and collect resolutions from earlier attempts
        let mut blocked = 0usize;
        let mut drop_source: HashSet<OperationId> = HashSet::new();
        let mut drop_target: HashSet<OperationId> = HashSet::new();
        let mut resolved_ops: Vec<Operation> = Vec::new();

        for s in &source_ops {
            for t in &target_ops {
                if !s.target.overlaps(&t.target) || !s.is_concurrent_with(t) {
                    continue;
                }
                let (t_after, s_after) = transform(t, s);
                let lossless =
                    t_after.as_ref() == Some(t) && s_after.as_ref() == Some(s);
                if lossless {
                    continue;
                }

                let key = (t.id, s.id);
                match self.merge_conflicts.get(&key).copied() {
                    Some(conflict_id) => match conflicts.get(conflict_id) {
                        Some(conflict) if conflict.is_open() => blocked += 1,
                        Some(conflict) => {
                            drop_target.insert(t.id);
                            drop_source.insert(s.id);
                            if let Some(resolution) = &conflict.resolution {
                                resolved_ops
                                    .extend(resolution.resulting_operations.iter().cloned());
                            }
                        }
                        // Tracker lost the conflict; raise it again
                        None => {
                            let conflict_id =
                                conflicts.record(vec![t.clone(), s.clone()])?;
                            self.merge_conflicts.insert(key, conflict_id);
                            blocked += 1;
                        }
                    },
                    None => {
                        let conflict_id = conflicts.record(vec![t.clone(), s.clone()])?;
                        self.merge_conflicts.insert(key, conflict_id);
                        blocked += 1;
                    }
                }
            }
        }

        if blocked > 0 {
            tracing::warn!(merge_request = %id, blocked, "merge blocked by unresolved conflicts");
            return Err(SyncError::MergeBlocked { count: blocked });
        }

        // Pass 2: build the merged state on top of the ancestor snapshot.
        // Resolved pairs are replaced by their resolution outcome; the
        // rest is the union of both sides in the fixed total order.
        target_ops.retain(|op| !drop_target.contains(&op.id));
        source_ops.retain(|op| !drop_source.contains(&op.id));

        let mut state = self.checkout(ancestor)?;
        state.replay(&target_ops)?;
        for s in &source_ops {
            let mut current = Some(s.clone());
            for t in &target_ops {
                let Some(ref c) = current else { break };
                if !c.target.overlaps(&t.target) || !c.is_concurrent_with(t) {
                    continue;
                }
                let (c_after, _) = transform(c, t);
                current = c_after;
            }
            if let Some(op) = current {
                state.apply(&op)?;
            }
        }
        sort_causal(&mut resolved_ops);
        for op in &resolved_ops {
            // A resolution may re-issue an operation already on the
            // target chain ("ours"); re-apply it so the outcome sticks
            state.applied.remove(&op.id);
            state.apply(op)?;
        }

        let source_name = self
            .branches
            .get(&source_branch)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| source_branch.to_string());
        let target_name = self
            .branches
            .get(&target_branch)
            .map(|b| b.name.clone())
            .unwrap_or_else(|| target_branch.to_string());

        let mut merged_ops = source_ops;
        merged_ops.extend(resolved_ops);
        sort_causal(&mut merged_ops);
        let summary = format!(
            "{} operation(s) from '{source_name}'",
            merged_ops.len()
        );
        let commit_id = self.create_commit(
            target_branch,
            &format!("merge branch '{source_name}' into '{target_name}'"),
            state.content,
            merged_ops,
            Some(summary),
        )?;

        self.transition(id, MergeRequestStatus::Merged)?;
        // transition() verified the id
        if let Some(mr) = self.merge_requests.get_mut(&id) {
            mr.merged_commit_id = Some(commit_id);
        }
        let merged_by = merged_by.into();
        tracing::debug!(merge_request = %id, commit = %commit_id, by = %merged_by, "merge completed");
        Ok(commit_id)
    }
}
