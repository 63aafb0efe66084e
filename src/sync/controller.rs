//! Sync Controller: per-document synchronization sessions
//!
//! The controller owns one [`DocumentState`] and one pending-operation
//! queue per open document and is the only component that mutates
//! document state (single-writer discipline). Sessions are fully
//! independent: a sync pass, failure or cleanup for one document never
//! touches another.
//!
//! Controllers are constructed explicitly and injected; there is no
//! ambient global instance.

use crate::conflict::{
    predict_conflict, Conflict, ConflictId, ConflictStats, ConflictTracker, Resolution,
    ResolutionStrategy, ResolveOptions,
};
use crate::document::DocumentState;
use crate::error::{Result, SyncError};
use crate::operation::{
    sort_causal, DeliveryState, Operation, OperationId, OperationKind, QueuedOperation, TargetRef,
};
use crate::sync::backoff::BackoffPolicy;
use crate::sync::transport::{DocumentStore, SyncTransport};
use crate::transform::transform_batch;
use crate::{DocumentId, UserId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use tokio::sync::broadcast;

/// Attribution recorded on conflicts the transform engine settles itself
const AUTO_RESOLVER: &str = "transform-engine";

/// A local edit before the controller stamps it into an [`Operation`].
/// Id and timestamp are assigned on apply when absent.
#[derive(Debug, Clone)]
pub struct LocalEdit {
    pub kind: OperationKind,
    pub target: TargetRef,
    pub payload: serde_json::Value,
    pub id: Option<OperationId>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl LocalEdit {
    pub fn new(kind: OperationKind, target: TargetRef, payload: serde_json::Value) -> Self {
        Self {
            kind,
            target,
            payload,
            id: None,
            timestamp: None,
        }
    }
}

/// Signals emitted once per reconciliation outcome
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// One successful reconciliation, with the new server version
    Complete { document_id: DocumentId, version: u64 },
    /// Transport or transform failure; pending operations are preserved
    Error { document_id: DocumentId, message: String },
}

#[derive(Debug, Clone)]
pub struct SyncControllerConfig {
    pub backoff: BackoffPolicy,
    /// When false (the default), local edits on a target covered by an
    /// open conflict are refused until the conflict is resolved
    pub allow_edits_on_open_conflicts: bool,
    /// Spawn a sync pass after each local edit. Hosts that drive their
    /// own sync cadence can turn this off.
    pub background_sync: bool,
}

impl Default for SyncControllerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            allow_edits_on_open_conflicts: false,
            background_sync: true,
        }
    }
}

/// Sync-pass bookkeeping, serialized by the session mutex so only one
/// reconciliation runs per document at a time
#[derive(Debug)]
struct SyncCursor {
    last_synced_version: u64,
    stale: bool,
}

/// Everything one open document owns
#[derive(Clone)]
struct SessionHandle {
    state: Arc<StdRwLock<DocumentState>>,
    queue: Arc<StdMutex<Vec<QueuedOperation>>>,
    cursor: Arc<tokio::sync::Mutex<SyncCursor>>,
    cancelled: Arc<AtomicBool>,
}

/// Per-process synchronization service
pub struct SyncController {
    user_id: UserId,
    transport: Arc<dyn SyncTransport>,
    store: Arc<dyn DocumentStore>,
    config: SyncControllerConfig,
    sessions: StdRwLock<HashMap<DocumentId, SessionHandle>>,
    conflicts: StdMutex<ConflictTracker>,
    events: broadcast::Sender<SyncEvent>,
}

// Lock helpers: a poisoned lock only means a panic mid-update elsewhere;
// recover the guard rather than cascading the panic across sessions.
fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(m: &StdRwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(m: &StdRwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    m.write().unwrap_or_else(|e| e.into_inner())
}

impl SyncController {
    pub fn new(
        user_id: impl Into<UserId>,
        transport: Arc<dyn SyncTransport>,
        store: Arc<dyn DocumentStore>,
        config: SyncControllerConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            user_id: user_id.into(),
            transport,
            store,
            config,
            sessions: StdRwLock::new(HashMap::new()),
            conflicts: StdMutex::new(ConflictTracker::new()),
            events,
        }
    }

    /// Listen for [`SyncEvent`]s. The subscription ends when the receiver
    /// is dropped; `cleanup_document` does not affect other listeners.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn handle(&self, document_id: &str) -> Result<SessionHandle> {
        read(&self.sessions)
            .get(document_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("document '{document_id}' not initialized")))
    }

    /// Fetch the committed log upstream and replay it in causal order.
    /// Fails with `NotFound` if the document does not exist upstream and
    /// `ConflictState` if it is already initialized here.
    pub async fn initialize_document(&self, document_id: &str) -> Result<u64> {
        if read(&self.sessions).contains_key(document_id) {
            return Err(SyncError::ConflictState(document_id.to_string()));
        }

        let log = self
            .store
            .fetch_document(document_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("document '{document_id}'")))?;

        let mut ops = log.operations;
        sort_causal(&mut ops);
        let mut state = DocumentState::new(document_id);
        // A log written by live sync can hold operations whose targets a
        // concurrent delete removed before they were transmitted; replay
        // with the same tolerance as reconciliation or the document
        // would be permanently un-openable
        for op in &ops {
            self.apply_audited(document_id, &mut state, op)?;
        }

        let mut sessions = write(&self.sessions);
        // Re-check: another task may have initialized during the fetch
        if sessions.contains_key(document_id) {
            return Err(SyncError::ConflictState(document_id.to_string()));
        }
        sessions.insert(
            document_id.to_string(),
            SessionHandle {
                state: Arc::new(StdRwLock::new(state)),
                queue: Arc::new(StdMutex::new(Vec::new())),
                cursor: Arc::new(tokio::sync::Mutex::new(SyncCursor {
                    last_synced_version: log.version,
                    stale: false,
                })),
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        );
        tracing::debug!(document = document_id, version = log.version, "document initialized");
        Ok(log.version)
    }

    /// Discard in-memory state for a document. No-op if uninitialized.
    /// Cancels any in-flight sync for this document only; unacknowledged
    /// pending operations are discarded with a warning, never merged
    /// silently later.
    pub fn cleanup_document(&self, document_id: &str) {
        let removed = write(&self.sessions).remove(document_id);
        let Some(handle) = removed else {
            return;
        };
        handle.cancelled.store(true, Ordering::SeqCst);
        let discarded = lock(&handle.queue).iter().filter(|q| q.is_pending()).count();
        if discarded > 0 {
            tracing::warn!(
                document = document_id,
                discarded,
                "cleanup discarded unacknowledged pending operations"
            );
        }
        tracing::debug!(document = document_id, "document cleaned up");
    }

    /// Synchronous snapshot of the materialized state; `None` when the
    /// document is not initialized. Never suspends.
    pub fn get_document_state(&self, document_id: &str) -> Option<DocumentState> {
        let handle = read(&self.sessions).get(document_id).cloned()?;
        let state = read(&handle.state).clone();
        Some(state)
    }

    /// Whether the document is flagged stale after exhausted retries
    pub fn is_stale(&self, document_id: &str) -> bool {
        match self.handle(document_id) {
            Ok(handle) => match handle.cursor.try_lock() {
                Ok(cursor) => cursor.stale,
                // A sync pass is running right now
                Err(_) => false,
            },
            Err(_) => false,
        }
    }

    /// Number of unacknowledged pending operations
    pub fn pending_count(&self, document_id: &str) -> usize {
        self.handle(document_id)
            .map(|h| lock(&h.queue).iter().filter(|q| q.is_pending()).count())
            .unwrap_or(0)
    }

    /// Delivery audit for a document's locally generated operations.
    /// Pending entries await acknowledgment; acknowledged and rejected
    /// entries are retained for inspection, never retransmitted.
    pub fn queued_operations(&self, document_id: &str) -> Vec<QueuedOperation> {
        self.handle(document_id)
            .map(|h| lock(&h.queue).clone())
            .unwrap_or_default()
    }

    /// Stamp, queue and optimistically apply a local edit. The local user
    /// sees the edit immediately; transmission is scheduled in the
    /// background and the operation stays pending until acknowledged.
    pub fn apply_local_operation(
        self: &Arc<Self>,
        document_id: &str,
        edit: LocalEdit,
    ) -> Result<Operation> {
        let handle = self.handle(document_id)?;

        if !self.config.allow_edits_on_open_conflicts
            && lock(&self.conflicts).blocks_target(&edit.target)
        {
            return Err(SyncError::InvalidOperation(format!(
                "target '{}' is blocked by an unresolved conflict",
                edit.target.node_id
            )));
        }

        let mut state = write(&handle.state);
        let operation = Operation {
            id: edit.id.unwrap_or_default(),
            document_id: document_id.to_string(),
            user_id: self.user_id.clone(),
            timestamp: edit.timestamp.unwrap_or_else(Utc::now),
            kind: edit.kind,
            target: edit.target,
            payload: edit.payload,
            observed: state.applied.iter().copied().collect(),
        };

        if let Err(err) = state.apply(&operation) {
            // Surfaced to the caller, never queued or silently dropped
            tracing::warn!(document = document_id, error = %err, "local operation rejected");
            return Err(err);
        }
        drop(state);

        lock(&handle.queue).push(QueuedOperation::pending(operation.clone()));
        self.schedule_sync(document_id);
        Ok(operation)
    }

    /// Kick off a background sync pass when a runtime is available.
    /// Failures surface through `SyncEvent::Error`, not here.
    fn schedule_sync(self: &Arc<Self>, document_id: &str) {
        if !self.config.background_sync {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let controller = Arc::clone(self);
        let document_id = document_id.to_string();
        runtime.spawn(async move {
            if let Err(err) = controller.sync_document(&document_id).await {
                tracing::debug!(document = %document_id, error = %err, "scheduled sync failed");
            }
        });
    }

    /// Explicit reconciliation pass: transmit everything pending, pull
    /// remote operations since the last known version and reconcile.
    /// Retries transport failures with exponential backoff; when retries
    /// are exhausted the document is flagged stale, `sync-error` fires
    /// and pending operations stay queued for the next explicit sync.
    pub async fn sync_document(&self, document_id: &str) -> Result<u64> {
        let handle = self.handle(document_id)?;
        let mut cursor = handle.cursor.lock().await;

        let mut attempt: u32 = 0;
        loop {
            if handle.cancelled.load(Ordering::SeqCst) {
                return Err(SyncError::Transport(format!(
                    "sync cancelled: document '{document_id}' closed"
                )));
            }

            match self.sync_once(document_id, &handle, &mut cursor).await {
                Ok(version) => {
                    cursor.stale = false;
                    self.emit(SyncEvent::Complete {
                        document_id: document_id.to_string(),
                        version,
                    });
                    return Ok(version);
                }
                Err(SyncError::Transport(message))
                    if attempt < self.config.backoff.max_retries =>
                {
                    let delay = self.config.backoff.delay(attempt);
                    tracing::warn!(
                        document = document_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %message,
                        "transport failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    cursor.stale = true;
                    tracing::error!(document = document_id, error = %err, "sync failed");
                    self.emit(SyncEvent::Error {
                        document_id: document_id.to_string(),
                        message: err.to_string(),
                    });
                    return Err(err);
                }
            }
        }
    }

    async fn sync_once(
        &self,
        document_id: &str,
        handle: &SessionHandle,
        cursor: &mut SyncCursor,
    ) -> Result<u64> {
        // 1. Pull operations from other participants first, so pending
        // locals are transformed against them before transmission
        let batch = self
            .transport
            .fetch_since(document_id, cursor.last_synced_version)
            .await?;

        // 2. Reconcile; no suspension points inside
        self.reconcile(document_id, handle, batch.operations)?;
        cursor.last_synced_version = cursor.last_synced_version.max(batch.version);

        if handle.cancelled.load(Ordering::SeqCst) {
            return Err(SyncError::Transport(format!(
                "sync cancelled: document '{document_id}' closed"
            )));
        }

        // 3. Transmit what is still pending after transformation
        let pending: Vec<Operation> = lock(&handle.queue)
            .iter()
            .filter(|q| q.is_pending())
            .map(|q| q.operation.clone())
            .collect();

        if !pending.is_empty() {
            let ack = self
                .transport
                .transmit_operations(document_id, &pending)
                .await?;
            // Acknowledged operations stop retransmitting but stay in
            // the queue as the delivery audit; their effects are already
            // folded into local state
            for entry in lock(&handle.queue).iter_mut() {
                if entry.is_pending() && ack.acknowledged.contains(&entry.operation.id) {
                    entry.state = DeliveryState::Acknowledged;
                }
            }
            // The ack's version also counts foreign operations that
            // landed between the fetch and the transmit; fetch again so
            // the cursor never moves past an undelivered operation
            let batch = self
                .transport
                .fetch_since(document_id, cursor.last_synced_version)
                .await?;
            self.reconcile(document_id, handle, batch.operations)?;
            cursor.last_synced_version = cursor.last_synced_version.max(batch.version);
        }

        Ok(cursor.last_synced_version)
    }

    /// Fold remote operations into the document, transforming the pending
    /// queue along the way. Remote ops are processed in the fixed total
    /// order; already-applied ids are skipped (idempotence).
    fn reconcile(
        &self,
        document_id: &str,
        handle: &SessionHandle,
        mut remote_ops: Vec<Operation>,
    ) -> Result<()> {
        sort_causal(&mut remote_ops);

        for remote in remote_ops {
            let mut state = write(&handle.state);
            if state.applied.contains(&remote.id) {
                continue;
            }

            let mut queue = lock(&handle.queue);
            let pending_ops: Vec<Operation> = queue
                .iter()
                .filter(|q| q.is_pending())
                .map(|q| q.operation.clone())
                .collect();

            let overlapping = predict_conflict(&remote, &pending_ops);
            let (surviving, remote_now) = transform_batch(&pending_ops, &remote);

            if !overlapping.is_empty() {
                // The transform engine settles live overlaps itself; the
                // pair is recorded resolved for the audit trail and stats
                let strategy = if remote_now.is_none() {
                    ResolutionStrategy::Ours
                } else if surviving.len() < pending_ops.len() {
                    ResolutionStrategy::Theirs
                } else {
                    ResolutionStrategy::Merge
                };
                let mut ops = overlapping;
                ops.push(remote.clone());
                let resulting = surviving
                    .iter()
                    .cloned()
                    .chain(remote_now.clone())
                    .collect();
                lock(&self.conflicts).record_auto(ops, strategy, resulting, AUTO_RESOLVER)?;
            }

            // Rewrite the pending queue: survivors carry their
            // transformed form, superseded entries move to Rejected and
            // stay as the delivery audit
            let surviving_by_id: HashMap<OperationId, Operation> =
                surviving.into_iter().map(|op| (op.id, op)).collect();
            for entry in queue.iter_mut() {
                if !entry.is_pending() {
                    continue;
                }
                match surviving_by_id.get(&entry.operation.id) {
                    Some(transformed) => {
                        entry.operation = transformed.clone();
                    }
                    None => {
                        tracing::debug!(
                            document = document_id,
                            operation = %entry.operation.id,
                            "pending operation superseded by remote"
                        );
                        entry.state = DeliveryState::Rejected {
                            reason: format!("superseded by remote operation {}", remote.id),
                        };
                    }
                }
            }
            drop(queue);

            match remote_now {
                Some(op) => self.apply_audited(document_id, &mut *state, &op)?,
                None => {
                    // Transformed away entirely; still counted as applied
                    state.applied.insert(remote.id);
                    state.version += 1;
                }
            }
        }
        Ok(())
    }

    /// Apply an operation from the committed log or a remote site,
    /// tolerating targets a preceding operation already removed: the
    /// failure is reported and audited, and the log position consumed,
    /// so every site converges on the same applied set.
    fn apply_audited(
        &self,
        document_id: &str,
        state: &mut DocumentState,
        op: &Operation,
    ) -> Result<()> {
        match state.apply(op) {
            Ok(_) => Ok(()),
            Err(SyncError::InvalidOperation(message)) => {
                tracing::warn!(
                    document = document_id,
                    operation = %op.id,
                    error = %message,
                    "operation inapplicable, consumed without effect"
                );
                lock(&self.conflicts).record_auto(
                    vec![op.clone()],
                    ResolutionStrategy::Ours,
                    Vec::new(),
                    AUTO_RESOLVER,
                )?;
                state.applied.insert(op.id);
                state.version += 1;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Speculative conflict probe for a prospective edit, against the
    /// current pending queue. Pure read, usable for UI warnings.
    pub fn predict_local_conflicts(
        &self,
        document_id: &str,
        candidate: &Operation,
    ) -> Result<Vec<Operation>> {
        let handle = self.handle(document_id)?;
        let pending: Vec<Operation> = lock(&handle.queue)
            .iter()
            .map(|q| q.operation.clone())
            .collect();
        Ok(predict_conflict(candidate, &pending))
    }

    /// Resolve a tracked conflict. See [`ConflictTracker::resolve`];
    /// resulting operations can be fed back via `apply_local_operation`.
    pub fn resolve_conflict(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        options: ResolveOptions,
        resolved_by: impl Into<UserId>,
    ) -> Result<Resolution> {
        lock(&self.conflicts).resolve(conflict_id, strategy, options, resolved_by)
    }

    /// Open conflicts across all documents, oldest first
    pub fn active_conflicts(&self) -> Vec<Conflict> {
        lock(&self.conflicts)
            .active_conflicts()
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn conflict_stats(&self) -> ConflictStats {
        lock(&self.conflicts).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::transport::{AckBatch, ChannelMessage, CommittedLog, RemoteBatch};
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicU64;

    /// In-memory server double: a shared committed log per document
    #[derive(Default)]
    struct FakeServer {
        log: StdMutex<HashMap<DocumentId, Vec<Operation>>>,
        fail_transmits: AtomicU64,
        redeliver_all: AtomicBool,
        /// Operations another participant lands mid-transmit, before
        /// the transmitted batch is appended
        inject_on_transmit: StdMutex<Vec<Operation>>,
    }

    impl FakeServer {
        fn with_document(document_id: &str) -> Arc<Self> {
            let server = Self::default();
            lock(&server.log).insert(document_id.to_string(), Vec::new());
            Arc::new(server)
        }

        fn push_remote(&self, op: Operation) {
            lock(&self.log)
                .entry(op.document_id.clone())
                .or_default()
                .push(op);
        }

        /// Next `n` transmit calls fail with a transport error
        fn fail_next_transmits(&self, n: u64) {
            self.fail_transmits.store(n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl SyncTransport for FakeServer {
        async fn send(&self, _message: ChannelMessage) -> Result<()> {
            Ok(())
        }

        async fn transmit_operations(
            &self,
            document_id: &str,
            operations: &[Operation],
        ) -> Result<AckBatch> {
            let remaining = self.fail_transmits.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_transmits.store(remaining - 1, Ordering::SeqCst);
                return Err(SyncError::Transport("connection reset".to_string()));
            }
            let mut log = lock(&self.log);
            let entries = log
                .get_mut(document_id)
                .ok_or_else(|| SyncError::NotFound(document_id.to_string()))?;
            for op in lock(&self.inject_on_transmit).drain(..) {
                entries.push(op);
            }
            for op in operations {
                if !entries.iter().any(|e| e.id == op.id) {
                    entries.push(op.clone());
                }
            }
            Ok(AckBatch {
                acknowledged: operations.iter().map(|op| op.id).collect(),
                version: entries.len() as u64,
            })
        }

        async fn fetch_since(&self, document_id: &str, version: u64) -> Result<RemoteBatch> {
            let skip = if self.redeliver_all.load(Ordering::SeqCst) {
                0
            } else {
                version as usize
            };
            let log = lock(&self.log);
            let entries = log
                .get(document_id)
                .ok_or_else(|| SyncError::NotFound(document_id.to_string()))?;
            Ok(RemoteBatch {
                operations: entries.iter().skip(skip).cloned().collect(),
                version: entries.len() as u64,
            })
        }
    }

    #[async_trait]
    impl DocumentStore for FakeServer {
        async fn fetch_document(&self, document_id: &str) -> Result<Option<CommittedLog>> {
            let log = lock(&self.log);
            Ok(log.get(document_id).map(|entries| CommittedLog {
                operations: entries.clone(),
                version: entries.len() as u64,
            }))
        }
    }

    fn controller(server: &Arc<FakeServer>, user: &str) -> Arc<SyncController> {
        let config = SyncControllerConfig {
            backoff: BackoffPolicy {
                base: std::time::Duration::from_millis(1),
                cap: std::time::Duration::from_millis(4),
                max_retries: 3,
            },
            // Tests drive sync explicitly for determinism
            background_sync: false,
            ..SyncControllerConfig::default()
        };
        Arc::new(SyncController::new(
            user,
            Arc::clone(server) as Arc<dyn SyncTransport>,
            Arc::clone(server) as Arc<dyn DocumentStore>,
            config,
        ))
    }

    fn insert_edit(node: &str) -> LocalEdit {
        LocalEdit::new(
            OperationKind::Insert,
            TargetRef::node(node),
            json!({ "attrs": { "label": node } }),
        )
    }

    fn op_for(seconds: i64, user: &str, kind: OperationKind, target: TargetRef, payload: serde_json::Value) -> Operation {
        use chrono::TimeZone;
        Operation {
            id: OperationId::new(),
            document_id: "doc-1".to_string(),
            user_id: user.to_string(),
            timestamp: Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap(),
            kind,
            target,
            payload,
            observed: BTreeSet::new(),
        }
    }

    fn remote_op(server: &FakeServer, seconds: i64, user: &str, kind: OperationKind, target: TargetRef, payload: serde_json::Value) -> Operation {
        let op = op_for(seconds, user, kind, target, payload);
        server.push_remote(op.clone());
        op
    }

    #[tokio::test]
    async fn test_initialize_requires_upstream_document() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");

        let err = ctrl.initialize_document("ghost").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        ctrl.initialize_document("doc-1").await.unwrap();
        let err = ctrl.initialize_document("doc-1").await.unwrap_err();
        assert!(matches!(err, SyncError::ConflictState(_)));
    }

    #[tokio::test]
    async fn test_initialize_replays_log_with_superseded_insert() {
        // Live sync can commit an insert whose parent an earlier-ordered
        // concurrent delete already removed; a fresh participant must
        // still be able to open the document
        let server = FakeServer::with_document("doc-1");
        remote_op(&server, 1, "amy", OperationKind::Insert, TargetRef::node("x"), json!({ "attrs": {} }));
        remote_op(&server, 2, "bob", OperationKind::Delete, TargetRef::node("x"), json!({}));
        remote_op(
            &server,
            3,
            "amy",
            OperationKind::Insert,
            TargetRef::node("x-child"),
            json!({ "parent": "x", "attrs": {} }),
        );

        let ctrl = controller(&server, "cat");
        ctrl.initialize_document("doc-1").await.unwrap();

        let state = ctrl.get_document_state("doc-1").unwrap();
        assert!(!state.contains_node("x"));
        assert!(!state.contains_node("x-child"));
        // The inapplicable insert consumed its log position and was audited
        assert_eq!(state.applied.len(), 3);
        assert_eq!(ctrl.conflict_stats().resolved, 1);
        assert!(ctrl.active_conflicts().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_is_noop_when_uninitialized() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.cleanup_document("never-opened");
        assert!(ctrl.get_document_state("never-opened").is_none());
    }

    #[tokio::test]
    async fn test_local_edit_is_visible_immediately() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();

        let state = ctrl.get_document_state("doc-1").unwrap();
        assert!(state.contains_node("n1"));
        assert_eq!(state.version, 1);
    }

    #[tokio::test]
    async fn test_sync_flushes_pending_queue() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        ctrl.apply_local_operation("doc-1", insert_edit("n2")).unwrap();

        let version = ctrl.sync_document("doc-1").await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(ctrl.pending_count("doc-1"), 0);
        assert_eq!(lock(&server.log)["doc-1"].len(), 2);
    }

    #[tokio::test]
    async fn test_operation_landing_during_transmit_is_not_skipped() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        // Bob's insert reaches the server after amy's fetch and before
        // her batch, so the ack version counts an operation amy has
        // never seen
        lock(&server.inject_on_transmit).push(op_for(
            50,
            "bob",
            OperationKind::Insert,
            TargetRef::node("from-bob"),
            json!({ "attrs": {} }),
        ));

        ctrl.sync_document("doc-1").await.unwrap();

        let state = ctrl.get_document_state("doc-1").unwrap();
        assert!(state.contains_node("from-bob"));
        assert!(state.contains_node("n1"));
        assert_eq!(ctrl.pending_count("doc-1"), 0);
    }

    #[tokio::test]
    async fn test_delivery_states_record_ack_and_supersede() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        let inserted = ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        assert_eq!(
            ctrl.queued_operations("doc-1")[0].state,
            DeliveryState::Pending
        );

        ctrl.sync_document("doc-1").await.unwrap();
        let queue = ctrl.queued_operations("doc-1");
        assert_eq!(queue[0].operation.id, inserted.id);
        assert_eq!(queue[0].state, DeliveryState::Acknowledged);

        // A concurrent remote delete supersedes the pending update; the
        // entry stays in the queue for the audit instead of vanishing
        let update = ctrl
            .apply_local_operation(
                "doc-1",
                LocalEdit::new(
                    OperationKind::Update,
                    TargetRef::field("n1", "label"),
                    json!("renamed"),
                ),
            )
            .unwrap();
        remote_op(&server, 100, "bob", OperationKind::Delete, TargetRef::node("n1"), json!({}));
        ctrl.sync_document("doc-1").await.unwrap();

        let queue = ctrl.queued_operations("doc-1");
        let entry = queue
            .iter()
            .find(|q| q.operation.id == update.id)
            .expect("superseded entry retained");
        assert!(matches!(entry.state, DeliveryState::Rejected { .. }));
        assert_eq!(ctrl.pending_count("doc-1"), 0);
    }

    #[tokio::test]
    async fn test_sync_complete_event_fires_once() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();
        let mut events = ctrl.subscribe();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        ctrl.sync_document("doc-1").await.unwrap();

        match events.recv().await.unwrap() {
            SyncEvent::Complete { document_id, version } => {
                assert_eq!(document_id, "doc-1");
                assert_eq!(version, 1);
            }
            SyncEvent::Error { message, .. } => panic!("unexpected sync error: {message}"),
        }
        // Exactly one reconciliation, exactly one event
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn test_background_sync_is_scheduled_on_local_edit() {
        let server = FakeServer::with_document("doc-1");
        let config = SyncControllerConfig {
            backoff: BackoffPolicy::default(),
            ..SyncControllerConfig::default()
        };
        let ctrl = Arc::new(SyncController::new(
            "amy",
            Arc::clone(&server) as Arc<dyn SyncTransport>,
            Arc::clone(&server) as Arc<dyn DocumentStore>,
            config,
        ));
        ctrl.initialize_document("doc-1").await.unwrap();
        let mut events = ctrl.subscribe();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();

        // The spawned pass completes without an explicit sync_document
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), events.recv())
            .await
            .expect("background sync never completed")
            .unwrap();
        assert!(matches!(event, SyncEvent::Complete { .. }));
        assert_eq!(ctrl.pending_count("doc-1"), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_retries_then_succeeds() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        server.fail_next_transmits(2);

        ctrl.sync_document("doc-1").await.unwrap();
        assert_eq!(ctrl.pending_count("doc-1"), 0);
        assert!(!ctrl.is_stale("doc-1"));
    }

    #[tokio::test]
    async fn test_exhausted_retries_flag_stale_and_keep_pending() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();
        let mut events = ctrl.subscribe();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        server.fail_next_transmits(100);

        let err = ctrl.sync_document("doc-1").await.unwrap_err();
        assert!(matches!(err, SyncError::Transport(_)));
        assert_eq!(ctrl.pending_count("doc-1"), 1);
        assert!(ctrl.is_stale("doc-1"));

        // Error event fired, local state intact
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::Error { .. }) {
                saw_error = true;
            }
        }
        assert!(saw_error);
        assert!(ctrl.get_document_state("doc-1").unwrap().contains_node("n1"));

        // Explicit user-triggered sync recovers
        server.fail_next_transmits(0);
        ctrl.sync_document("doc-1").await.unwrap();
        assert!(!ctrl.is_stale("doc-1"));
        assert_eq!(ctrl.pending_count("doc-1"), 0);
    }

    #[tokio::test]
    async fn test_remote_operations_are_pulled_and_applied() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        remote_op(
            &server,
            1,
            "bob",
            OperationKind::Insert,
            TargetRef::node("from-bob"),
            json!({ "attrs": {} }),
        );

        ctrl.sync_document("doc-1").await.unwrap();
        assert!(ctrl.get_document_state("doc-1").unwrap().contains_node("from-bob"));
    }

    #[tokio::test]
    async fn test_concurrent_update_delete_resolves_without_error() {
        // Scenario: bob deletes a node while amy updates one of its
        // attributes. Delete wins, the update becomes a no-op.
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("victim")).unwrap();
        ctrl.sync_document("doc-1").await.unwrap();

        // Amy edits locally while bob's delete is already upstream
        ctrl.apply_local_operation(
            "doc-1",
            LocalEdit::new(
                OperationKind::Update,
                TargetRef::field("victim", "label"),
                json!("renamed"),
            ),
        )
        .unwrap();
        remote_op(
            &server,
            100,
            "bob",
            OperationKind::Delete,
            TargetRef::node("victim"),
            json!({}),
        );

        ctrl.sync_document("doc-1").await.unwrap();

        let state = ctrl.get_document_state("doc-1").unwrap();
        assert!(!state.contains_node("victim"));
        // Settled by the engine and audited; nothing left open
        assert!(ctrl.active_conflicts().is_empty());
        assert_eq!(ctrl.conflict_stats().resolved, 1);
    }

    #[tokio::test]
    async fn test_reapplied_remote_operation_is_noop() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        remote_op(
            &server,
            1,
            "bob",
            OperationKind::Insert,
            TargetRef::node("n1"),
            json!({ "attrs": {} }),
        );

        ctrl.sync_document("doc-1").await.unwrap();
        let v1 = ctrl.get_document_state("doc-1").unwrap().version;

        // The server re-delivers its whole log; applied ids are skipped
        server.redeliver_all.store(true, Ordering::SeqCst);
        ctrl.sync_document("doc-1").await.unwrap();
        assert_eq!(ctrl.get_document_state("doc-1").unwrap().version, v1);
    }

    #[tokio::test]
    async fn test_cleanup_discards_pending_and_cancels() {
        let server = FakeServer::with_document("doc-1");
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        ctrl.cleanup_document("doc-1");

        assert!(ctrl.get_document_state("doc-1").is_none());
        let err = ctrl.sync_document("doc-1").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));

        // Re-initialization is allowed after cleanup
        ctrl.initialize_document("doc-1").await.unwrap();
    }

    #[tokio::test]
    async fn test_failure_in_one_document_leaves_others_alone() {
        let server = FakeServer::with_document("doc-1");
        lock(&server.log).insert("doc-2".to_string(), Vec::new());
        let ctrl = controller(&server, "amy");
        ctrl.initialize_document("doc-1").await.unwrap();
        ctrl.initialize_document("doc-2").await.unwrap();

        ctrl.apply_local_operation("doc-1", insert_edit("n1")).unwrap();
        server.fail_next_transmits(100);
        let _ = ctrl.sync_document("doc-1").await;
        server.fail_next_transmits(0);

        // doc-2 still syncs fine
        ctrl.apply_local_operation("doc-2", insert_edit("x")).unwrap();
        ctrl.sync_document("doc-2").await.unwrap();
        assert!(ctrl.is_stale("doc-1"));
        assert!(!ctrl.is_stale("doc-2"));
    }
}
