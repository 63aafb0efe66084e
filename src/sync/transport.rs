//! Transport and persistence collaborator boundaries
//!
//! The core never opens sockets. It talks to a WebSocket-style channel
//! through [`SyncTransport`] and to the REST-style persistence surface
//! through [`DocumentStore`]; both are opaque request/response seams the
//! host wires up. Connection bootstrapping, authentication and framing
//! live on the other side of these traits.

use crate::error::Result;
use crate::operation::{Operation, OperationId};
use crate::{DocumentId, UserId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of messages on the realtime channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Join,
    Leave,
    Operation,
    Cursor,
    Selection,
    Lock,
    Unlock,
}

/// Envelope for every realtime channel message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub document_id: DocumentId,
    pub document_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub sender: UserId,
}

/// Server acknowledgment for a transmitted operation batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBatch {
    /// Ids now committed upstream
    pub acknowledged: Vec<OperationId>,
    /// Server version after the batch
    pub version: u64,
}

/// Operations produced by other participants since a known version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteBatch {
    pub operations: Vec<Operation>,
    pub version: u64,
}

/// The committed operation log for a document, as fetched on
/// initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommittedLog {
    pub operations: Vec<Operation>,
    pub version: u64,
}

/// WebSocket-style channel the sync controller transmits through
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Fire-and-forget channel message (presence, locks, membership)
    async fn send(&self, message: ChannelMessage) -> Result<()>;

    /// Transmit local operations; resolves once the server acknowledges
    async fn transmit_operations(
        &self,
        document_id: &str,
        operations: &[Operation],
    ) -> Result<AckBatch>;

    /// Pull operations from other participants since `version`
    async fn fetch_since(&self, document_id: &str, version: u64) -> Result<RemoteBatch>;
}

/// REST-style persistence collaborator
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch the committed log for a document; `None` if the document
    /// does not exist upstream
    async fn fetch_document(&self, document_id: &str) -> Result<Option<CommittedLog>>;
}
