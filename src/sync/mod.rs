//! Sync layer: transport contract, retry policy, and the per-document
//! synchronization controller.

pub mod backoff;
pub mod controller;
pub mod transport;

pub use backoff::BackoffPolicy;
pub use controller::{LocalEdit, SyncController, SyncControllerConfig, SyncEvent};
pub use transport::{
    AckBatch, ChannelMessage, CommittedLog, DocumentStore, MessageKind, RemoteBatch, SyncTransport,
};
