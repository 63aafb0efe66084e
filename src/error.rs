//! Error taxonomy for the sync core
//!
//! Every fallible operation in the crate returns [`Result`]. Errors are
//! recoverable at the document-session level: a failure in one document's
//! pipeline never poisons other sessions.

use thiserror::Error;

/// Crate-wide error type
#[derive(Error, Debug)]
pub enum SyncError {
    /// Document, branch, commit or merge request does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// A document state for this id is already initialized
    #[error("Document '{0}' is already initialized")]
    ConflictState(String),

    /// Operation cannot be applied to the current document state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Illegal state-machine transition
    #[error("Invalid state transition: {0}")]
    InvalidState(String),

    /// Conflict id is not tracked by the resolver
    #[error("Unknown conflict: {0}")]
    UnknownConflict(String),

    /// Resolution strategy is incompatible with the conflict's operations
    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    /// Network or timeout failure on the transport boundary
    #[error("Transport error: {0}")]
    Transport(String),

    /// Branch name collides within the same document
    #[error("Duplicate branch name: {0}")]
    DuplicateName(String),

    /// Branch id does not exist
    #[error("Branch '{0}' not found")]
    BranchNotFound(String),

    /// Merge produced unresolved conflicts; both chains left untouched
    #[error("Merge blocked by {count} unresolved conflict(s)")]
    MergeBlocked { count: usize },

    /// Payload could not be serialized or deserialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias using [`SyncError`]
pub type Result<T> = std::result::Result<T, SyncError>;
