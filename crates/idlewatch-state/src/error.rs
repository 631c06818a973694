//! Error types for the idlewatch state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
///
/// Every variant is a persistence failure from the caller's point of view:
/// the engine aborts the affected instance for the current pass and never
/// substitutes a guessed record.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    /// A second unresolved decision would have been written for one instance.
    #[error("instance {instance} already has unresolved decision {existing}")]
    UnresolvedDecisionExists { instance: String, existing: String },
}
