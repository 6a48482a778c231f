use crate::store::StoreError;

/// Errors surfaced to callers of the persistence API.
///
/// Operations that fail inside a write batch all receive the same generic
/// [`PersistenceError::Persistence`] value; the underlying store error is
/// only logged. Conflicts and validation failures are per-operation and do
/// not fail the batch they arrived in.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PersistenceError {
    #[error("duplicate transaction ID {0}")]
    DuplicateTransactionId(String),

    #[error("transaction operation has no routing key")]
    InvalidOperation,

    #[error("transaction writer is shutting down")]
    ShuttingDown,

    #[error("operation cancelled")]
    Cancelled,

    #[error("transaction {0} not found")]
    NotFound(String),

    #[error("transaction persistence failed: {0}")]
    Persistence(String),

    #[error("next nonce callback failed: {0}")]
    NonceCallback(String),
}

impl From<StoreError> for PersistenceError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => PersistenceError::NotFound(id),
            other => PersistenceError::Persistence(other.to_string()),
        }
    }
}
