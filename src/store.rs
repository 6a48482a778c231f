use alloy::primitives::Address;
use async_trait::async_trait;

use crate::types::{
    ConfirmationRecord, ManagedTransaction, ReceiptRecord, TransactionCompletion,
    TransactionHistoryRecord, TransactionUpdate,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("sql error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("duplicate key {0}")]
    Duplicate(String),

    #[error("record {0} not found")]
    NotFound(String),
}

impl From<redb::DatabaseError> for StoreError {
    fn from(err: redb::DatabaseError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<redb::TransactionError> for StoreError {
    fn from(err: redb::TransactionError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<redb::TableError> for StoreError {
    fn from(err: redb::TableError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::Database(err.to_string())
    }
}

impl From<redb::CommitError> for StoreError {
    fn from(err: redb::CommitError) -> Self {
        StoreError::Database(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// Durable CRUD over transaction records, ordered by `(signer, nonce)`.
///
/// The core only ever talks to this interface; the embedded and relational
/// adapters implement it with identical caller-observable semantics.
#[async_trait]
pub trait TransactionStore: Send + Sync + 'static {
    async fn get_transaction(&self, id: &str) -> Result<Option<ManagedTransaction>, StoreError>;

    /// List a signer's transactions ordered by nonce. `after` is exclusive:
    /// ascending lists nonces above it, descending lists nonces below it.
    async fn list_transactions_by_nonce(
        &self,
        signer: Address,
        after: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> Result<Vec<ManagedTransaction>, StoreError>;

    /// Highest persisted nonce for a signer, if any.
    async fn highest_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError>;

    async fn get_receipt(&self, tx_id: &str) -> Result<Option<ReceiptRecord>, StoreError>;

    async fn list_confirmations(&self, tx_id: &str)
        -> Result<Vec<ConfirmationRecord>, StoreError>;

    async fn list_history(&self, tx_id: &str)
        -> Result<Vec<TransactionHistoryRecord>, StoreError>;

    async fn get_completion(&self, tx_id: &str)
        -> Result<Option<TransactionCompletion>, StoreError>;

    /// Open one logical store transaction. Everything done through the
    /// returned group commits atomically or not at all; dropping the group
    /// without committing rolls it back.
    async fn begin_group(&self) -> Result<Box<dyn StoreGroup>, StoreError>;
}

/// One grouped store transaction.
#[async_trait]
pub trait StoreGroup: Send {
    async fn get_transaction(&mut self, id: &str)
        -> Result<Option<ManagedTransaction>, StoreError>;

    async fn highest_nonce(&mut self, signer: Address) -> Result<Option<u64>, StoreError>;

    /// Bulk insert. Fails with [`StoreError::Duplicate`] (embedded) or a
    /// constraint violation (relational) when an ID already exists.
    async fn insert_transactions(&mut self, txs: &[ManagedTransaction]) -> Result<(), StoreError>;

    async fn update_transaction(
        &mut self,
        id: &str,
        update: &TransactionUpdate,
    ) -> Result<(), StoreError>;

    async fn insert_receipts(&mut self, receipts: &[ReceiptRecord]) -> Result<(), StoreError>;

    async fn upsert_receipt(&mut self, receipt: &ReceiptRecord) -> Result<(), StoreError>;

    async fn delete_receipt(&mut self, tx_id: &str) -> Result<(), StoreError>;

    async fn insert_confirmations(
        &mut self,
        records: &[ConfirmationRecord],
    ) -> Result<(), StoreError>;

    async fn delete_confirmations(&mut self, tx_id: &str) -> Result<(), StoreError>;

    async fn insert_history(
        &mut self,
        records: &[TransactionHistoryRecord],
    ) -> Result<(), StoreError>;

    async fn delete_history(&mut self, tx_id: &str) -> Result<(), StoreError>;

    /// Fold runs of identical history actions for one transaction into
    /// single records carrying a count.
    async fn compress_history(&mut self, tx_id: &str) -> Result<(), StoreError>;

    async fn insert_completions(
        &mut self,
        records: &[TransactionCompletion],
    ) -> Result<(), StoreError>;

    async fn delete_transaction(&mut self, id: &str) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Shared compaction fold used by the store adapters: merge consecutive
/// records with the same action, summing counts.
pub(crate) fn fold_history(
    records: Vec<TransactionHistoryRecord>,
) -> Vec<TransactionHistoryRecord> {
    let mut folded: Vec<TransactionHistoryRecord> = Vec::with_capacity(records.len());
    for record in records {
        match folded.last_mut() {
            Some(prev) if prev.action == record.action => {
                prev.count += record.count;
                prev.last_occurrence = prev.last_occurrence.max(record.last_occurrence);
            }
            _ => folded.push(record),
        }
    }
    folded
}
