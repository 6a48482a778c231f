//! Durable nonce assignment and transaction persistence.
//!
//! Accepts transaction submissions, assigns each a gapless per-signer nonce
//! reconciled across an in-memory cache, the local store, and the chain, and
//! tracks the record's lifecycle. Two interchangeable backends:
//! [`KvPersistence`] over an embedded ordered key-value store and
//! [`SqlPersistence`] over a relational store with a batching write pipeline.

pub mod config;
pub mod error;
pub mod kv;
mod meta;
mod nonce;
pub mod sql;
pub mod store;
pub mod types;

use std::future::Future;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::sync::oneshot;

pub use config::PersistenceOptions;
pub use error::PersistenceError;
pub use kv::{KvPersistence, KvTransactionStore};
pub use sql::writer::{TransactionOperation, TransactionWriter};
pub use sql::{SqlPersistence, SqlTransactionStore};
pub use store::{SortDirection, StoreError, StoreGroup, TransactionStore};
pub use types::{
    ConfirmationRecord, ManagedTransaction, ReceiptRecord, TransactionCompletion,
    TransactionHistoryRecord, TransactionStatus, TransactionUpdate, TxHistoryAction,
};

/// Queries the chain for a signer's next nonce, conventionally the "pending"
/// transaction count. Supplied by the host; errors pass through to the
/// caller unchanged.
pub type NextNonceCallback =
    Arc<dyn Fn(Address) -> BoxFuture<'static, Result<u64, PersistenceError>> + Send + Sync>;

/// Wrap a plain async closure as a [`NextNonceCallback`].
pub fn next_nonce_callback<F, Fut>(f: F) -> NextNonceCallback
where
    F: Fn(Address) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<u64, PersistenceError>> + Send + 'static,
{
    Arc::new(move |signer| Box::pin(f(signer)))
}

/// What a completed operation reports back on its completion channel.
#[derive(Debug, Clone)]
pub enum OpOutcome {
    Done,
    NonceAssigned(u64),
}

pub(crate) type OpResult = Result<OpOutcome, PersistenceError>;

/// Flushable handle over a queued write operation's completion channel.
///
/// Each operation carries a single-use channel: the writer signals it exactly
/// once, and senders never block. If the writer goes away without signalling
/// (shutdown discarded the queue), flushing reports
/// [`PersistenceError::ShuttingDown`] rather than hanging.
pub struct WriteOp {
    op_id: String,
    done: oneshot::Receiver<OpResult>,
}

impl WriteOp {
    pub(crate) fn channel(op_id: String) -> (oneshot::Sender<OpResult>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { op_id, done: rx })
    }

    /// An already-completed operation, used by the direct-write backend.
    pub(crate) fn ready(op_id: String, result: OpResult) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { op_id, done: rx }
    }

    pub fn id(&self) -> &str {
        &self.op_id
    }

    /// Await the operation's terminal state.
    pub async fn flush(self) -> Result<OpOutcome, PersistenceError> {
        match self.done.await {
            Ok(result) => {
                tracing::debug!(
                    op_id = %self.op_id,
                    ok = result.is_ok(),
                    "Flushed write operation"
                );
                result
            }
            Err(_) => Err(PersistenceError::ShuttingDown),
        }
    }
}

/// The host-facing persistence API, implemented identically by both
/// backends.
#[async_trait]
pub trait TransactionPersistence: Send + Sync {
    /// Assign the next nonce for `tx.from` and persist the transaction. On
    /// success the returned record carries the assigned nonce, and a
    /// `NonceAssigned` history event is appended outside the nonce slot.
    async fn insert_transaction_with_next_nonce(
        &self,
        tx: ManagedTransaction,
        next_nonce: NextNonceCallback,
    ) -> Result<ManagedTransaction, PersistenceError>;

    async fn get_transaction_by_id(
        &self,
        id: &str,
    ) -> Result<Option<ManagedTransaction>, PersistenceError>;

    async fn list_transactions_by_nonce(
        &self,
        signer: Address,
        after: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> Result<Vec<ManagedTransaction>, PersistenceError>;

    async fn get_transaction_receipt(
        &self,
        tx_id: &str,
    ) -> Result<Option<ReceiptRecord>, PersistenceError>;

    async fn list_confirmations(
        &self,
        tx_id: &str,
    ) -> Result<Vec<ConfirmationRecord>, PersistenceError>;

    async fn list_history(
        &self,
        tx_id: &str,
    ) -> Result<Vec<TransactionHistoryRecord>, PersistenceError>;

    async fn get_transaction_completion(
        &self,
        tx_id: &str,
    ) -> Result<Option<TransactionCompletion>, PersistenceError>;

    async fn update_transaction(&self, tx_id: &str, update: TransactionUpdate) -> WriteOp;

    async fn delete_transaction(&self, tx_id: &str) -> WriteOp;

    async fn set_transaction_receipt(&self, tx_id: &str, receipt: ReceiptRecord) -> WriteOp;

    async fn add_confirmation(
        &self,
        tx_id: &str,
        confirmation: ConfirmationRecord,
        clear_existing: bool,
    ) -> WriteOp;

    async fn add_history_event(&self, record: TransactionHistoryRecord) -> WriteOp;

    /// Orderly shutdown: drain in-flight work, then refuse new operations.
    async fn stop(&self);
}
