//! Relational backend: a SQLite store behind the batching write pipeline.

pub mod writer;

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};

use crate::config::PersistenceOptions;
use crate::error::PersistenceError;
use crate::store::{fold_history, SortDirection, StoreError, StoreGroup, TransactionStore};
use crate::types::{
    ConfirmationRecord, ManagedTransaction, ReceiptRecord, TransactionCompletion,
    TransactionHistoryRecord, TransactionStatus, TransactionUpdate, TxHistoryAction,
};
use crate::{
    NextNonceCallback, OpOutcome, TransactionPersistence, WriteOp,
};

use writer::{TransactionOperation, TransactionWriter};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS transactions (
        id TEXT PRIMARY KEY,
        from_address TEXT NOT NULL,
        nonce INTEGER,
        status TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        first_submit INTEGER,
        last_submit INTEGER,
        transaction_hash TEXT,
        gas_price TEXT,
        gas_limit INTEGER,
        transaction_data TEXT NOT NULL,
        error_message TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_transactions_signer_nonce
        ON transactions(from_address, nonce)",
    "CREATE TABLE IF NOT EXISTS receipts (
        transaction_id TEXT PRIMARY KEY,
        block_number INTEGER NOT NULL,
        block_hash TEXT NOT NULL,
        transaction_index INTEGER NOT NULL,
        success INTEGER NOT NULL,
        extra_info TEXT,
        received_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS confirmations (
        id TEXT PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        block_hash TEXT NOT NULL,
        parent_hash TEXT NOT NULL,
        confirmed_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_confirmations_tx ON confirmations(transaction_id)",
    "CREATE TABLE IF NOT EXISTS tx_history (
        id TEXT PRIMARY KEY,
        transaction_id TEXT NOT NULL,
        action TEXT NOT NULL,
        occurred_at INTEGER NOT NULL,
        last_occurrence INTEGER NOT NULL,
        count INTEGER NOT NULL,
        info TEXT,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_history_tx_time ON tx_history(transaction_id, occurred_at)",
    "CREATE TABLE IF NOT EXISTS tx_completions (
        transaction_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        completed_at INTEGER NOT NULL
    )",
];

const TRANSACTION_COLUMNS: &str = "id, from_address, nonce, status, created_at, updated_at, \
     first_submit, last_submit, transaction_hash, gas_price, gas_limit, transaction_data, \
     error_message";

fn transaction_from_row(row: &SqliteRow) -> Result<ManagedTransaction, StoreError> {
    let from_address: String = row.try_get("from_address")?;
    let from = Address::from_str(&from_address)
        .map_err(|err| StoreError::Database(format!("bad address {from_address}: {err}")))?;
    let status_text: String = row.try_get("status")?;
    let status = TransactionStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Database(format!("bad status {status_text}")))?;
    let nonce: Option<i64> = row.try_get("nonce")?;
    let transaction_hash: Option<String> = row.try_get("transaction_hash")?;
    let transaction_hash = transaction_hash
        .map(|text| B256::from_str(&text))
        .transpose()
        .map_err(|err| StoreError::Database(format!("bad transaction hash: {err}")))?;
    let gas_price: Option<String> = row.try_get("gas_price")?;
    let gas_price = gas_price
        .map(|text| U256::from_str(&text))
        .transpose()
        .map_err(|err| StoreError::Database(format!("bad gas price: {err}")))?;
    let gas_limit: Option<i64> = row.try_get("gas_limit")?;
    let transaction_data: String = row.try_get("transaction_data")?;
    let transaction_data = Bytes::from_str(&transaction_data)
        .map_err(|err| StoreError::Database(format!("bad transaction data: {err}")))?;
    Ok(ManagedTransaction {
        id: row.try_get("id")?,
        from,
        nonce: nonce.map(|value| value as u64),
        status,
        created_at: row.try_get::<i64, _>("created_at")? as u64,
        updated_at: row.try_get::<i64, _>("updated_at")? as u64,
        first_submit: row
            .try_get::<Option<i64>, _>("first_submit")?
            .map(|value| value as u64),
        last_submit: row
            .try_get::<Option<i64>, _>("last_submit")?
            .map(|value| value as u64),
        transaction_hash,
        gas_price,
        gas_limit: gas_limit.map(|value| value as u64),
        transaction_data,
        error_message: row.try_get("error_message")?,
    })
}

fn receipt_from_row(row: &SqliteRow) -> Result<ReceiptRecord, StoreError> {
    let block_hash: String = row.try_get("block_hash")?;
    let extra_info: Option<String> = row.try_get("extra_info")?;
    Ok(ReceiptRecord {
        transaction_id: row.try_get("transaction_id")?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: B256::from_str(&block_hash)
            .map_err(|err| StoreError::Database(format!("bad block hash: {err}")))?,
        transaction_index: row.try_get::<i64, _>("transaction_index")? as u64,
        success: row.try_get::<i64, _>("success")? != 0,
        extra_info: extra_info
            .map(|text| serde_json::from_str(&text))
            .transpose()?,
        received_at: row.try_get::<i64, _>("received_at")? as u64,
    })
}

fn confirmation_from_row(row: &SqliteRow) -> Result<ConfirmationRecord, StoreError> {
    let block_hash: String = row.try_get("block_hash")?;
    let parent_hash: String = row.try_get("parent_hash")?;
    Ok(ConfirmationRecord {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        block_number: row.try_get::<i64, _>("block_number")? as u64,
        block_hash: B256::from_str(&block_hash)
            .map_err(|err| StoreError::Database(format!("bad block hash: {err}")))?,
        parent_hash: B256::from_str(&parent_hash)
            .map_err(|err| StoreError::Database(format!("bad parent hash: {err}")))?,
        confirmed_at: row.try_get::<i64, _>("confirmed_at")? as u64,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<TransactionHistoryRecord, StoreError> {
    let action_text: String = row.try_get("action")?;
    let action = TxHistoryAction::parse(&action_text)
        .ok_or_else(|| StoreError::Database(format!("bad history action {action_text}")))?;
    let info: Option<String> = row.try_get("info")?;
    let error: Option<String> = row.try_get("error")?;
    Ok(TransactionHistoryRecord {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        action,
        occurred_at: row.try_get::<i64, _>("occurred_at")? as u64,
        last_occurrence: row.try_get::<i64, _>("last_occurrence")? as u64,
        count: row.try_get::<i64, _>("count")? as u64,
        info: info.map(|text| serde_json::from_str(&text)).transpose()?,
        error: error.map(|text| serde_json::from_str(&text)).transpose()?,
    })
}

fn completion_from_row(row: &SqliteRow) -> Result<TransactionCompletion, StoreError> {
    let status_text: String = row.try_get("status")?;
    let status = TransactionStatus::parse(&status_text)
        .ok_or_else(|| StoreError::Database(format!("bad status {status_text}")))?;
    Ok(TransactionCompletion {
        transaction_id: row.try_get("transaction_id")?,
        status,
        completed_at: row.try_get::<i64, _>("completed_at")? as u64,
    })
}

async fn fetch_transaction<'e, E>(
    executor: E,
    id: &str,
) -> Result<Option<ManagedTransaction>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(executor).await?;
    row.map(|row| transaction_from_row(&row)).transpose()
}

async fn fetch_highest_nonce<'e, E>(executor: E, signer: Address) -> Result<Option<u64>, StoreError>
where
    E: sqlx::Executor<'e, Database = Sqlite>,
{
    let row = sqlx::query("SELECT MAX(nonce) AS max_nonce FROM transactions WHERE from_address = ?")
        .bind(format!("{signer:#x}"))
        .fetch_one(executor)
        .await?;
    let max: Option<i64> = row.try_get("max_nonce")?;
    Ok(max.map(|value| value as u64))
}

async fn insert_transaction_row(
    txn: &mut Transaction<'static, Sqlite>,
    tx: &ManagedTransaction,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO transactions (id, from_address, nonce, status, created_at, updated_at, \
         first_submit, last_submit, transaction_hash, gas_price, gas_limit, transaction_data, \
         error_message) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&tx.id)
    .bind(format!("{:#x}", tx.from))
    .bind(tx.nonce.map(|nonce| nonce as i64))
    .bind(tx.status.as_str())
    .bind(tx.created_at as i64)
    .bind(tx.updated_at as i64)
    .bind(tx.first_submit.map(|at| at as i64))
    .bind(tx.last_submit.map(|at| at as i64))
    .bind(tx.transaction_hash.map(|hash| hash.to_string()))
    .bind(tx.gas_price.map(|price| price.to_string()))
    .bind(tx.gas_limit.map(|gas| gas as i64))
    .bind(tx.transaction_data.to_string())
    .bind(&tx.error_message)
    .execute(&mut **txn)
    .await?;
    Ok(())
}

async fn insert_history_row(
    txn: &mut Transaction<'static, Sqlite>,
    record: &TransactionHistoryRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO tx_history (id, transaction_id, action, occurred_at, last_occurrence, \
         count, info, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&record.id)
    .bind(&record.transaction_id)
    .bind(record.action.as_str())
    .bind(record.occurred_at as i64)
    .bind(record.last_occurrence as i64)
    .bind(record.count as i64)
    .bind(record.info.as_ref().map(|info| info.to_string()))
    .bind(record.error.as_ref().map(|error| error.to_string()))
    .execute(&mut **txn)
    .await?;
    Ok(())
}

/// Transaction store over a SQLite pool. The schema is bootstrapped on
/// connect; the `(from_address, nonce)` unique index backs the per-signer
/// nonce invariant at the storage level.
pub struct SqlTransactionStore {
    pool: SqlitePool,
}

impl SqlTransactionStore {
    pub async fn connect(db_path: &str) -> Result<Self, StoreError> {
        if !Path::new(db_path).exists() {
            std::fs::File::create(db_path).map_err(|err| {
                StoreError::Database(format!("failed to create database file {db_path}: {err}"))
            })?;
        }
        // One connection: SQLite has a single writer, and a grouped
        // transaction that reads before writing cannot upgrade a stale
        // snapshot taken while another pooled connection was committing.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .after_connect(|conn, _meta| {
                Box::pin(async move {
                    sqlx::query("PRAGMA journal_mode=WAL;")
                        .execute(&mut *conn)
                        .await?;
                    sqlx::query("PRAGMA synchronous=NORMAL;")
                        .execute(&mut *conn)
                        .await?;
                    Ok(())
                })
            })
            .connect(&format!("sqlite://{db_path}"))
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("Database schema initialized");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl TransactionStore for SqlTransactionStore {
    async fn get_transaction(&self, id: &str) -> Result<Option<ManagedTransaction>, StoreError> {
        fetch_transaction(&self.pool, id).await
    }

    async fn list_transactions_by_nonce(
        &self,
        signer: Address,
        after: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> Result<Vec<ManagedTransaction>, StoreError> {
        let mut sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions \
             WHERE from_address = ? AND nonce IS NOT NULL"
        );
        if after.is_some() {
            sql.push_str(match dir {
                SortDirection::Ascending => " AND nonce > ?",
                SortDirection::Descending => " AND nonce < ?",
            });
        }
        sql.push_str(match dir {
            SortDirection::Ascending => " ORDER BY nonce ASC LIMIT ?",
            SortDirection::Descending => " ORDER BY nonce DESC LIMIT ?",
        });

        let mut query = sqlx::query(&sql).bind(format!("{signer:#x}"));
        if let Some(nonce) = after {
            query = query.bind(nonce as i64);
        }
        let rows = query
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn highest_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError> {
        fetch_highest_nonce(&self.pool, signer).await
    }

    async fn get_receipt(&self, tx_id: &str) -> Result<Option<ReceiptRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT transaction_id, block_number, block_hash, transaction_index, success, \
             extra_info, received_at FROM receipts WHERE transaction_id = ?",
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| receipt_from_row(&row)).transpose()
    }

    async fn list_confirmations(
        &self,
        tx_id: &str,
    ) -> Result<Vec<ConfirmationRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, transaction_id, block_number, block_hash, parent_hash, confirmed_at \
             FROM confirmations WHERE transaction_id = ? ORDER BY confirmed_at, id",
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(confirmation_from_row).collect()
    }

    async fn list_history(
        &self,
        tx_id: &str,
    ) -> Result<Vec<TransactionHistoryRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, transaction_id, action, occurred_at, last_occurrence, count, info, error \
             FROM tx_history WHERE transaction_id = ? ORDER BY occurred_at, id",
        )
        .bind(tx_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(history_from_row).collect()
    }

    async fn get_completion(
        &self,
        tx_id: &str,
    ) -> Result<Option<TransactionCompletion>, StoreError> {
        let row = sqlx::query(
            "SELECT transaction_id, status, completed_at FROM tx_completions \
             WHERE transaction_id = ?",
        )
        .bind(tx_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| completion_from_row(&row)).transpose()
    }

    async fn begin_group(&self) -> Result<Box<dyn StoreGroup>, StoreError> {
        let txn = self.pool.begin().await?;
        Ok(Box::new(SqlGroup { txn }))
    }
}

struct SqlGroup {
    txn: Transaction<'static, Sqlite>,
}

#[async_trait]
impl StoreGroup for SqlGroup {
    async fn get_transaction(
        &mut self,
        id: &str,
    ) -> Result<Option<ManagedTransaction>, StoreError> {
        fetch_transaction(&mut *self.txn, id).await
    }

    async fn highest_nonce(&mut self, signer: Address) -> Result<Option<u64>, StoreError> {
        fetch_highest_nonce(&mut *self.txn, signer).await
    }

    async fn insert_transactions(&mut self, txs: &[ManagedTransaction]) -> Result<(), StoreError> {
        for tx in txs {
            insert_transaction_row(&mut self.txn, tx).await?;
        }
        Ok(())
    }

    async fn update_transaction(
        &mut self,
        id: &str,
        update: &TransactionUpdate,
    ) -> Result<(), StoreError> {
        let mut tx = match fetch_transaction(&mut *self.txn, id).await? {
            Some(tx) => tx,
            None => return Err(StoreError::NotFound(id.to_string())),
        };
        update.apply(&mut tx);
        sqlx::query(
            "UPDATE transactions SET status = ?, updated_at = ?, first_submit = ?, \
             last_submit = ?, transaction_hash = ?, gas_price = ?, gas_limit = ?, \
             transaction_data = ?, error_message = ? WHERE id = ?",
        )
        .bind(tx.status.as_str())
        .bind(tx.updated_at as i64)
        .bind(tx.first_submit.map(|at| at as i64))
        .bind(tx.last_submit.map(|at| at as i64))
        .bind(tx.transaction_hash.map(|hash| hash.to_string()))
        .bind(tx.gas_price.map(|price| price.to_string()))
        .bind(tx.gas_limit.map(|gas| gas as i64))
        .bind(tx.transaction_data.to_string())
        .bind(&tx.error_message)
        .bind(id)
        .execute(&mut *self.txn)
        .await?;
        Ok(())
    }

    async fn insert_receipts(&mut self, receipts: &[ReceiptRecord]) -> Result<(), StoreError> {
        for receipt in receipts {
            sqlx::query(
                "INSERT INTO receipts (transaction_id, block_number, block_hash, \
                 transaction_index, success, extra_info, received_at) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&receipt.transaction_id)
            .bind(receipt.block_number as i64)
            .bind(receipt.block_hash.to_string())
            .bind(receipt.transaction_index as i64)
            .bind(receipt.success as i64)
            .bind(receipt.extra_info.as_ref().map(|info| info.to_string()))
            .bind(receipt.received_at as i64)
            .execute(&mut *self.txn)
            .await?;
        }
        Ok(())
    }

    async fn upsert_receipt(&mut self, receipt: &ReceiptRecord) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO receipts (transaction_id, block_number, block_hash, transaction_index, \
             success, extra_info, received_at) VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(transaction_id) DO UPDATE SET \
             block_number = excluded.block_number, block_hash = excluded.block_hash, \
             transaction_index = excluded.transaction_index, success = excluded.success, \
             extra_info = excluded.extra_info, received_at = excluded.received_at",
        )
        .bind(&receipt.transaction_id)
        .bind(receipt.block_number as i64)
        .bind(receipt.block_hash.to_string())
        .bind(receipt.transaction_index as i64)
        .bind(receipt.success as i64)
        .bind(receipt.extra_info.as_ref().map(|info| info.to_string()))
        .bind(receipt.received_at as i64)
        .execute(&mut *self.txn)
        .await?;
        Ok(())
    }

    async fn delete_receipt(&mut self, tx_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM receipts WHERE transaction_id = ?")
            .bind(tx_id)
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn insert_confirmations(
        &mut self,
        records: &[ConfirmationRecord],
    ) -> Result<(), StoreError> {
        for record in records {
            sqlx::query(
                "INSERT INTO confirmations (id, transaction_id, block_number, block_hash, \
                 parent_hash, confirmed_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&record.transaction_id)
            .bind(record.block_number as i64)
            .bind(record.block_hash.to_string())
            .bind(record.parent_hash.to_string())
            .bind(record.confirmed_at as i64)
            .execute(&mut *self.txn)
            .await?;
        }
        Ok(())
    }

    async fn delete_confirmations(&mut self, tx_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM confirmations WHERE transaction_id = ?")
            .bind(tx_id)
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn insert_history(
        &mut self,
        records: &[TransactionHistoryRecord],
    ) -> Result<(), StoreError> {
        for record in records {
            insert_history_row(&mut self.txn, record).await?;
        }
        Ok(())
    }

    async fn delete_history(&mut self, tx_id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM tx_history WHERE transaction_id = ?")
            .bind(tx_id)
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn compress_history(&mut self, tx_id: &str) -> Result<(), StoreError> {
        let rows = sqlx::query(
            "SELECT id, transaction_id, action, occurred_at, last_occurrence, count, info, error \
             FROM tx_history WHERE transaction_id = ? ORDER BY occurred_at, id",
        )
        .bind(tx_id)
        .fetch_all(&mut *self.txn)
        .await?;
        let records: Vec<TransactionHistoryRecord> =
            rows.iter().map(history_from_row).collect::<Result<_, _>>()?;
        let before = records.len();
        let folded = fold_history(records);
        if folded.len() == before {
            return Ok(());
        }
        sqlx::query("DELETE FROM tx_history WHERE transaction_id = ?")
            .bind(tx_id)
            .execute(&mut *self.txn)
            .await?;
        for record in &folded {
            insert_history_row(&mut self.txn, record).await?;
        }
        Ok(())
    }

    async fn insert_completions(
        &mut self,
        records: &[TransactionCompletion],
    ) -> Result<(), StoreError> {
        for record in records {
            sqlx::query(
                "INSERT INTO tx_completions (transaction_id, status, completed_at) \
                 VALUES (?, ?, ?) ON CONFLICT(transaction_id) DO UPDATE SET \
                 status = excluded.status, completed_at = excluded.completed_at",
            )
            .bind(&record.transaction_id)
            .bind(record.status.as_str())
            .bind(record.completed_at as i64)
            .execute(&mut *self.txn)
            .await?;
        }
        Ok(())
    }

    async fn delete_transaction(&mut self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM transactions WHERE id = ?")
            .bind(id)
            .execute(&mut *self.txn)
            .await?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.commit().await?;
        Ok(())
    }
}

/// Relational-backend persistence: all writes flow through the batching
/// worker pool, which serializes nonce assignment per signer by routing.
pub struct SqlPersistence {
    store: Arc<SqlTransactionStore>,
    writer: TransactionWriter,
}

impl SqlPersistence {
    pub fn new(store: Arc<SqlTransactionStore>, options: PersistenceOptions) -> Self {
        let writer = TransactionWriter::new(store.clone(), &options);
        Self { store, writer }
    }

    pub async fn connect(
        db_path: &str,
        options: PersistenceOptions,
    ) -> Result<Self, PersistenceError> {
        let store = Arc::new(SqlTransactionStore::connect(db_path).await?);
        Ok(Self::new(store, options))
    }

    pub fn store(&self) -> &Arc<SqlTransactionStore> {
        &self.store
    }

    pub fn writer(&self) -> &TransactionWriter {
        &self.writer
    }
}

#[async_trait]
impl TransactionPersistence for SqlPersistence {
    async fn insert_transaction_with_next_nonce(
        &self,
        mut tx: ManagedTransaction,
        next_nonce: NextNonceCallback,
    ) -> Result<ManagedTransaction, PersistenceError> {
        if tx.id.is_empty() {
            return Err(PersistenceError::InvalidOperation);
        }
        let (op, handle) = TransactionOperation::insert(tx.clone(), next_nonce);
        self.writer.queue(op).await;
        match handle.flush().await? {
            OpOutcome::NonceAssigned(nonce) => tx.nonce = Some(nonce),
            OpOutcome::Done => {}
        }

        if let Some(nonce) = tx.nonce {
            let record = TransactionHistoryRecord::new(&tx.id, TxHistoryAction::NonceAssigned)
                .with_info(serde_json::json!({ "nonce": nonce }));
            let (op, handle) = TransactionOperation::history(record);
            self.writer.queue(op).await;
            if let Err(err) = handle.flush().await {
                tracing::warn!(
                    tx_id = %tx.id,
                    error = %err,
                    "Failed to record nonce assignment history"
                );
            }
        }
        Ok(tx)
    }

    async fn get_transaction_by_id(
        &self,
        id: &str,
    ) -> Result<Option<ManagedTransaction>, PersistenceError> {
        Ok(self.store.get_transaction(id).await?)
    }

    async fn list_transactions_by_nonce(
        &self,
        signer: Address,
        after: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> Result<Vec<ManagedTransaction>, PersistenceError> {
        Ok(self
            .store
            .list_transactions_by_nonce(signer, after, limit, dir)
            .await?)
    }

    async fn get_transaction_receipt(
        &self,
        tx_id: &str,
    ) -> Result<Option<ReceiptRecord>, PersistenceError> {
        Ok(self.store.get_receipt(tx_id).await?)
    }

    async fn list_confirmations(
        &self,
        tx_id: &str,
    ) -> Result<Vec<ConfirmationRecord>, PersistenceError> {
        Ok(self.store.list_confirmations(tx_id).await?)
    }

    async fn list_history(
        &self,
        tx_id: &str,
    ) -> Result<Vec<TransactionHistoryRecord>, PersistenceError> {
        Ok(self.store.list_history(tx_id).await?)
    }

    async fn get_transaction_completion(
        &self,
        tx_id: &str,
    ) -> Result<Option<TransactionCompletion>, PersistenceError> {
        Ok(self.store.get_completion(tx_id).await?)
    }

    async fn update_transaction(&self, tx_id: &str, update: TransactionUpdate) -> WriteOp {
        let (op, handle) = TransactionOperation::update(tx_id, update);
        self.writer.queue(op).await;
        handle
    }

    async fn delete_transaction(&self, tx_id: &str) -> WriteOp {
        let (op, handle) = TransactionOperation::delete(tx_id);
        self.writer.queue(op).await;
        handle
    }

    async fn set_transaction_receipt(&self, tx_id: &str, receipt: ReceiptRecord) -> WriteOp {
        let (op, handle) = TransactionOperation::receipt(tx_id, receipt);
        self.writer.queue(op).await;
        handle
    }

    async fn add_confirmation(
        &self,
        tx_id: &str,
        confirmation: ConfirmationRecord,
        clear_existing: bool,
    ) -> WriteOp {
        let (op, handle) = TransactionOperation::confirmation(tx_id, confirmation, clear_existing);
        self.writer.queue(op).await;
        handle
    }

    async fn add_history_event(&self, record: TransactionHistoryRecord) -> WriteOp {
        let (op, handle) = TransactionOperation::history(record);
        self.writer.queue(op).await;
        handle
    }

    async fn stop(&self) {
        self.writer.stop().await;
    }
}
