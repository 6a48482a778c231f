//! Embedded backend: an ordered key-value store with direct writes and a
//! wait/notify per-signer serializer.

mod nonces;

use std::path::Path;
use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;
use nanoid::nanoid;
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};

use crate::config::PersistenceOptions;
use crate::error::PersistenceError;
use crate::meta::TxMetadataCache;
use crate::nonce::NonceOracle;
use crate::store::{fold_history, SortDirection, StoreError, StoreGroup, TransactionStore};
use crate::types::{
    ConfirmationRecord, ManagedTransaction, ReceiptRecord, TransactionCompletion,
    TransactionHistoryRecord, TransactionUpdate, TxHistoryAction,
};
use crate::{NextNonceCallback, OpOutcome, TransactionPersistence, WriteOp};

use nonces::SignerLocks;

const TRANSACTIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("transactions");
const NONCE_INDEX: TableDefinition<&str, &str> = TableDefinition::new("nonce_index"); // "{from}/{nonce:020}" -> id
const RECEIPTS: TableDefinition<&str, &[u8]> = TableDefinition::new("receipts");
const CONFIRMATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("confirmations"); // "{id}/{time:020}/{uid}"
const HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("tx_history"); // "{id}/{time:020}/{uid}"
const COMPLETIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("tx_completions");

fn k_nonce(signer: &Address, nonce: u64) -> String {
    format!("{signer:#x}/{nonce:020}")
}

fn k_signer_start(signer: &Address) -> String {
    format!("{signer:#x}/")
}

// ':' sorts just above '9', bounding the zero-padded numeric suffix.
fn k_signer_end(signer: &Address) -> String {
    format!("{signer:#x}/:")
}

fn k_entry(tx_id: &str, time: u64, uid: &str) -> String {
    format!("{tx_id}/{time:020}/{uid}")
}

fn k_tx_prefix(tx_id: &str) -> String {
    format!("{tx_id}/")
}

/// Transaction store over a single embedded database file. Records are
/// stored as JSON; a separate index table keyed by zero-padded nonce keeps
/// each signer's transactions in nonce order for range scans.
pub struct KvTransactionStore {
    db: Arc<Database>,
}

impl KvTransactionStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        // Ensure tables exist
        {
            let write = db.begin_write()?;
            {
                write.open_table(TRANSACTIONS)?;
                write.open_table(NONCE_INDEX)?;
                write.open_table(RECEIPTS)?;
                write.open_table(CONFIRMATIONS)?;
                write.open_table(HISTORY)?;
                write.open_table(COMPLETIONS)?;
            }
            write.commit()?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    fn scan_prefix<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        prefix: &str,
    ) -> Result<Vec<T>, StoreError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(table)?;
        let mut out = Vec::new();
        for entry in table.range(prefix..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix) {
                break;
            }
            out.push(serde_json::from_slice(value.value())?);
        }
        Ok(out)
    }

    fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let read = self.db.begin_read()?;
        let table = read.open_table(table)?;
        match table.get(key)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl TransactionStore for KvTransactionStore {
    async fn get_transaction(&self, id: &str) -> Result<Option<ManagedTransaction>, StoreError> {
        self.get_json(TRANSACTIONS, id)
    }

    async fn list_transactions_by_nonce(
        &self,
        signer: Address,
        after: Option<u64>,
        limit: usize,
        dir: SortDirection,
    ) -> Result<Vec<ManagedTransaction>, StoreError> {
        let (start, end) = match (dir, after) {
            (SortDirection::Ascending, Some(u64::MAX)) => return Ok(Vec::new()),
            (SortDirection::Ascending, Some(nonce)) => {
                (k_nonce(&signer, nonce + 1), k_signer_end(&signer))
            }
            (SortDirection::Descending, Some(nonce)) => {
                (k_signer_start(&signer), k_nonce(&signer, nonce))
            }
            (_, None) => (k_signer_start(&signer), k_signer_end(&signer)),
        };

        let read = self.db.begin_read()?;
        let index = read.open_table(NONCE_INDEX)?;
        let transactions = read.open_table(TRANSACTIONS)?;

        let ids: Vec<String> = {
            let range = index.range(start.as_str()..end.as_str())?;
            match dir {
                SortDirection::Ascending => range
                    .take(limit)
                    .map(|entry| entry.map(|(_, id)| id.value().to_string()))
                    .collect::<Result<_, _>>()?,
                SortDirection::Descending => range
                    .rev()
                    .take(limit)
                    .map(|entry| entry.map(|(_, id)| id.value().to_string()))
                    .collect::<Result<_, _>>()?,
            }
        };

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(value) = transactions.get(id.as_str())? {
                out.push(serde_json::from_slice(value.value())?);
            }
        }
        Ok(out)
    }

    async fn highest_nonce(&self, signer: Address) -> Result<Option<u64>, StoreError> {
        let start = k_signer_start(&signer);
        let end = k_signer_end(&signer);
        let read = self.db.begin_read()?;
        let index = read.open_table(NONCE_INDEX)?;
        let last = index.range(start.as_str()..end.as_str())?.next_back();
        match last {
            Some(entry) => {
                let (key, _) = entry?;
                let nonce = key.value()[start.len()..]
                    .parse::<u64>()
                    .map_err(|err| StoreError::Database(format!("bad nonce index key: {err}")))?;
                Ok(Some(nonce))
            }
            None => Ok(None),
        }
    }

    async fn get_receipt(&self, tx_id: &str) -> Result<Option<ReceiptRecord>, StoreError> {
        self.get_json(RECEIPTS, tx_id)
    }

    async fn list_confirmations(
        &self,
        tx_id: &str,
    ) -> Result<Vec<ConfirmationRecord>, StoreError> {
        self.scan_prefix(CONFIRMATIONS, &k_tx_prefix(tx_id))
    }

    async fn list_history(
        &self,
        tx_id: &str,
    ) -> Result<Vec<TransactionHistoryRecord>, StoreError> {
        self.scan_prefix(HISTORY, &k_tx_prefix(tx_id))
    }

    async fn get_completion(
        &self,
        tx_id: &str,
    ) -> Result<Option<TransactionCompletion>, StoreError> {
        self.get_json(COMPLETIONS, tx_id)
    }

    async fn begin_group(&self) -> Result<Box<dyn StoreGroup>, StoreError> {
        let txn = self.db.begin_write()?;
        Ok(Box::new(KvGroup { txn }))
    }
}

struct KvGroup {
    txn: WriteTransaction,
}

impl KvGroup {
    fn delete_prefix(
        &mut self,
        table: TableDefinition<'static, &'static str, &'static [u8]>,
        prefix: &str,
    ) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(table)?;
        let keys: Vec<String> = table
            .range(prefix..)?
            .take_while(|entry| {
                entry
                    .as_ref()
                    .map_or(false, |(key, _)| key.value().starts_with(prefix))
            })
            .map(|entry| entry.map(|(key, _)| key.value().to_string()))
            .collect::<Result<_, _>>()?;
        for key in keys {
            table.remove(key.as_str())?;
        }
        Ok(())
    }

    fn read_history(&self, tx_id: &str) -> Result<Vec<(String, TransactionHistoryRecord)>, StoreError> {
        let prefix = k_tx_prefix(tx_id);
        let table = self.txn.open_table(HISTORY)?;
        let mut out = Vec::new();
        for entry in table.range(prefix.as_str()..)? {
            let (key, value) = entry?;
            if !key.value().starts_with(prefix.as_str()) {
                break;
            }
            out.push((
                key.value().to_string(),
                serde_json::from_slice(value.value())?,
            ));
        }
        Ok(out)
    }
}

#[async_trait]
impl StoreGroup for KvGroup {
    async fn get_transaction(
        &mut self,
        id: &str,
    ) -> Result<Option<ManagedTransaction>, StoreError> {
        let table = self.txn.open_table(TRANSACTIONS)?;
        let result = match table.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        };
        result
    }

    async fn highest_nonce(&mut self, signer: Address) -> Result<Option<u64>, StoreError> {
        let start = k_signer_start(&signer);
        let end = k_signer_end(&signer);
        let index = self.txn.open_table(NONCE_INDEX)?;
        let result = match index.range(start.as_str()..end.as_str())?.next_back() {
            Some(entry) => {
                let (key, _) = entry?;
                let nonce = key.value()[start.len()..]
                    .parse::<u64>()
                    .map_err(|err| StoreError::Database(format!("bad nonce index key: {err}")))?;
                Ok(Some(nonce))
            }
            None => Ok(None),
        };
        result
    }

    async fn insert_transactions(&mut self, txs: &[ManagedTransaction]) -> Result<(), StoreError> {
        let mut transactions = self.txn.open_table(TRANSACTIONS)?;
        let mut index = self.txn.open_table(NONCE_INDEX)?;
        for tx in txs {
            if transactions.get(tx.id.as_str())?.is_some() {
                return Err(StoreError::Duplicate(tx.id.clone()));
            }
            let nonce = tx.nonce.ok_or_else(|| {
                StoreError::Database(format!("transaction {} has no nonce", tx.id))
            })?;
            let encoded = serde_json::to_vec(tx)?;
            transactions.insert(tx.id.as_str(), encoded.as_slice())?;
            index.insert(k_nonce(&tx.from, nonce).as_str(), tx.id.as_str())?;
        }
        Ok(())
    }

    async fn update_transaction(
        &mut self,
        id: &str,
        update: &TransactionUpdate,
    ) -> Result<(), StoreError> {
        let mut transactions = self.txn.open_table(TRANSACTIONS)?;
        let mut tx: ManagedTransaction = match transactions.get(id)? {
            Some(value) => serde_json::from_slice(value.value())?,
            None => return Err(StoreError::NotFound(id.to_string())),
        };
        update.apply(&mut tx);
        let encoded = serde_json::to_vec(&tx)?;
        transactions.insert(id, encoded.as_slice())?;
        Ok(())
    }

    async fn insert_receipts(&mut self, receipts: &[ReceiptRecord]) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(RECEIPTS)?;
        for receipt in receipts {
            if table.get(receipt.transaction_id.as_str())?.is_some() {
                return Err(StoreError::Duplicate(receipt.transaction_id.clone()));
            }
            let encoded = serde_json::to_vec(receipt)?;
            table.insert(receipt.transaction_id.as_str(), encoded.as_slice())?;
        }
        Ok(())
    }

    async fn upsert_receipt(&mut self, receipt: &ReceiptRecord) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(RECEIPTS)?;
        let encoded = serde_json::to_vec(receipt)?;
        table.insert(receipt.transaction_id.as_str(), encoded.as_slice())?;
        Ok(())
    }

    async fn delete_receipt(&mut self, tx_id: &str) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(RECEIPTS)?;
        table.remove(tx_id)?;
        Ok(())
    }

    async fn insert_confirmations(
        &mut self,
        records: &[ConfirmationRecord],
    ) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(CONFIRMATIONS)?;
        for record in records {
            let key = k_entry(&record.transaction_id, record.confirmed_at, &record.id);
            let encoded = serde_json::to_vec(record)?;
            table.insert(key.as_str(), encoded.as_slice())?;
        }
        Ok(())
    }

    async fn delete_confirmations(&mut self, tx_id: &str) -> Result<(), StoreError> {
        self.delete_prefix(CONFIRMATIONS, &k_tx_prefix(tx_id))
    }

    async fn insert_history(
        &mut self,
        records: &[TransactionHistoryRecord],
    ) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(HISTORY)?;
        for record in records {
            let key = k_entry(&record.transaction_id, record.occurred_at, &record.id);
            let encoded = serde_json::to_vec(record)?;
            table.insert(key.as_str(), encoded.as_slice())?;
        }
        Ok(())
    }

    async fn delete_history(&mut self, tx_id: &str) -> Result<(), StoreError> {
        self.delete_prefix(HISTORY, &k_tx_prefix(tx_id))
    }

    async fn compress_history(&mut self, tx_id: &str) -> Result<(), StoreError> {
        let entries = self.read_history(tx_id)?;
        let folded = fold_history(entries.iter().map(|(_, record)| record.clone()).collect());
        if folded.len() == entries.len() {
            return Ok(());
        }
        let mut table = self.txn.open_table(HISTORY)?;
        for (key, _) in &entries {
            table.remove(key.as_str())?;
        }
        for record in &folded {
            let key = k_entry(tx_id, record.occurred_at, &record.id);
            let encoded = serde_json::to_vec(record)?;
            table.insert(key.as_str(), encoded.as_slice())?;
        }
        Ok(())
    }

    async fn insert_completions(
        &mut self,
        records: &[TransactionCompletion],
    ) -> Result<(), StoreError> {
        let mut table = self.txn.open_table(COMPLETIONS)?;
        for record in records {
            let encoded = serde_json::to_vec(record)?;
            table.insert(record.transaction_id.as_str(), encoded.as_slice())?;
        }
        Ok(())
    }

    async fn delete_transaction(&mut self, id: &str) -> Result<(), StoreError> {
        let mut transactions = self.txn.open_table(TRANSACTIONS)?;
        let existing: Option<ManagedTransaction> = match transactions.get(id)? {
            Some(value) => Some(serde_json::from_slice(value.value())?),
            None => None,
        };
        if let Some(tx) = existing {
            transactions.remove(id)?;
            if let Some(nonce) = tx.nonce {
                let mut index = self.txn.open_table(NONCE_INDEX)?;
                index.remove(k_nonce(&tx.from, nonce).as_str())?;
            }
        }
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.txn.commit()?;
        Ok(())
    }
}

/// Embedded-backend persistence: per-signer wait/notify serialization and
/// direct grouped writes, no batching worker pool.
pub struct KvPersistence {
    store: Arc<KvTransactionStore>,
    locks: SignerLocks,
    nonces: NonceOracle,
    meta: TxMetadataCache,
    options: PersistenceOptions,
}

impl KvPersistence {
    pub fn new(store: Arc<KvTransactionStore>, options: PersistenceOptions) -> Self {
        Self {
            locks: SignerLocks::new(),
            nonces: NonceOracle::new(options.cache_slots, options.nonce_state_timeout),
            meta: TxMetadataCache::new(options.cache_slots),
            store,
            options,
        }
    }

    pub fn open(
        path: impl AsRef<Path>,
        options: PersistenceOptions,
    ) -> Result<Self, PersistenceError> {
        let store = Arc::new(KvTransactionStore::open(path)?);
        Ok(Self::new(store, options))
    }

    pub fn store(&self) -> &Arc<KvTransactionStore> {
        &self.store
    }

    /// Duplicate check and grouped insert; consumes no nonce on conflict.
    async fn insert_new(&self, tx: &ManagedTransaction) -> Result<(), PersistenceError> {
        if self.store.get_transaction(&tx.id).await?.is_some() {
            return Err(PersistenceError::DuplicateTransactionId(tx.id.clone()));
        }
        let mut group = self.store.begin_group().await?;
        group.insert_transactions(std::slice::from_ref(tx)).await?;
        group.commit().await?;
        self.meta.prime(&tx.id);
        Ok(())
    }

    async fn apply_update(
        &self,
        tx_id: &str,
        update: &TransactionUpdate,
    ) -> Result<(), PersistenceError> {
        let mut group = self.store.begin_group().await?;
        group.update_transaction(tx_id, update).await?;
        if let Some(status) = update.status {
            if status.is_terminal() {
                group
                    .insert_completions(&[TransactionCompletion::new(tx_id, status)])
                    .await?;
            }
        }
        group.commit().await?;
        Ok(())
    }

    async fn write_history(
        &self,
        record: TransactionHistoryRecord,
    ) -> Result<(), PersistenceError> {
        let tx_id = record.transaction_id.clone();
        let interval = self.options.compression_interval;
        let compact =
            !interval.is_zero() && self.meta.compression_due(&tx_id, interval);
        let mut group = self.store.begin_group().await?;
        group.insert_history(std::slice::from_ref(&record)).await?;
        if compact {
            tracing::debug!(tx_id = %tx_id, "Compressing transaction history");
            group.compress_history(&tx_id).await?;
        }
        group.commit().await?;
        if compact {
            self.meta.mark_compacted(&tx_id);
        }
        Ok(())
    }

    async fn apply_delete(&self, tx_id: &str) -> Result<(), PersistenceError> {
        let mut group = self.store.begin_group().await?;
        group.delete_receipt(tx_id).await?;
        group.delete_confirmations(tx_id).await?;
        group.delete_history(tx_id).await?;
        group.delete_transaction(tx_id).await?;
        group.commit().await?;
        self.meta.forget(tx_id);
        Ok(())
    }
}

#[async_trait]
impl TransactionPersistence for KvPersistence {
    async fn insert_transaction_with_next_nonce(
        &self,
        mut tx: ManagedTransaction,
        next_nonce: NextNonceCallback,
    ) -> Result<ManagedTransaction, PersistenceError> {
        if tx.id.is_empty() {
            return Err(PersistenceError::InvalidOperation);
        }
        let signer = tx.from;
        let assigned = match tx.nonce {
            // Caller-supplied nonce (e.g. re-import): no allocation, no slot
            Some(nonce) => {
                self.insert_new(&tx).await?;
                nonce
            }
            None => {
                let mut locked = self.locks.acquire(signer).await;
                let store = self.store.clone();
                let assigned = self
                    .nonces
                    .allocate(
                        signer,
                        move || async move { store.highest_nonce(signer).await },
                        &next_nonce,
                    )
                    .await?;
                tx.nonce = Some(assigned);
                // The duplicate check inside insert_new happens before the
                // nonce is marked spent; a conflict releases the slot with
                // the nonce unconsumed.
                self.insert_new(&tx).await?;
                self.nonces.advance(signer, assigned);
                locked.spend(assigned);
                assigned
            }
        };

        tracing::info!(signer = %signer, nonce = assigned, tx_id = %tx.id, "Assigned nonce");

        let record = TransactionHistoryRecord::new(&tx.id, TxHistoryAction::NonceAssigned)
            .with_info(serde_json::json!({ "nonce": assigned }));
        if let Err(err) = self.write_history(record).await {
            tracing::warn!(
                tx_id = %tx.id,
                error = %err,
                "Failed to record nonce assignment history"
            );
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
        let op_id = nanoid!(8);
        if tx_id.is_empty() {
            return WriteOp::ready(op_id, Err(PersistenceError::InvalidOperation));
        }
        tracing::debug!(op_id = %op_id, tx_id = %tx_id, "Updating transaction");
        let result = self.apply_update(tx_id, &update).await.map(|_| OpOutcome::Done);
        WriteOp::ready(op_id, result)
    }

    async fn delete_transaction(&self, tx_id: &str) -> WriteOp {
        let op_id = nanoid!(8);
        if tx_id.is_empty() {
            return WriteOp::ready(op_id, Err(PersistenceError::InvalidOperation));
        }
        tracing::debug!(op_id = %op_id, tx_id = %tx_id, "Deleting transaction");
        let result = self.apply_delete(tx_id).await.map(|_| OpOutcome::Done);
        WriteOp::ready(op_id, result)
    }

    async fn set_transaction_receipt(&self, tx_id: &str, mut receipt: ReceiptRecord) -> WriteOp {
        let op_id = nanoid!(8);
        if tx_id.is_empty() {
            return WriteOp::ready(op_id, Err(PersistenceError::InvalidOperation));
        }
        receipt.transaction_id = tx_id.to_string();
        let result = async {
            let mut group = self.store.begin_group().await?;
            group.upsert_receipt(&receipt).await?;
            group.commit().await?;
            Ok(OpOutcome::Done)
        }
        .await;
        WriteOp::ready(op_id, result)
    }

    async fn add_confirmation(
        &self,
        tx_id: &str,
        mut confirmation: ConfirmationRecord,
        clear_existing: bool,
    ) -> WriteOp {
        let op_id = nanoid!(8);
        if tx_id.is_empty() {
            return WriteOp::ready(op_id, Err(PersistenceError::InvalidOperation));
        }
        confirmation.transaction_id = tx_id.to_string();
        let result = async {
            let mut group = self.store.begin_group().await?;
            if clear_existing {
                group.delete_confirmations(tx_id).await?;
            }
            group
                .insert_confirmations(std::slice::from_ref(&confirmation))
                .await?;
            group.commit().await?;
            Ok(OpOutcome::Done)
        }
        .await;
        WriteOp::ready(op_id, result)
    }

    async fn add_history_event(&self, record: TransactionHistoryRecord) -> WriteOp {
        let op_id = nanoid!(8);
        if record.transaction_id.is_empty() {
            return WriteOp::ready(op_id, Err(PersistenceError::InvalidOperation));
        }
        let result = self.write_history(record).await.map(|_| OpOutcome::Done);
        WriteOp::ready(op_id, result)
    }

    async fn stop(&self) {
        tracing::debug!("Embedded persistence stopped");
    }
}
