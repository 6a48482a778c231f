//! Batching write pipeline for the relational backend.
//!
//! Inserts route to a worker by signer, so nonce assignment for one signer
//! is serialized while still allowing many transactions in a single grouped
//! store transaction. Everything else routes by transaction ID, keeping
//! order-sensitive writes for one transaction on one worker.

use std::collections::{HashMap, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use alloy::primitives::Address;
use nanoid::nanoid;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::PersistenceOptions;
use crate::error::PersistenceError;
use crate::meta::TxMetadataCache;
use crate::nonce::NonceOracle;
use crate::store::TransactionStore;
use crate::types::{
    ConfirmationRecord, ManagedTransaction, ReceiptRecord, TransactionCompletion,
    TransactionHistoryRecord, TransactionUpdate,
};
use crate::{NextNonceCallback, OpOutcome, OpResult, WriteOp};

pub(crate) enum OpPayload {
    Insert {
        tx: ManagedTransaction,
        next_nonce: NextNonceCallback,
    },
    Update(TransactionUpdate),
    Delete,
    Receipt(ReceiptRecord),
    Confirmation {
        record: ConfirmationRecord,
        clear_existing: bool,
    },
    History(TransactionHistoryRecord),
    Shutdown,
}

/// One queued write operation with its single-use completion channel.
pub struct TransactionOperation {
    op_id: String,
    tx_id: String,
    payload: OpPayload,
    done: Option<tokio::sync::oneshot::Sender<OpResult>>,
}

impl TransactionOperation {
    fn new(tx_id: String, payload: OpPayload) -> (Self, WriteOp) {
        let op_id = nanoid!(8);
        let (done, handle) = WriteOp::channel(op_id.clone());
        (
            Self {
                op_id,
                tx_id,
                payload,
                done: Some(done),
            },
            handle,
        )
    }

    pub fn insert(tx: ManagedTransaction, next_nonce: NextNonceCallback) -> (Self, WriteOp) {
        let tx_id = tx.id.clone();
        Self::new(tx_id, OpPayload::Insert { tx, next_nonce })
    }

    pub fn update(tx_id: impl Into<String>, update: TransactionUpdate) -> (Self, WriteOp) {
        Self::new(tx_id.into(), OpPayload::Update(update))
    }

    pub fn delete(tx_id: impl Into<String>) -> (Self, WriteOp) {
        Self::new(tx_id.into(), OpPayload::Delete)
    }

    pub fn receipt(tx_id: impl Into<String>, mut receipt: ReceiptRecord) -> (Self, WriteOp) {
        let tx_id = tx_id.into();
        receipt.transaction_id = tx_id.clone();
        Self::new(tx_id, OpPayload::Receipt(receipt))
    }

    pub fn confirmation(
        tx_id: impl Into<String>,
        mut record: ConfirmationRecord,
        clear_existing: bool,
    ) -> (Self, WriteOp) {
        let tx_id = tx_id.into();
        record.transaction_id = tx_id.clone();
        Self::new(
            tx_id,
            OpPayload::Confirmation {
                record,
                clear_existing,
            },
        )
    }

    pub fn history(record: TransactionHistoryRecord) -> (Self, WriteOp) {
        let tx_id = record.transaction_id.clone();
        Self::new(tx_id, OpPayload::History(record))
    }

    pub(crate) fn shutdown() -> (Self, WriteOp) {
        Self::new(String::new(), OpPayload::Shutdown)
    }

    fn routing_key(&self) -> Option<String> {
        match &self.payload {
            OpPayload::Insert { tx, .. } => Some(format!("{:#x}", tx.from)),
            _ if self.tx_id.is_empty() => None,
            _ => Some(self.tx_id.clone()),
        }
    }

    fn complete(&mut self, result: OpResult) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    fn conflict_sent(&self) -> bool {
        self.done.is_none()
    }

    fn outcome(&self) -> OpOutcome {
        match &self.payload {
            OpPayload::Insert { tx, .. } => match tx.nonce {
                Some(nonce) => OpOutcome::NonceAssigned(nonce),
                None => OpOutcome::Done,
            },
            _ => OpOutcome::Done,
        }
    }
}

struct WriterShared {
    store: Arc<dyn TransactionStore>,
    nonces: NonceOracle,
    meta: TxMetadataCache,
    batch_max_size: usize,
    batch_timeout: Duration,
    compression_interval: Duration,
    shutdown: CancellationToken,
}

/// Consistent-hash worker pool plus batch accumulation. The workers are
/// spawned at construction and live until [`TransactionWriter::stop`].
pub struct TransactionWriter {
    shared: Arc<WriterShared>,
    senders: Vec<mpsc::Sender<TransactionOperation>>,
    workers: StdMutex<Vec<JoinHandle<()>>>,
}

impl TransactionWriter {
    pub fn new(store: Arc<dyn TransactionStore>, options: &PersistenceOptions) -> Self {
        let worker_count = options.writer_count.max(1);
        let shared = Arc::new(WriterShared {
            store,
            nonces: NonceOracle::new(options.cache_slots, options.nonce_state_timeout),
            meta: TxMetadataCache::new(options.cache_slots),
            batch_max_size: options.batch_max_size.max(1),
            batch_timeout: options.batch_timeout,
            compression_interval: options.compression_interval,
            shutdown: CancellationToken::new(),
        });

        let mut senders = Vec::with_capacity(worker_count);
        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (sender, receiver) = mpsc::channel(shared.batch_max_size);
            senders.push(sender);
            let shared = shared.clone();
            workers.push(tokio::spawn(
                worker_loop(shared, receiver, index)
                    .instrument(tracing::info_span!("tx_writer", worker = index)),
            ));
        }

        Self {
            shared,
            senders,
            workers: StdMutex::new(workers),
        }
    }

    /// Route an operation to its worker. Inserts hash by signer, everything
    /// else by transaction ID; an operation with no routing key is rejected
    /// immediately on its completion channel.
    pub async fn queue(&self, mut op: TransactionOperation) {
        let key = match op.routing_key() {
            Some(key) => key,
            None => {
                op.complete(Err(PersistenceError::InvalidOperation));
                return;
            }
        };
        if self.shared.shutdown.is_cancelled() {
            op.complete(Err(PersistenceError::ShuttingDown));
            return;
        }

        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let routine = (hasher.finish() % self.senders.len() as u64) as usize;
        tracing::debug!(
            op_id = %op.op_id,
            worker = routine,
            "Queuing write operation"
        );

        tokio::select! {
            sent = self.senders[routine].send(op) => {
                if let Err(mpsc::error::SendError(mut op)) = sent {
                    op.complete(Err(PersistenceError::ShuttingDown));
                }
            }
            _ = self.shared.shutdown.cancelled() => {
                // The abandoned send drops the op; its completion channel
                // closes and flush reports shutting-down.
            }
        }
    }

    /// Send each worker a shutdown marker, wait for it to drain its current
    /// batch, then cancel the background context and join the workers.
    pub async fn stop(&self) {
        for sender in &self.senders {
            let (op, handle) = TransactionOperation::shutdown();
            if sender.send(op).await.is_ok() {
                let _ = handle.flush().await;
            }
        }
        self.shared.shutdown.cancel();
        let workers: Vec<JoinHandle<()>> = {
            let mut guard = self.workers.lock().expect("writer worker list poisoned");
            guard.drain(..).collect()
        };
        for worker in workers {
            let _ = worker.await;
        }
    }
}

struct WriterBatch {
    id: String,
    opened: std::time::Instant,
    deadline: tokio::time::Instant,
    ops: Vec<TransactionOperation>,
}

impl WriterBatch {
    fn new(worker: usize, count: u64, timeout: Duration) -> Self {
        Self {
            id: format!("{worker:04}_{count:09}"),
            opened: std::time::Instant::now(),
            deadline: tokio::time::Instant::now() + timeout,
            ops: Vec::new(),
        }
    }
}

async fn worker_loop(
    shared: Arc<WriterShared>,
    mut queue: mpsc::Receiver<TransactionOperation>,
    worker: usize,
) {
    let mut batch: Option<WriterBatch> = None;
    let mut batch_count: u64 = 0;
    loop {
        let deadline = batch
            .as_ref()
            .map(|open| open.deadline)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(60));

        tokio::select! {
            received = queue.recv() => match received {
                Some(mut op) => {
                    if matches!(op.payload, OpPayload::Shutdown) {
                        if let Some(sealed) = batch.take() {
                            run_batch(&shared, sealed).await;
                        }
                        op.complete(Ok(OpOutcome::Done));
                        tracing::debug!("Transaction writer worker quiesced");
                        return;
                    }
                    let open = batch.get_or_insert_with(|| {
                        batch_count += 1;
                        WriterBatch::new(worker, batch_count, shared.batch_timeout)
                    });
                    tracing::debug!(
                        op_id = %op.op_id,
                        batch = %open.id,
                        len = open.ops.len() + 1,
                        "Added write operation to batch"
                    );
                    open.ops.push(op);
                    if open.ops.len() >= shared.batch_max_size {
                        if let Some(sealed) = batch.take() {
                            run_batch(&shared, sealed).await;
                        }
                    }
                }
                None => {
                    if let Some(sealed) = batch.take() {
                        run_batch(&shared, sealed).await;
                    }
                    return;
                }
            },
            _ = tokio::time::sleep_until(deadline), if batch.is_some() => {
                if let Some(sealed) = batch.take() {
                    tracing::debug!(
                        batch = %sealed.id,
                        len = sealed.ops.len(),
                        age_ms = sealed.opened.elapsed().as_millis() as u64,
                        "Batch sealed by timeout"
                    );
                    run_batch(&shared, sealed).await;
                }
            }
            _ = shared.shutdown.cancelled() => {
                tracing::debug!("Transaction writer ending");
                return;
            }
        }
    }
}

#[derive(Default)]
struct BatchPlan {
    inserts_by_signer: HashMap<Address, Vec<usize>>,
    update_indexes: Vec<usize>,
    delete_ids: Vec<String>,
    receipt_inserts: HashMap<String, ReceiptRecord>,
    history_inserts: Vec<TransactionHistoryRecord>,
    confirmation_inserts: Vec<ConfirmationRecord>,
    confirmation_resets: HashSet<String>,
    compression_checks: HashSet<String>,
}

impl BatchPlan {
    fn build(ops: &[TransactionOperation]) -> Self {
        let mut plan = Self::default();
        for (index, op) in ops.iter().enumerate() {
            match &op.payload {
                OpPayload::Insert { tx, .. } => {
                    plan.inserts_by_signer.entry(tx.from).or_default().push(index);
                }
                OpPayload::Update(_) => plan.update_indexes.push(index),
                OpPayload::Delete => {
                    plan.delete_ids.push(op.tx_id.clone());
                    plan.compression_checks.remove(&op.tx_id);
                }
                // Last one wins: the same ID cannot be bulk-inserted twice.
                OpPayload::Receipt(receipt) => {
                    plan.receipt_inserts.insert(op.tx_id.clone(), receipt.clone());
                }
                OpPayload::History(record) => {
                    plan.history_inserts.push(record.clone());
                    plan.compression_checks.insert(op.tx_id.clone());
                }
                OpPayload::Confirmation {
                    record,
                    clear_existing,
                } => {
                    if *clear_existing {
                        // One clear per transaction per batch: purge any
                        // queued inserts for it before recording the reset.
                        plan.confirmation_inserts
                            .retain(|queued| queued.transaction_id != record.transaction_id);
                        plan.confirmation_resets.insert(record.transaction_id.clone());
                    }
                    plan.confirmation_inserts.push(record.clone());
                }
                OpPayload::Shutdown => {}
            }
        }
        plan
    }
}

async fn run_batch(shared: &Arc<WriterShared>, mut batch: WriterBatch) {
    tracing::debug!(batch = %batch.id, len = batch.ops.len(), "Running batch");
    let plan = BatchPlan::build(&batch.ops);
    let result = execute_batch(shared, &mut batch.ops, &plan).await;

    let failure = match result {
        Ok(()) => None,
        Err(err) => {
            tracing::error!(
                batch = %batch.id,
                error = %err,
                "Transaction persistence batch failed"
            );
            for signer in plan.inserts_by_signer.keys() {
                shared.nonces.evict(*signer);
            }
            // All ops in the batch get a single generic error
            Some(PersistenceError::Persistence(
                "transaction persistence batch failed".to_string(),
            ))
        }
    };

    for mut op in batch.ops {
        match &failure {
            Some(err) => op.complete(Err(err.clone())),
            None => {
                let outcome = op.outcome();
                op.complete(Ok(outcome));
            }
        }
    }
}

async fn execute_batch(
    shared: &Arc<WriterShared>,
    ops: &mut [TransactionOperation],
    plan: &BatchPlan,
) -> Result<(), PersistenceError> {
    let mut group = shared.store.begin_group().await?;

    // Idempotency pre-check: conflicts are signalled directly and excluded
    // from the bulk insert, so no nonce is spent on them.
    let mut staged: HashSet<String> = HashSet::new();
    for indexes in plan.inserts_by_signer.values() {
        for &index in indexes {
            let tx_id = ops[index].tx_id.clone();
            let duplicate = if staged.contains(&tx_id) {
                true
            } else if shared.meta.is_known(&tx_id) {
                group.get_transaction(&tx_id).await?.is_some()
            } else {
                false
            };
            if duplicate {
                tracing::debug!(tx_id = %tx_id, "Duplicate transaction insert rejected");
                ops[index].complete(Err(PersistenceError::DuplicateTransactionId(tx_id)));
            } else {
                staged.insert(tx_id);
            }
        }
    }

    // Nonce assignment: the first operation in a signer group pays the
    // reconciliation, the rest ride the advancing cache entry.
    for (signer, indexes) in &plan.inserts_by_signer {
        for &index in indexes {
            if ops[index].conflict_sent() {
                tracing::debug!(
                    tx_id = %ops[index].tx_id,
                    "Skipped nonce assignment for duplicate transaction"
                );
                continue;
            }
            let (pre_assigned, next_nonce) = match &ops[index].payload {
                OpPayload::Insert { tx, next_nonce } => (tx.nonce.is_some(), next_nonce.clone()),
                _ => continue,
            };
            if pre_assigned {
                continue;
            }
            let assigned = shared
                .nonces
                .allocate(*signer, || group.highest_nonce(*signer), &next_nonce)
                .await?;
            if let OpPayload::Insert { tx, .. } = &mut ops[index].payload {
                tx.nonce = Some(assigned);
            }
            tracing::info!(
                signer = %signer,
                nonce = assigned,
                tx_id = %ops[index].tx_id,
                "Assigned nonce"
            );
            shared.nonces.advance(*signer, assigned);
        }
    }

    // Bulk transaction inserts, then prime the metadata cache
    let mut inserts: Vec<ManagedTransaction> = Vec::new();
    for indexes in plan.inserts_by_signer.values() {
        for &index in indexes {
            if ops[index].conflict_sent() {
                continue;
            }
            if let OpPayload::Insert { tx, .. } = &ops[index].payload {
                inserts.push(tx.clone());
            }
        }
    }
    if !inserts.is_empty() {
        group.insert_transactions(&inserts).await?;
        for tx in &inserts {
            shared.meta.prime(&tx.id);
        }
    }

    // Merge updates per transaction; a merged update whose final status is
    // terminal produces exactly one completion record per transaction.
    let mut merged: Vec<(String, TransactionUpdate)> = Vec::new();
    let mut merged_index: HashMap<String, usize> = HashMap::new();
    for &index in &plan.update_indexes {
        let tx_id = ops[index].tx_id.clone();
        if let OpPayload::Update(update) = &ops[index].payload {
            match merged_index.get(&tx_id) {
                Some(&at) => merged[at].1.merge(update),
                None => {
                    merged_index.insert(tx_id.clone(), merged.len());
                    merged.push((tx_id.clone(), update.clone()));
                }
            }
        }
    }
    let mut completions: Vec<TransactionCompletion> = Vec::new();
    for (tx_id, update) in &merged {
        tracing::debug!(tx_id = %tx_id, "Updating transaction");
        group.update_transaction(tx_id, update).await?;
        if let Some(status) = update.status {
            if status.is_terminal() {
                completions.push(TransactionCompletion::new(tx_id, status));
            }
        }
    }

    // Receipts: bulk insert first, fall back to per-record upserts
    if !plan.receipt_inserts.is_empty() {
        let receipts: Vec<ReceiptRecord> = plan.receipt_inserts.values().cloned().collect();
        if let Err(err) = group.insert_receipts(&receipts).await {
            tracing::debug!(error = %err, "Batch receipt insert optimization failed");
            for receipt in &receipts {
                group.upsert_receipt(receipt).await?;
            }
        }
    }

    // Confirmation resets, then the new confirmation records
    for tx_id in &plan.confirmation_resets {
        group.delete_confirmations(tx_id).await?;
    }
    if !plan.confirmation_inserts.is_empty() {
        group
            .insert_confirmations(&plan.confirmation_inserts)
            .await?;
    }

    if !plan.history_inserts.is_empty() {
        group.insert_history(&plan.history_inserts).await?;
    }

    if !shared.compression_interval.is_zero() {
        for tx_id in &plan.compression_checks {
            if shared
                .meta
                .compression_due(tx_id, shared.compression_interval)
            {
                tracing::debug!(tx_id = %tx_id, "Compressing transaction history");
                group.compress_history(tx_id).await?;
                shared.meta.mark_compacted(tx_id);
            }
        }
    }

    if !completions.is_empty() {
        group.insert_completions(&completions).await?;
    }

    for tx_id in &plan.delete_ids {
        group.delete_receipt(tx_id).await?;
        group.delete_confirmations(tx_id).await?;
        group.delete_history(tx_id).await?;
        group.delete_transaction(tx_id).await?;
        shared.meta.forget(tx_id);
    }

    group.commit().await?;
    Ok(())
}
