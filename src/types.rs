use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy::primitives::{Address, Bytes, B256, U256};
use serde::{Deserialize, Serialize};

/// Milliseconds since the unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Succeeded,
    Failed,
    DeleteRequested,
    Suspended,
}

impl TransactionStatus {
    /// Terminal statuses produce a completion record when reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Succeeded | TransactionStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Succeeded => "SUCCEEDED",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::DeleteRequested => "DELETE_REQUESTED",
            TransactionStatus::Suspended => "SUSPENDED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TransactionStatus::Pending),
            "SUCCEEDED" => Some(TransactionStatus::Succeeded),
            "FAILED" => Some(TransactionStatus::Failed),
            "DELETE_REQUESTED" => Some(TransactionStatus::DeleteRequested),
            "SUSPENDED" => Some(TransactionStatus::Suspended),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The durable record of a submission, distinct from the eventual on-chain
/// transaction hash. `nonce` is absent until assignment succeeds and is
/// never revised afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedTransaction {
    pub id: String,
    pub from: Address,
    pub nonce: Option<u64>,
    pub status: TransactionStatus,
    pub created_at: u64, // Unix timestamp in milliseconds
    pub updated_at: u64,
    pub first_submit: Option<u64>,
    pub last_submit: Option<u64>,
    pub transaction_hash: Option<B256>,
    pub gas_price: Option<U256>,
    pub gas_limit: Option<u64>,
    pub transaction_data: Bytes,
    pub error_message: Option<String>,
}

impl ManagedTransaction {
    pub fn new(id: impl Into<String>, from: Address, transaction_data: Bytes) -> Self {
        let now = now_ms();
        Self {
            id: id.into(),
            from,
            nonce: None,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
            first_submit: None,
            last_submit: None,
            transaction_hash: None,
            gas_price: None,
            gas_limit: None,
            transaction_data,
            error_message: None,
        }
    }
}

/// Sparse update applied to a persisted transaction. Absent fields are left
/// untouched. Updates to the same transaction within one batch are merged
/// last-writer-wins per field.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionUpdate {
    pub status: Option<TransactionStatus>,
    pub transaction_hash: Option<B256>,
    pub gas_price: Option<U256>,
    pub gas_limit: Option<u64>,
    pub transaction_data: Option<Bytes>,
    pub first_submit: Option<u64>,
    pub last_submit: Option<u64>,
    pub error_message: Option<String>,
}

impl TransactionUpdate {
    pub fn with_status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn merge(&mut self, other: &TransactionUpdate) {
        if other.status.is_some() {
            self.status = other.status;
        }
        if other.transaction_hash.is_some() {
            self.transaction_hash = other.transaction_hash;
        }
        if other.gas_price.is_some() {
            self.gas_price = other.gas_price;
        }
        if other.gas_limit.is_some() {
            self.gas_limit = other.gas_limit;
        }
        if other.transaction_data.is_some() {
            self.transaction_data = other.transaction_data.clone();
        }
        if other.first_submit.is_some() {
            self.first_submit = other.first_submit;
        }
        if other.last_submit.is_some() {
            self.last_submit = other.last_submit;
        }
        if other.error_message.is_some() {
            self.error_message = other.error_message.clone();
        }
    }

    pub fn apply(&self, tx: &mut ManagedTransaction) {
        if let Some(status) = self.status {
            tx.status = status;
        }
        if let Some(hash) = self.transaction_hash {
            tx.transaction_hash = Some(hash);
        }
        if let Some(gas_price) = self.gas_price {
            tx.gas_price = Some(gas_price);
        }
        if let Some(gas_limit) = self.gas_limit {
            tx.gas_limit = Some(gas_limit);
        }
        if let Some(data) = &self.transaction_data {
            tx.transaction_data = data.clone();
        }
        if let Some(first_submit) = self.first_submit {
            tx.first_submit = Some(first_submit);
        }
        if let Some(last_submit) = self.last_submit {
            tx.last_submit = Some(last_submit);
        }
        if let Some(message) = &self.error_message {
            tx.error_message = Some(message.clone());
        }
        tx.updated_at = now_ms();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptRecord {
    pub transaction_id: String,
    pub block_number: u64,
    pub block_hash: B256,
    pub transaction_index: u64,
    pub success: bool,
    pub extra_info: Option<serde_json::Value>,
    pub received_at: u64, // Unix timestamp in milliseconds
}

impl ReceiptRecord {
    pub fn new(transaction_id: impl Into<String>, block_number: u64, block_hash: B256) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            block_number,
            block_hash,
            transaction_index: 0,
            success: true,
            extra_info: None,
            received_at: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationRecord {
    pub id: String,
    pub transaction_id: String,
    pub block_number: u64,
    pub block_hash: B256,
    pub parent_hash: B256,
    pub confirmed_at: u64, // Unix timestamp in milliseconds
}

impl ConfirmationRecord {
    pub fn new(
        transaction_id: impl Into<String>,
        block_number: u64,
        block_hash: B256,
        parent_hash: B256,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.into(),
            block_number,
            block_hash,
            parent_hash,
            confirmed_at: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TxHistoryAction {
    NonceAssigned,
    Submitted,
    Resubmitted,
    ReceiptReceived,
    Confirmed,
    StatusChanged,
    Deleted,
}

impl TxHistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxHistoryAction::NonceAssigned => "NONCE_ASSIGNED",
            TxHistoryAction::Submitted => "SUBMITTED",
            TxHistoryAction::Resubmitted => "RESUBMITTED",
            TxHistoryAction::ReceiptReceived => "RECEIPT_RECEIVED",
            TxHistoryAction::Confirmed => "CONFIRMED",
            TxHistoryAction::StatusChanged => "STATUS_CHANGED",
            TxHistoryAction::Deleted => "DELETED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NONCE_ASSIGNED" => Some(TxHistoryAction::NonceAssigned),
            "SUBMITTED" => Some(TxHistoryAction::Submitted),
            "RESUBMITTED" => Some(TxHistoryAction::Resubmitted),
            "RECEIPT_RECEIVED" => Some(TxHistoryAction::ReceiptReceived),
            "CONFIRMED" => Some(TxHistoryAction::Confirmed),
            "STATUS_CHANGED" => Some(TxHistoryAction::StatusChanged),
            "DELETED" => Some(TxHistoryAction::Deleted),
            _ => None,
        }
    }
}

impl fmt::Display for TxHistoryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in a transaction's history. Compaction folds runs of identical
/// actions into a single record, summing `count` and advancing
/// `last_occurrence`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionHistoryRecord {
    pub id: String,
    pub transaction_id: String,
    pub action: TxHistoryAction,
    pub occurred_at: u64, // Unix timestamp in milliseconds
    pub last_occurrence: u64,
    pub count: u64,
    pub info: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl TransactionHistoryRecord {
    pub fn new(transaction_id: impl Into<String>, action: TxHistoryAction) -> Self {
        let now = now_ms();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            transaction_id: transaction_id.into(),
            action,
            occurred_at: now,
            last_occurrence: now,
            count: 1,
            info: None,
            error: None,
        }
    }

    pub fn with_info(mut self, info: serde_json::Value) -> Self {
        self.info = Some(info);
        self
    }
}

/// Durable marker written when a transaction reaches a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionCompletion {
    pub transaction_id: String,
    pub status: TransactionStatus,
    pub completed_at: u64, // Unix timestamp in milliseconds
}

impl TransactionCompletion {
    pub fn new(transaction_id: impl Into<String>, status: TransactionStatus) -> Self {
        Self {
            transaction_id: transaction_id.into(),
            status,
            completed_at: now_ms(),
        }
    }
}
