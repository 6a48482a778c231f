use std::time::{Duration, Instant};

use moka::sync::Cache;

#[derive(Debug, Clone)]
struct TxMetaEntry {
    last_compacted: Option<Instant>,
}

/// Per-transaction metadata: recently-seen IDs for the duplicate guard and
/// history-compaction bookkeeping. Capacity-bounded; a miss is resolved
/// against the durable store, so eviction only costs an extra read.
pub(crate) struct TxMetadataCache {
    cache: Cache<String, TxMetaEntry>,
}

impl TxMetadataCache {
    pub fn new(cache_slots: usize) -> Self {
        Self {
            cache: Cache::new(cache_slots as u64),
        }
    }

    pub fn is_known(&self, tx_id: &str) -> bool {
        self.cache.contains_key(tx_id)
    }

    /// Record a freshly inserted transaction, in the just-compacted state.
    pub fn prime(&self, tx_id: &str) {
        self.cache.insert(
            tx_id.to_string(),
            TxMetaEntry {
                last_compacted: Some(Instant::now()),
            },
        );
    }

    /// Whether a history write should trigger compaction. A missing entry
    /// means compact immediately.
    pub fn compression_due(&self, tx_id: &str, interval: Duration) -> bool {
        match self.cache.get(tx_id) {
            Some(TxMetaEntry {
                last_compacted: Some(at),
            }) => at.elapsed() >= interval,
            _ => true,
        }
    }

    pub fn mark_compacted(&self, tx_id: &str) {
        self.cache.insert(
            tx_id.to_string(),
            TxMetaEntry {
                last_compacted: Some(Instant::now()),
            },
        );
    }

    pub fn forget(&self, tx_id: &str) {
        self.cache.invalidate(tx_id);
    }
}
