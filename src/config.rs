use std::time::Duration;

/// Tunables for the persistence layer and its write pipeline.
#[derive(Clone, Debug)]
pub struct PersistenceOptions {
    /// How long a nonce cache entry is trusted before the next allocation
    /// re-reconciles against the store and the chain.
    pub nonce_state_timeout: Duration,

    /// Maximum number of operations in one write batch.
    pub batch_max_size: usize,

    /// Maximum time a batch is held open waiting for more operations.
    pub batch_timeout: Duration,

    /// Number of writer workers. Fixed at startup; routing is modulo this.
    pub writer_count: usize,

    /// Capacity of the nonce and transaction-metadata caches.
    pub cache_slots: usize,

    /// Minimum interval between history compactions for one transaction.
    /// Zero disables compaction entirely.
    pub compression_interval: Duration,
}

impl Default for PersistenceOptions {
    fn default() -> Self {
        Self {
            nonce_state_timeout: Duration::from_secs(60 * 60),
            batch_max_size: 100,
            batch_timeout: Duration::from_millis(10),
            writer_count: 5,
            cache_slots: 1000,
            compression_interval: Duration::from_secs(5 * 60),
        }
    }
}
