use std::future::Future;
use std::time::{Duration, Instant};

use alloy::primitives::Address;
use moka::sync::Cache;

use crate::error::PersistenceError;
use crate::store::StoreError;
use crate::NextNonceCallback;

#[derive(Debug, Clone)]
pub(crate) struct NonceCacheEntry {
    cached_at: Instant,
    pub next_nonce: u64,
}

/// Computes the next nonce for a signer by reconciling the in-memory cache,
/// the durable store, and the chain.
///
/// Must only be consulted with the signer's serializer held (the wait/notify
/// map on the embedded path, worker routing on the relational path).
pub(crate) struct NonceOracle {
    cache: Cache<Address, NonceCacheEntry>,
    timeout: Duration,
}

impl NonceOracle {
    pub fn new(cache_slots: usize, timeout: Duration) -> Self {
        Self {
            cache: Cache::new(cache_slots as u64),
            timeout,
        }
    }

    /// Decide the nonce the next transaction for `signer` should carry.
    ///
    /// A fresh cache entry answers directly. Otherwise the result is the
    /// maximum of the chain's view, the highest persisted nonce plus one,
    /// and the expired cache entry (which may still reflect nonces in
    /// uncommitted batches that the store query cannot see). Taking the
    /// maximum can leave a gap on the chain; it never replays a nonce.
    pub async fn allocate<F, Fut>(
        &self,
        signer: Address,
        highest_nonce: F,
        next_nonce: &NextNonceCallback,
    ) -> Result<u64, PersistenceError>
    where
        F: FnOnce() -> Fut + Send,
        Fut: Future<Output = Result<Option<u64>, StoreError>> + Send,
    {
        let cached = self.cache.get(&signer);
        if let Some(entry) = &cached {
            let age = entry.cached_at.elapsed();
            if age <= self.timeout {
                tracing::debug!(
                    signer = %signer,
                    nonce = entry.next_nonce,
                    "Allocating next nonce from cache"
                );
                return Ok(entry.next_nonce);
            }
            tracing::info!(
                signer = %signer,
                age_ms = age.as_millis() as u64,
                "Nonce cache expired"
            );
        }

        let local = highest_nonce()
            .await?
            .map(|nonce| nonce + 1)
            .unwrap_or_default();
        let chain = (next_nonce)(signer).await?;
        let stale = cached.map(|entry| entry.next_nonce).unwrap_or_default();

        let next = chain.max(local).max(stale);
        if next > chain {
            tracing::info!(
                signer = %signer,
                chain_next = chain,
                next_nonce = next,
                "Node transaction pool next nonce is behind local state"
            );
        }
        self.cache.insert(
            signer,
            NonceCacheEntry {
                cached_at: Instant::now(),
                next_nonce: next,
            },
        );
        Ok(next)
    }

    /// Record a successful assignment: the next caller for this signer gets
    /// `assigned + 1` straight from the cache.
    pub fn advance(&self, signer: Address, assigned: u64) {
        self.cache.insert(
            signer,
            NonceCacheEntry {
                cached_at: Instant::now(),
                next_nonce: assigned + 1,
            },
        );
    }

    /// Drop the signer's entry so the next allocation re-observes the store
    /// and the chain.
    pub fn evict(&self, signer: Address) {
        tracing::warn!(signer = %signer, "Clearing nonce cache after persistence failure");
        self.cache.invalidate(&signer);
    }
}
