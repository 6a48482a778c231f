use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use alloy::primitives::Address;
use tokio::sync::watch;

/// At-most-one in-flight nonce assignment per signer.
///
/// A signer's slot is an entry in the map; waiters block on the slot's watch
/// channel and are all woken when the holder drops its sender, then race to
/// re-take the entry. The process-wide mutex is only held across map lookups
/// and updates, never across a wait.
pub(crate) struct SignerLocks {
    locked: Mutex<HashMap<Address, watch::Receiver<()>>>,
}

enum Acquire {
    Holder(watch::Sender<()>),
    Waiter(watch::Receiver<()>),
}

impl SignerLocks {
    pub fn new() -> Self {
        Self {
            locked: Mutex::new(HashMap::new()),
        }
    }

    fn map(&self) -> MutexGuard<'_, HashMap<Address, watch::Receiver<()>>> {
        self.locked.lock().expect("signer lock map poisoned")
    }

    /// Take the signer's slot, waiting behind the current holder if there is
    /// one. The returned guard releases the slot on drop, on every exit path
    /// including cancellation; callers that assigned a nonce should mark it
    /// spent first.
    pub async fn acquire(&self, signer: Address) -> LockedSigner<'_> {
        loop {
            let acquire = {
                let mut map = self.map();
                match map.entry(signer) {
                    Entry::Vacant(slot) => {
                        let (unlock, unlocked) = watch::channel(());
                        slot.insert(unlocked);
                        Acquire::Holder(unlock)
                    }
                    Entry::Occupied(slot) => Acquire::Waiter(slot.get().clone()),
                }
            };
            match acquire {
                Acquire::Holder(unlock) => {
                    return LockedSigner {
                        locks: self,
                        signer,
                        nonce: None,
                        _unlock: unlock,
                    };
                }
                Acquire::Waiter(mut unlocked) => {
                    tracing::debug!(signer = %signer, "Contention for next nonce");
                    // Resolves with Err when the holder drops its sender.
                    let _ = unlocked.changed().await;
                }
            }
        }
    }
}

pub(crate) struct LockedSigner<'a> {
    locks: &'a SignerLocks,
    signer: Address,
    nonce: Option<u64>,
    _unlock: watch::Sender<()>,
}

impl LockedSigner<'_> {
    pub fn spend(&mut self, nonce: u64) {
        self.nonce = Some(nonce);
    }
}

impl Drop for LockedSigner<'_> {
    fn drop(&mut self) {
        match self.nonce {
            Some(nonce) => {
                tracing::debug!(signer = %self.signer, nonce, "Next nonce spent")
            }
            None => {
                tracing::debug!(signer = %self.signer, "Returning signer slot with nonce unspent")
            }
        }
        self.locks.map().remove(&self.signer);
        // The sender drops after this body, waking every waiter.
    }
}
