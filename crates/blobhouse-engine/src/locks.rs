//! Single-flight locks keyed by a BLAKE3 digest.
//!
//! Keyed by content hash, concurrent stores of identical bytes queue on one async mutex, so only
//! the first runs the transform chain and writes; the rest find its dedup entry. The engine also
//! keys a second table by the digest of (bucket, key) to serialize metadata commits. Idle locks
//! are removed when their last holder releases them.

use blobhouse_core::ContentHash;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockMap = Arc<DashMap<ContentHash, Arc<Mutex<()>>>>;

/// Lock table keyed by digest.
#[derive(Debug, Default, Clone)]
pub struct HashLocks {
    locks: LockMap,
}

/// Held lock on one hash. Owned, so it can move into a spawned commit task.
#[derive(Debug)]
pub struct HashGuard {
    guard: Option<OwnedMutexGuard<()>>,
    hash: ContentHash,
    locks: LockMap,
}

impl HashLocks {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive use of `hash`.
    pub async fn acquire(&self, hash: ContentHash) -> HashGuard {
        let lock = Arc::clone(
            self.locks
                .entry(hash)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        let guard = lock.lock_owned().await;
        HashGuard {
            guard: Some(guard),
            hash,
            locks: Arc::clone(&self.locks),
        }
    }

    /// Hashes with a live lock (held or awaited).
    pub fn active(&self) -> usize {
        self.locks.len()
    }
}

impl Drop for HashGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still references the mutex: nobody holds or awaits it.
        self.locks
            .remove_if(&self.hash, |_, lock| Arc::strong_count(lock) == 1);
    }
}
