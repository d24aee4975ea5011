//! In-memory content-addressable deduplication table

use async_trait::async_trait;
use blobhouse_core::{BlobUri, ContentHash, DedupEntry, DedupRegistration, DedupTable, VaultResult};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Volatile dedup table. Each hash lives in one DashMap shard, so registration is a
/// check-and-set under that shard's lock and never touches unrelated hashes.
#[derive(Debug, Default)]
pub struct MemoryDedupTable {
    entries: DashMap<ContentHash, DedupEntry>,
}

impl MemoryDedupTable {
    /// Create a new empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if this hash already has a canonical copy
    pub fn lookup(&self, hash: &ContentHash) -> bool {
        self.entries.contains_key(hash)
    }
}

#[async_trait]
impl DedupTable for MemoryDedupTable {
    fn backend_name(&self) -> &str {
        "memory"
    }

    async fn try_get_existing(&self, hash: &ContentHash) -> VaultResult<Option<DedupEntry>> {
        Ok(self.entries.get(hash).map(|e| e.value().clone()))
    }

    async fn register(&self, entry: DedupEntry) -> VaultResult<DedupRegistration> {
        Ok(match self.entries.entry(entry.content_hash) {
            Entry::Occupied(existing) => DedupRegistration::Existing(existing.get().clone()),
            Entry::Vacant(slot) => {
                slot.insert(entry.clone());
                DedupRegistration::Inserted(entry)
            }
        })
    }

    async fn unregister(&self, hash: &ContentHash, uri: &BlobUri) -> VaultResult<bool> {
        Ok(self.entries.remove_if(hash, |_, e| &e.uri == uri).is_some())
    }

    async fn entries(&self) -> VaultResult<Vec<DedupEntry>> {
        Ok(self.entries.iter().map(|e| e.value().clone()).collect())
    }

    async fn len(&self) -> VaultResult<usize> {
        Ok(self.entries.len())
    }
}
