//! Deduplication table contract: content hash to canonical physical location.

use crate::error::VaultResult;
use crate::types::{BlobUri, ContentHash, TransformChain};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Canonical physical copy of a content hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupEntry {
    /// BLAKE3 of the original content
    pub content_hash: ContentHash,
    /// Where the encoded bytes live
    pub uri: BlobUri,
    /// Chain the bytes at `uri` were encoded with
    pub chain: TransformChain,
}

/// Outcome of [`DedupTable::register`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupRegistration {
    /// The caller's entry became canonical.
    Inserted(DedupEntry),
    /// Another writer got there first; this is their entry, unchanged.
    Existing(DedupEntry),
}

impl DedupRegistration {
    /// The canonical entry, whichever writer won.
    pub fn entry(&self) -> &DedupEntry {
        match self {
            DedupRegistration::Inserted(e) | DedupRegistration::Existing(e) => e,
        }
    }

    /// Consume into the canonical entry.
    pub fn into_entry(self) -> DedupEntry {
        match self {
            DedupRegistration::Inserted(e) | DedupRegistration::Existing(e) => e,
        }
    }

    /// True if the caller's entry was inserted.
    pub fn is_inserted(&self) -> bool {
        matches!(self, DedupRegistration::Inserted(_))
    }
}

/// Durable or volatile mapping from content hash to canonical URI.
///
/// `register` is an atomic check-and-set per hash: the first registration wins and later
/// registrations of the same hash get the existing entry back instead of overwriting it.
#[async_trait]
pub trait DedupTable: Send + Sync {
    /// Short backend name for logs and health reports.
    fn backend_name(&self) -> &str;

    /// Open underlying storage. Idempotent.
    async fn open(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Release underlying storage. Idempotent.
    async fn close(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Reachability probe.
    async fn health(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Canonical entry for `hash`, if any.
    async fn try_get_existing(&self, hash: &ContentHash) -> VaultResult<Option<DedupEntry>>;

    /// Insert `entry` unless its hash is already registered.
    async fn register(&self, entry: DedupEntry) -> VaultResult<DedupRegistration>;

    /// Remove the entry for `hash` only if it still points at `uri`. Returns true if removed.
    async fn unregister(&self, hash: &ContentHash, uri: &BlobUri) -> VaultResult<bool>;

    /// Snapshot of all entries.
    async fn entries(&self) -> VaultResult<Vec<DedupEntry>>;

    /// Number of entries.
    async fn len(&self) -> VaultResult<usize>;
}
