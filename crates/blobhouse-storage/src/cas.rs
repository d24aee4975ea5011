//! Content-addressed storage provider (`cas://`).
//!
//! The address of an object is the BLAKE3 hash of the bytes actually stored, so the provider
//! can only mint the final URI inside [`save`](StorageProvider::save). The backend is append
//! only: deletes are refused with [`VaultError::NotSupported`](blobhouse_core::VaultError).

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use blobhouse_core::{
    BlobUri, ContentHash, Plugin, PluginCategory, PluginDescriptor, StorageProvider, VaultResult,
};
use bytes::Bytes;
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// URI scheme served by [`ContentAddressedProvider`].
pub const CAS_SCHEME: &str = "cas";

/// Plugin id of the content-addressed provider.
pub const CAS_STORAGE_ID: &str = "storage-cas";

/// Operations of a content-addressed object store (IPFS-like, or an S3 bucket keyed by hash).
#[async_trait]
pub trait CasClient: Send + Sync {
    /// Store `data` under `address`. Storing the same address twice is a no-op.
    async fn put(&self, address: &str, data: Bytes) -> StorageResult<()>;
    /// Fetch the bytes at `address`, or `None`.
    async fn get(&self, address: &str) -> StorageResult<Option<Bytes>>;
    /// True if `address` is stored.
    async fn contains(&self, address: &str) -> StorageResult<bool>;
}

/// Counters of a [`MemoryCasClient`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CasClientStats {
    /// Number of put operations.
    pub puts: u64,
    /// Number of get operations.
    pub gets: u64,
    /// Number of contains checks.
    pub contains_checks: u64,
    /// Total bytes stored.
    pub total_bytes_stored: u64,
}

/// In-process reference [`CasClient`].
#[derive(Default)]
pub struct MemoryCasClient {
    store: Mutex<HashMap<String, Bytes>>,
    stats: Mutex<CasClientStats>,
}

impl MemoryCasClient {
    /// Empty client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Operation counters.
    pub fn stats(&self) -> CasClientStats {
        self.stats.lock().clone()
    }

    /// Number of stored addresses.
    pub fn stored_count(&self) -> usize {
        self.store.lock().len()
    }
}

#[async_trait]
impl CasClient for MemoryCasClient {
    async fn put(&self, address: &str, data: Bytes) -> StorageResult<()> {
        let bytes = data.len() as u64;
        let fresh = {
            let mut store = self.store.lock();
            if store.contains_key(address) {
                false
            } else {
                store.insert(address.to_string(), data);
                true
            }
        };
        let mut stats = self.stats.lock();
        stats.puts += 1;
        if fresh {
            stats.total_bytes_stored = stats.total_bytes_stored.saturating_add(bytes);
        }
        Ok(())
    }

    async fn get(&self, address: &str) -> StorageResult<Option<Bytes>> {
        self.stats.lock().gets += 1;
        Ok(self.store.lock().get(address).cloned())
    }

    async fn contains(&self, address: &str) -> StorageResult<bool> {
        self.stats.lock().contains_checks += 1;
        Ok(self.store.lock().contains_key(address))
    }
}

/// Append-only provider over a [`CasClient`].
pub struct ContentAddressedProvider {
    descriptor: PluginDescriptor,
    client: Arc<dyn CasClient>,
    written: DashSet<String>,
    optimistic_exists: bool,
}

impl ContentAddressedProvider {
    /// Provider over `client`.
    pub fn new(client: Arc<dyn CasClient>) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                CAS_STORAGE_ID,
                "Content-addressed storage",
                "1.0.0",
                PluginCategory::Storage,
            )
            .with_tags(["storage", "durable", "append-only", CAS_SCHEME]),
            client,
            written: DashSet::new(),
            optimistic_exists: false,
        }
    }

    /// Answer `exists` with true for every address without asking the backend.
    pub fn with_optimistic_exists(mut self, optimistic: bool) -> Self {
        self.optimistic_exists = optimistic;
        self
    }

    fn address<'a>(&self, uri: &'a BlobUri) -> StorageResult<&'a str> {
        if uri.scheme() != CAS_SCHEME {
            return Err(StorageError::SchemeMismatch {
                expected: CAS_SCHEME.to_string(),
                uri: uri.to_string(),
            });
        }
        let address = uri.locator();
        if address.len() != 64 || !address.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidLocator(address.to_string()));
        }
        Ok(address)
    }
}

impl Plugin for ContentAddressedProvider {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl StorageProvider for ContentAddressedProvider {
    fn scheme(&self) -> &str {
        CAS_SCHEME
    }

    fn is_durable(&self) -> bool {
        true
    }

    // Placeholder; the real address is only known once the encoded bytes are in hand.
    fn mint_uri(&self, content_hash: &ContentHash) -> BlobUri {
        BlobUri::new(CAS_SCHEME, content_hash.to_hex())
            .unwrap_or_else(|_| unreachable!("static scheme and non-empty locator"))
    }

    async fn save(&self, _uri: &BlobUri, data: Bytes) -> VaultResult<BlobUri> {
        let address = blake3::hash(&data).to_hex().to_string();
        self.client.put(&address, data).await?;
        debug!(address = %address, "cas put");
        self.written.insert(address.clone());
        Ok(BlobUri::new(CAS_SCHEME, address)?)
    }

    async fn load(&self, uri: &BlobUri) -> VaultResult<Bytes> {
        let address = self.address(uri)?;
        let data = self
            .client
            .get(address)
            .await?
            .ok_or_else(|| StorageError::ObjectNotFound { uri: uri.to_string() })?;
        if blake3::hash(&data).to_hex().as_str() != address {
            return Err(blobhouse_core::VaultError::Corruption(format!(
                "{uri} does not hash to its address"
            )));
        }
        Ok(data)
    }

    async fn delete(&self, uri: &BlobUri) -> VaultResult<()> {
        Err(StorageError::Unsupported(format!("delete of {uri} on append-only store")).into())
    }

    async fn exists(&self, uri: &BlobUri) -> VaultResult<bool> {
        let address = self.address(uri)?;
        if self.optimistic_exists || self.written.contains(address) {
            return Ok(true);
        }
        Ok(self.client.contains(address).await?)
    }
}
