//! Volatile in-process storage provider (`mem://`). Contents live as long as the provider
//! value, across engine remounts, and vanish with the process.

use crate::error::StorageError;
use async_trait::async_trait;
use blobhouse_core::{
    BlobUri, ContentHash, Plugin, PluginCategory, PluginDescriptor, StorageProvider, VaultResult,
};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;
use uuid::Uuid;

/// URI scheme served by [`MemoryProvider`].
pub const MEM_SCHEME: &str = "mem";

/// Plugin id of the memory provider.
pub const MEMORY_STORAGE_ID: &str = "storage-memory";

/// Objects in a concurrent map keyed by locator.
pub struct MemoryProvider {
    descriptor: PluginDescriptor,
    objects: DashMap<String, Bytes>,
    writes: AtomicU64,
}

impl MemoryProvider {
    /// Empty provider.
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                MEMORY_STORAGE_ID,
                "In-memory storage",
                "1.0.0",
                PluginCategory::Storage,
            )
            .with_tags(["storage", "volatile", MEM_SCHEME]),
            objects: DashMap::new(),
            writes: AtomicU64::new(0),
        }
    }

    /// Objects currently held.
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }

    /// Successful saves since creation.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn locator<'a>(&self, uri: &'a BlobUri) -> Result<&'a str, StorageError> {
        if uri.scheme() != MEM_SCHEME {
            return Err(StorageError::SchemeMismatch {
                expected: MEM_SCHEME.to_string(),
                uri: uri.to_string(),
            });
        }
        Ok(uri.locator())
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for MemoryProvider {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl StorageProvider for MemoryProvider {
    fn scheme(&self) -> &str {
        MEM_SCHEME
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn mint_uri(&self, content_hash: &ContentHash) -> BlobUri {
        let locator = format!("{}-{}", content_hash.to_hex(), Uuid::new_v4().simple());
        BlobUri::new(MEM_SCHEME, locator)
            .unwrap_or_else(|_| unreachable!("static scheme and non-empty locator"))
    }

    async fn save(&self, uri: &BlobUri, data: Bytes) -> VaultResult<BlobUri> {
        let locator = self.locator(uri)?;
        debug!(uri = %uri, bytes = data.len(), "memory put");
        self.objects.insert(locator.to_string(), data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(uri.clone())
    }

    async fn load(&self, uri: &BlobUri) -> VaultResult<Bytes> {
        let locator = self.locator(uri)?;
        self.objects
            .get(locator)
            .map(|b| b.value().clone())
            .ok_or_else(|| StorageError::ObjectNotFound { uri: uri.to_string() }.into())
    }

    async fn delete(&self, uri: &BlobUri) -> VaultResult<()> {
        let locator = self.locator(uri)?;
        self.objects.remove(locator);
        Ok(())
    }

    async fn exists(&self, uri: &BlobUri) -> VaultResult<bool> {
        let locator = self.locator(uri)?;
        Ok(self.objects.contains_key(locator))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobhouse_core::VaultError;

    #[tokio::test]
    async fn put_get_delete() {
        let p = MemoryProvider::new();
        let uri = p.mint_uri(&ContentHash([3; 32]));
        p.save(&uri, Bytes::from_static(b"hello")).await.unwrap();
        assert_eq!(p.load(&uri).await.unwrap(), Bytes::from_static(b"hello"));
        assert_eq!(p.write_count(), 1);
        assert!(p.exists(&uri).await.unwrap());
        p.delete(&uri).await.unwrap();
        assert!(!p.exists(&uri).await.unwrap());
        assert!(matches!(p.load(&uri).await, Err(VaultError::NotFound(_))));
    }

    #[tokio::test]
    async fn contents_survive_close_and_reopen() {
        let p = MemoryProvider::new();
        let uri = p.mint_uri(&ContentHash([3; 32]));
        p.save(&uri, Bytes::from_static(b"x")).await.unwrap();
        p.close().await.unwrap();
        p.open().await.unwrap();
        assert_eq!(p.object_count(), 1);
        assert_eq!(p.load(&uri).await.unwrap(), Bytes::from_static(b"x"));
    }

    #[tokio::test]
    async fn foreign_scheme_rejected() {
        let p = MemoryProvider::new();
        let uri = BlobUri::new("file", "ab/cd").unwrap();
        assert!(matches!(
            p.save(&uri, Bytes::new()).await,
            Err(VaultError::ValidationFailure(_))
        ));
    }
}
