//! Volatile metadata index.
//!
//! Rows keep the header decoded and the chain as its encoded bytes, so `exists`, `get_header`
//! and `list` never touch the chain.

use async_trait::async_trait;
use blobhouse_core::{
    BlobHeader, BlobMetadata, BlobUri, MetadataIndex, Plugin, PluginCategory, PluginDescriptor,
    TransformChain, VaultResult,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::ops::Bound;

/// Plugin id of the in-memory index.
pub const MEMORY_INDEX_ID: &str = "index-memory";

#[derive(Debug, Clone)]
struct Row {
    header: BlobHeader,
    chain: Vec<u8>,
}

type RowKey = (String, String);

/// Metadata index held in a `BTreeMap` ordered by (bucket, key).
pub struct MemoryMetadataIndex {
    descriptor: PluginDescriptor,
    rows: RwLock<BTreeMap<RowKey, Row>>,
}

impl Default for MemoryMetadataIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMetadataIndex {
    /// Creates a new empty index.
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                MEMORY_INDEX_ID,
                "In-memory metadata index",
                "1.0.0",
                PluginCategory::Metadata,
            )
            .with_tags(["metadata", "volatile"]),
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// True if the index holds nothing.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn corrupt_chain(&self, bucket: &str, key: &str) {
        if let Some(row) = self.rows.write().get_mut(&(bucket.to_string(), key.to_string())) {
            row.chain = b"{not a chain".to_vec();
        }
    }
}

impl Plugin for MemoryMetadataIndex {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl MetadataIndex for MemoryMetadataIndex {
    fn is_durable(&self) -> bool {
        false
    }

    async fn put(&self, metadata: &BlobMetadata) -> VaultResult<()> {
        let chain = metadata.chain.encode()?;
        let mut header = metadata.header.clone();
        let key = (header.bucket.clone(), header.key.clone());
        let mut rows = self.rows.write();
        if let Some(existing) = rows.get(&key) {
            header.created_at = existing.header.created_at;
        }
        rows.insert(key, Row { header, chain });
        Ok(())
    }

    async fn get(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobMetadata>> {
        let row = self
            .rows
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned();
        match row {
            Some(row) => Ok(Some(BlobMetadata {
                chain: TransformChain::decode(&row.chain)?,
                header: row.header,
            })),
            None => Ok(None),
        }
    }

    async fn get_header(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobHeader>> {
        Ok(self
            .rows
            .read()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|r| r.header.clone()))
    }

    async fn exists(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        Ok(self
            .rows
            .read()
            .contains_key(&(bucket.to_string(), key.to_string())))
    }

    async fn remove(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        Ok(self
            .rows
            .write()
            .remove(&(bucket.to_string(), key.to_string()))
            .is_some())
    }

    async fn list(&self, bucket: &str, prefix: &str) -> VaultResult<Vec<BlobHeader>> {
        let start = (bucket.to_string(), prefix.to_string());
        let rows = self.rows.read();
        Ok(rows
            .range((Bound::Included(start), Bound::Unbounded))
            .take_while(|((b, k), _)| b == bucket && k.starts_with(prefix))
            .map(|(_, r)| r.header.clone())
            .collect())
    }

    async fn referenced_uris(&self) -> VaultResult<HashSet<BlobUri>> {
        Ok(self
            .rows
            .read()
            .values()
            .map(|r| r.header.uri.clone())
            .collect())
    }
}
