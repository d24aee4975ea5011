//! Fault injection: plugins that fail, stall or corrupt on demand.

use async_trait::async_trait;
use blobhouse_core::{
    BlobHeader, BlobMetadata, BlobUri, ContentHash, MetadataIndex, Plugin, PluginCategory,
    PluginDescriptor, StorageProvider, TransformArgs, TransformContext, TransformPlugin,
    TransformRole, VaultError, VaultResult,
};
use std::collections::HashSet;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Id of [`ReversingTransform`].
pub const REVERSING_TRANSFORM_ID: &str = "reverse-test";

/// Wraps a provider and serves its scheme, injecting faults when asked.
pub struct FaultyStorage {
    descriptor: PluginDescriptor,
    inner: Arc<dyn StorageProvider>,
    fail_open: AtomicBool,
    fail_saves: AtomicBool,
    corrupt_loads: AtomicBool,
    save_delay: Mutex<Option<Duration>>,
    saves: AtomicU64,
    closes: AtomicU64,
}

impl FaultyStorage {
    pub fn new(inner: Arc<dyn StorageProvider>) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                format!("faulty-{}", inner.id()),
                "Fault injecting storage",
                "0.1.0",
                PluginCategory::Storage,
            )
            .with_tags(["storage", "test", inner.scheme()]),
            inner,
            fail_open: AtomicBool::new(false),
            fail_saves: AtomicBool::new(false),
            corrupt_loads: AtomicBool::new(false),
            save_delay: Mutex::new(None),
            saves: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    pub fn set_fail_open(&self, on: bool) {
        self.fail_open.store(on, Ordering::SeqCst);
    }

    pub fn set_fail_saves(&self, on: bool) {
        self.fail_saves.store(on, Ordering::SeqCst);
    }

    /// Flip the first byte of everything loaded.
    pub fn set_corrupt_loads(&self, on: bool) {
        self.corrupt_loads.store(on, Ordering::SeqCst);
    }

    /// Sleep before every save.
    pub fn set_save_delay(&self, delay: Option<Duration>) {
        *self.save_delay.lock() = delay;
    }

    /// Saves that reached the inner provider.
    pub fn save_count(&self) -> u64 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> u64 {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Plugin for FaultyStorage {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl StorageProvider for FaultyStorage {
    fn scheme(&self) -> &str {
        self.inner.scheme()
    }

    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }

    fn mint_uri(&self, content_hash: &ContentHash) -> BlobUri {
        self.inner.mint_uri(content_hash)
    }

    async fn open(&self) -> VaultResult<()> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(VaultError::BackendUnavailable("injected open failure".into()));
        }
        self.inner.open().await
    }

    async fn close(&self) -> VaultResult<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inner.close().await
    }

    async fn save(&self, uri: &BlobUri, data: Bytes) -> VaultResult<BlobUri> {
        let delay = *self.save_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(VaultError::BackendUnavailable("injected save failure".into()));
        }
        let written = self.inner.save(uri, data).await?;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(written)
    }

    async fn load(&self, uri: &BlobUri) -> VaultResult<Bytes> {
        let data = self.inner.load(uri).await?;
        if !self.corrupt_loads.load(Ordering::SeqCst) || data.is_empty() {
            return Ok(data);
        }
        let mut flipped = BytesMut::from(&data[..]);
        flipped[0] ^= 0xff;
        Ok(flipped.freeze())
    }

    async fn delete(&self, uri: &BlobUri) -> VaultResult<()> {
        self.inner.delete(uri).await
    }

    async fn exists(&self, uri: &BlobUri) -> VaultResult<bool> {
        self.inner.exists(uri).await
    }
}

/// Wraps a metadata index and rejects writes when asked.
pub struct FailingIndex {
    descriptor: PluginDescriptor,
    inner: Arc<dyn MetadataIndex>,
    fail_puts: AtomicBool,
    puts: AtomicU64,
}

impl FailingIndex {
    pub fn new(inner: Arc<dyn MetadataIndex>) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                format!("failing-{}", inner.id()),
                "Fault injecting metadata index",
                "0.1.0",
                PluginCategory::Metadata,
            )
            .with_tags(["metadata", "test"]),
            inner,
            fail_puts: AtomicBool::new(false),
            puts: AtomicU64::new(0),
        }
    }

    pub fn set_fail_puts(&self, on: bool) {
        self.fail_puts.store(on, Ordering::SeqCst);
    }

    /// Puts attempted, failed ones included.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }
}

impl Plugin for FailingIndex {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl MetadataIndex for FailingIndex {
    fn is_durable(&self) -> bool {
        self.inner.is_durable()
    }

    async fn open(&self) -> VaultResult<()> {
        self.inner.open().await
    }

    async fn close(&self) -> VaultResult<()> {
        self.inner.close().await
    }

    async fn put(&self, metadata: &BlobMetadata) -> VaultResult<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(VaultError::BackendUnavailable("injected metadata write failure".into()));
        }
        self.inner.put(metadata).await
    }

    async fn get(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobMetadata>> {
        self.inner.get(bucket, key).await
    }

    async fn get_header(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobHeader>> {
        self.inner.get_header(bucket, key).await
    }

    async fn exists(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        self.inner.exists(bucket, key).await
    }

    async fn remove(&self, bucket: &str, key: &str) -> VaultResult<bool> {
        self.inner.remove(bucket, key).await
    }

    async fn list(&self, bucket: &str, prefix: &str) -> VaultResult<Vec<BlobHeader>> {
        self.inner.list(bucket, prefix).await
    }

    async fn referenced_uris(&self) -> VaultResult<HashSet<BlobUri>> {
        self.inner.referenced_uris().await
    }
}

/// Reverses the byte order. Its own inverse; stands in for a third-party transform.
pub struct ReversingTransform {
    descriptor: PluginDescriptor,
}

impl ReversingTransform {
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                REVERSING_TRANSFORM_ID,
                "Byte reversal",
                "0.1.0",
                PluginCategory::Transform,
            )
            .with_tags([TransformRole::Other.tag()]),
        }
    }

    fn reversed(input: &Bytes) -> Bytes {
        input.iter().rev().copied().collect::<Vec<u8>>().into()
    }
}

impl Default for ReversingTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Plugin for ReversingTransform {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl TransformPlugin for ReversingTransform {
    fn role(&self) -> TransformRole {
        TransformRole::Other
    }

    async fn apply(
        &self,
        input: Bytes,
        _args: &TransformArgs,
        _ctx: &TransformContext,
    ) -> VaultResult<Bytes> {
        Ok(Self::reversed(&input))
    }

    async fn reverse(
        &self,
        input: Bytes,
        _args: &TransformArgs,
        _ctx: &TransformContext,
    ) -> VaultResult<Bytes> {
        Ok(Self::reversed(&input))
    }
}
