//! Local disk storage provider (`file://`).
//!
//! Objects live under a root directory, fanned out by the first two hex digits of the content
//! hash. Writes go to a temporary sibling first and are renamed into place, so a reader never
//! observes a partial object.

use crate::error::{StorageError, StorageResult};
use async_trait::async_trait;
use blobhouse_core::{
    BlobUri, ContentHash, Plugin, PluginCategory, PluginDescriptor, StorageProvider, VaultResult,
};
use bytes::Bytes;
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// URI scheme served by [`LocalDiskProvider`].
pub const FILE_SCHEME: &str = "file";

/// Plugin id of the local disk provider.
pub const LOCAL_DISK_ID: &str = "storage-local";

/// Files under a root directory.
pub struct LocalDiskProvider {
    descriptor: PluginDescriptor,
    root: PathBuf,
}

impl LocalDiskProvider {
    /// Provider rooted at `root`; the directory is created on `open`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                LOCAL_DISK_ID,
                "Local disk",
                "1.0.0",
                PluginCategory::Storage,
            )
            .with_tags(["storage", "durable", FILE_SCHEME]),
            root: root.into(),
        }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a URI to a path inside the root, rejecting anything that could escape it.
    pub fn resolve(&self, uri: &BlobUri) -> StorageResult<PathBuf> {
        if uri.scheme() != FILE_SCHEME {
            return Err(StorageError::SchemeMismatch {
                expected: FILE_SCHEME.to_string(),
                uri: uri.to_string(),
            });
        }
        let locator = uri.locator();
        if locator.contains('\\') || locator.contains('\0') {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }
        let rel = Path::new(locator);
        let clean = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if !clean || rel.components().next().is_none() {
            return Err(StorageError::InvalidLocator(locator.to_string()));
        }
        Ok(self.root.join(rel))
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        let result = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, path).await
        }
        .await;
        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        Ok(())
    }
}

impl Plugin for LocalDiskProvider {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl StorageProvider for LocalDiskProvider {
    fn scheme(&self) -> &str {
        FILE_SCHEME
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn mint_uri(&self, content_hash: &ContentHash) -> BlobUri {
        let hex = content_hash.to_hex();
        let locator = format!("{}/{}-{}", &hex[..2], hex, Uuid::new_v4().simple());
        BlobUri::new(FILE_SCHEME, locator).unwrap_or_else(|_| unreachable!("static scheme and non-empty locator"))
    }

    async fn open(&self) -> VaultResult<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(StorageError::from)?;
        debug!(root = %self.root.display(), "local disk provider open");
        Ok(())
    }

    async fn health(&self) -> VaultResult<()> {
        let meta = tokio::fs::metadata(&self.root)
            .await
            .map_err(|e| StorageError::Backend(format!("{}: {e}", self.root.display())))?;
        if !meta.is_dir() {
            return Err(StorageError::Backend(format!("{} is not a directory", self.root.display())).into());
        }
        Ok(())
    }

    async fn save(&self, uri: &BlobUri, data: Bytes) -> VaultResult<BlobUri> {
        let path = self.resolve(uri)?;
        self.write_atomic(&path, &data).await?;
        debug!(uri = %uri, bytes = data.len(), "object written");
        Ok(uri.clone())
    }

    async fn load(&self, uri: &BlobUri) -> VaultResult<Bytes> {
        let path = self.resolve(uri)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ObjectNotFound { uri: uri.to_string() }.into())
            }
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    async fn delete(&self, uri: &BlobUri) -> VaultResult<()> {
        let path = self.resolve(uri)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(uri = %uri, "delete of missing object");
                Ok(())
            }
            Err(e) => Err(StorageError::from(e).into()),
        }
    }

    async fn exists(&self, uri: &BlobUri) -> VaultResult<bool> {
        let path = self.resolve(uri)?;
        Ok(tokio::fs::try_exists(&path).await.map_err(StorageError::from)?)
    }
}
