//! Plugin identity and the capability contracts a plugin may implement.
//!
//! A plugin exposes one or more capabilities. The registry stores each capability as a
//! [`CapabilityHandle`] variant and resolves by [`Capability`] marker type, so lookup is
//! a table walk rather than a downcast.

use crate::context::{SecurityContext, Subject};
use crate::error::{VaultError, VaultResult};
use crate::keys::KeyRecord;
use crate::permissions::Permissions;
use crate::types::{BlobHeader, BlobMetadata, BlobUri, ContentHash, TransformArgs};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

/// Broad plugin category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PluginCategory {
    /// Physical byte storage
    Storage,
    /// Reversible byte transform
    Transform,
    /// Metadata index
    Metadata,
    /// Access control or key custody
    Security,
    /// Anything else
    Feature,
}

/// Immutable identity of a plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginDescriptor {
    /// Globally unique id
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Semantic version (`major.minor.patch`)
    pub version: String,
    /// Category
    pub category: PluginCategory,
    /// Capability tags, used for resolution by tag
    pub tags: BTreeSet<String>,
}

impl PluginDescriptor {
    /// Descriptor with no tags.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        category: PluginCategory,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            version: version.into(),
            category,
            tags: BTreeSet::new(),
        }
    }

    /// Add tags.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// True if the id equals `id_or_tag` or the tags contain it.
    pub fn matches(&self, id_or_tag: &str) -> bool {
        self.id == id_or_tag || self.tags.contains(id_or_tag)
    }

    /// Check id and version shape.
    pub fn validate(&self) -> VaultResult<()> {
        if self.id.trim().is_empty() {
            return Err(VaultError::ValidationFailure(
                "plugin id must not be empty".into(),
            ));
        }
        let parts: Vec<&str> = self.version.split('.').collect();
        let numeric = parts.len() == 3 && parts.iter().all(|p| p.parse::<u64>().is_ok());
        if !numeric {
            return Err(VaultError::ValidationFailure(format!(
                "plugin {} has non-semver version '{}'",
                self.id, self.version
            )));
        }
        Ok(())
    }
}

/// Base trait of every plugin.
pub trait Plugin: Send + Sync {
    /// Identity, queried by the registry.
    fn descriptor(&self) -> &PluginDescriptor;

    /// Shorthand for `descriptor().id`.
    fn id(&self) -> &str {
        &self.descriptor().id
    }
}

/// What a transform does, used by the pipeline optimizer to order steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransformRole {
    /// Size reduction; runs before encryption
    Compression,
    /// Confidentiality; runs last
    Encryption,
    /// Anything else
    Other,
}

impl TransformRole {
    /// Tag carried by transforms of this role.
    pub fn tag(&self) -> &'static str {
        match self {
            TransformRole::Compression => "compression",
            TransformRole::Encryption => "encryption",
            TransformRole::Other => "transform",
        }
    }
}

/// Per-call inputs a transform may need that are not recorded in the chain.
#[derive(Debug, Clone)]
pub struct TransformContext {
    /// Hash of the original content
    pub content_hash: ContentHash,
    /// Key resolved by the engine for keyed transforms
    pub key: Option<KeyRecord>,
}

impl TransformContext {
    /// Context without key material.
    pub fn unkeyed(content_hash: ContentHash) -> Self {
        Self {
            content_hash,
            key: None,
        }
    }
}

/// Reversible byte transform (compression, encryption).
///
/// `reverse` must invert `apply` for the same args and, for keyed transforms, the same
/// resolved key. `apply` output may differ between calls (encryption draws fresh nonces).
#[async_trait]
pub trait TransformPlugin: Plugin {
    /// Role, used for ordering.
    fn role(&self) -> TransformRole;

    /// True if the engine must resolve a key before running this transform.
    fn requires_key(&self) -> bool {
        false
    }

    /// Arguments used when the optimizer adds this transform without explicit ones.
    fn default_args(&self) -> TransformArgs {
        TransformArgs::new()
    }

    /// Write direction.
    async fn apply(
        &self,
        input: Bytes,
        args: &TransformArgs,
        ctx: &TransformContext,
    ) -> VaultResult<Bytes>;

    /// Read direction; inverse of [`apply`](Self::apply).
    async fn reverse(
        &self,
        input: Bytes,
        args: &TransformArgs,
        ctx: &TransformContext,
    ) -> VaultResult<Bytes>;
}

/// Physical byte storage addressed by URI.
#[async_trait]
pub trait StorageProvider: Plugin {
    /// URI scheme served by this provider.
    fn scheme(&self) -> &str;

    /// Whether data survives a process restart.
    fn is_durable(&self) -> bool;

    /// Fresh URI for new bytes of the given content.
    fn mint_uri(&self, content_hash: &ContentHash) -> BlobUri;

    /// Prepare the backend. Idempotent.
    async fn open(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Release the backend. Idempotent.
    async fn close(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Reachability probe.
    async fn health(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Persist bytes. Returns the URI actually written, which content-addressed backends
    /// derive from the bytes instead of using `uri`.
    async fn save(&self, uri: &BlobUri, data: Bytes) -> VaultResult<BlobUri>;

    /// Fetch bytes. Missing object is [`VaultError::NotFound`].
    async fn load(&self, uri: &BlobUri) -> VaultResult<Bytes>;

    /// Remove bytes. Append-only backends return [`VaultError::NotSupported`].
    async fn delete(&self, uri: &BlobUri) -> VaultResult<()>;

    /// Existence check; may be optimistic under an eventually consistent backend.
    async fn exists(&self, uri: &BlobUri) -> VaultResult<bool>;
}

/// Mapping from (bucket, key) to blob metadata.
#[async_trait]
pub trait MetadataIndex: Plugin {
    /// Whether entries survive a process restart.
    fn is_durable(&self) -> bool;

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

    /// Insert or replace metadata for its (bucket, key).
    async fn put(&self, metadata: &BlobMetadata) -> VaultResult<()>;

    /// Full metadata, including the decoded chain.
    async fn get(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobMetadata>>;

    /// Header only; never decodes the chain.
    async fn get_header(&self, bucket: &str, key: &str) -> VaultResult<Option<BlobHeader>>;

    /// Existence probe; never decodes the chain.
    async fn exists(&self, bucket: &str, key: &str) -> VaultResult<bool>;

    /// Remove an entry. Returns true if one was removed.
    async fn remove(&self, bucket: &str, key: &str) -> VaultResult<bool>;

    /// Headers in `bucket` whose key starts with `prefix`, sorted by key.
    async fn list(&self, bucket: &str, prefix: &str) -> VaultResult<Vec<BlobHeader>>;

    /// Every URI referenced by at least one entry.
    async fn referenced_uris(&self) -> VaultResult<HashSet<BlobUri>>;
}

/// Allow/deny rule store. Checks sit on the hot path and must be O(1) amortized.
pub trait AccessControl: Plugin {
    /// Replace the rule for (resource, subject).
    fn set_permissions(
        &self,
        resource: &str,
        subject: &Subject,
        allow: Permissions,
        deny: Permissions,
    );

    /// True if `subject` holds every bit of `requested` on `resource`.
    fn has_access(&self, resource: &str, subject: &Subject, requested: Permissions) -> bool;

    /// Initialize `resource` with `owner` granted full control.
    fn create_scope(&self, resource: &str, owner: &Subject);

    /// Evaluate a security context: admins pass, otherwise rules of the identity and all
    /// roles are unioned and deny wins.
    fn check(&self, resource: &str, ctx: &SecurityContext, requested: Permissions) -> bool;

    /// Drop every rule on `resource`. Returns true if any existed.
    fn remove_resource(&self, resource: &str) -> bool;
}

/// Key custody. Every key retrieval is gated by access control.
#[async_trait]
pub trait KeyStore: Plugin {
    /// Load persisted keys. Idempotent.
    async fn open(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Flush and release. Idempotent.
    async fn close(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Reachability probe.
    async fn health(&self) -> VaultResult<()> {
        Ok(())
    }

    /// Current generation of `key_id`. Requires READ on the key resource.
    async fn get_key(&self, key_id: &str, ctx: &SecurityContext) -> VaultResult<KeyRecord>;

    /// A specific (possibly superseded) generation. Requires READ on the key resource.
    async fn get_key_generation(
        &self,
        key_id: &str,
        generation: u32,
        ctx: &SecurityContext,
    ) -> VaultResult<KeyRecord>;

    /// Generate a new generation of `key_id`, retaining prior ones. Requires WRITE.
    async fn create_key(&self, key_id: &str, ctx: &SecurityContext) -> VaultResult<KeyRecord>;

    /// Key id new writes should use. Not gated.
    async fn current_key_id(&self) -> VaultResult<String>;
}

/// Capability kinds the registry indexes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CapabilityKind {
    /// [`StorageProvider`]
    Storage,
    /// [`TransformPlugin`]
    Transform,
    /// [`MetadataIndex`]
    Metadata,
    /// [`AccessControl`]
    AccessControl,
    /// [`KeyStore`]
    KeyStore,
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CapabilityKind::Storage => "storage",
            CapabilityKind::Transform => "transform",
            CapabilityKind::Metadata => "metadata",
            CapabilityKind::AccessControl => "access-control",
            CapabilityKind::KeyStore => "key-store",
        };
        f.write_str(name)
    }
}

/// One capability implementation of a plugin.
#[derive(Clone)]
pub enum CapabilityHandle {
    /// Storage provider
    Storage(Arc<dyn StorageProvider>),
    /// Transform
    Transform(Arc<dyn TransformPlugin>),
    /// Metadata index
    Metadata(Arc<dyn MetadataIndex>),
    /// Access control provider
    AccessControl(Arc<dyn AccessControl>),
    /// Key store
    KeyStore(Arc<dyn KeyStore>),
}

impl CapabilityHandle {
    /// Kind tag of this handle.
    pub fn kind(&self) -> CapabilityKind {
        match self {
            CapabilityHandle::Storage(_) => CapabilityKind::Storage,
            CapabilityHandle::Transform(_) => CapabilityKind::Transform,
            CapabilityHandle::Metadata(_) => CapabilityKind::Metadata,
            CapabilityHandle::AccessControl(_) => CapabilityKind::AccessControl,
            CapabilityHandle::KeyStore(_) => CapabilityKind::KeyStore,
        }
    }
}

impl fmt::Debug for CapabilityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CapabilityHandle::{}", self.kind())
    }
}

/// Marker type selecting one capability table in the registry.
pub trait Capability {
    /// Kind indexed by this marker.
    const KIND: CapabilityKind;
    /// Trait object type handed back on resolution.
    type Handle: ?Sized + Send + Sync;
    /// Pull the matching trait object out of a handle.
    fn extract(handle: &CapabilityHandle) -> Option<Arc<Self::Handle>>;
}

macro_rules! capability_marker {
    ($(#[$doc:meta])* $name:ident, $kind:ident, $variant:ident, $handle:ty) => {
        $(#[$doc])*
        pub struct $name;

        impl Capability for $name {
            const KIND: CapabilityKind = CapabilityKind::$kind;
            type Handle = $handle;

            fn extract(handle: &CapabilityHandle) -> Option<Arc<Self::Handle>> {
                match handle {
                    CapabilityHandle::$variant(h) => Some(Arc::clone(h)),
                    _ => None,
                }
            }
        }
    };
}

capability_marker!(
    /// Resolves [`StorageProvider`]s.
    StorageCap, Storage, Storage, dyn StorageProvider
);
capability_marker!(
    /// Resolves [`TransformPlugin`]s.
    TransformCap, Transform, Transform, dyn TransformPlugin
);
capability_marker!(
    /// Resolves [`MetadataIndex`]es.
    MetadataCap, Metadata, Metadata, dyn MetadataIndex
);
capability_marker!(
    /// Resolves [`AccessControl`] providers.
    AccessControlCap, AccessControl, AccessControl, dyn AccessControl
);
capability_marker!(
    /// Resolves [`KeyStore`]s.
    KeyStoreCap, KeyStore, KeyStore, dyn KeyStore
);
