//! Plugin registry: every loaded plugin indexed by id and by capability.
//!
//! Registration happens while the engine is unmounted. At mount the registry is completed with
//! the built-in plugins and frozen behind an `Arc`; there is no runtime unregistration.

use blobhouse_core::{
    AccessControl, Capability, CapabilityHandle, CapabilityKind, KeyStore, MetadataIndex, Plugin,
    PluginDescriptor, StorageCap, StorageProvider, TransformCap, TransformPlugin, VaultError,
    VaultResult,
};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// One plugin handed to the registry.
#[derive(Debug, Clone)]
pub struct PluginRegistration {
    /// Identity of the plugin
    pub descriptor: PluginDescriptor,
    /// Higher wins when several plugins offer the same capability
    pub priority: i32,
    /// Capabilities the plugin implements
    pub capabilities: Vec<CapabilityHandle>,
}

impl PluginRegistration {
    /// Registration with priority 0.
    pub fn new(descriptor: PluginDescriptor, capabilities: Vec<CapabilityHandle>) -> Self {
        Self {
            descriptor,
            priority: 0,
            capabilities,
        }
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add another capability of the same plugin.
    pub fn with_capability(mut self, handle: CapabilityHandle) -> Self {
        self.capabilities.push(handle);
        self
    }

    /// Single-capability registration of a storage provider.
    pub fn storage(provider: Arc<dyn StorageProvider>) -> Self {
        Self::new(provider.descriptor().clone(), vec![CapabilityHandle::Storage(provider)])
    }

    /// Single-capability registration of a transform.
    pub fn transform(transform: Arc<dyn TransformPlugin>) -> Self {
        Self::new(transform.descriptor().clone(), vec![CapabilityHandle::Transform(transform)])
    }

    /// Single-capability registration of a metadata index.
    pub fn metadata(index: Arc<dyn MetadataIndex>) -> Self {
        Self::new(index.descriptor().clone(), vec![CapabilityHandle::Metadata(index)])
    }

    /// Single-capability registration of an access control provider.
    pub fn access_control(acl: Arc<dyn AccessControl>) -> Self {
        Self::new(acl.descriptor().clone(), vec![CapabilityHandle::AccessControl(acl)])
    }

    /// Single-capability registration of a key store.
    pub fn key_store(store: Arc<dyn KeyStore>) -> Self {
        Self::new(store.descriptor().clone(), vec![CapabilityHandle::KeyStore(store)])
    }
}

#[derive(Debug, Clone)]
struct Entry {
    descriptor: PluginDescriptor,
    priority: i32,
    capabilities: Vec<CapabilityHandle>,
}

/// Registered plugins in registration order.
#[derive(Debug, Clone, Default)]
pub struct PluginRegistry {
    entries: Vec<Entry>,
    by_id: HashMap<String, usize>,
}

impl PluginRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a plugin.
    ///
    /// An empty id, a malformed version or a registration without capabilities is a
    /// `ValidationFailure`; a duplicate id is a `ConfigurationError`.
    pub fn register(&mut self, registration: PluginRegistration) -> VaultResult<()> {
        let PluginRegistration {
            descriptor,
            priority,
            capabilities,
        } = registration;
        descriptor.validate()?;
        if capabilities.is_empty() {
            return Err(VaultError::ValidationFailure(format!(
                "plugin {} exposes no capability",
                descriptor.id
            )));
        }
        if self.by_id.contains_key(&descriptor.id) {
            return Err(VaultError::ConfigurationError(format!(
                "duplicate plugin id '{}'",
                descriptor.id
            )));
        }
        debug!(
            id = %descriptor.id,
            priority,
            capabilities = ?capabilities.iter().map(|c| c.kind()).collect::<Vec<_>>(),
            "plugin registered"
        );
        self.by_id.insert(descriptor.id.clone(), self.entries.len());
        self.entries.push(Entry {
            descriptor,
            priority,
            capabilities,
        });
        Ok(())
    }

    /// True if a plugin with this id is registered.
    pub fn contains(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    /// Number of registered plugins.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Descriptors in registration order.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        self.entries.iter().map(|e| e.descriptor.clone()).collect()
    }

    /// True if at least one plugin offers `kind`.
    pub fn has_capability(&self, kind: CapabilityKind) -> bool {
        self.entries
            .iter()
            .any(|e| e.capabilities.iter().any(|c| c.kind() == kind))
    }

    fn ranked(&self) -> Vec<&Entry> {
        let mut ranked: Vec<&Entry> = self.entries.iter().collect();
        // Stable: equal priorities keep registration order.
        ranked.sort_by(|a, b| b.priority.cmp(&a.priority));
        ranked
    }

    /// Every handle of capability `C`, highest priority first.
    pub fn resolve<C: Capability>(&self) -> Vec<Arc<C::Handle>> {
        self.ranked()
            .into_iter()
            .flat_map(|e| e.capabilities.iter())
            .filter(|h| h.kind() == C::KIND)
            .filter_map(C::extract)
            .collect()
    }

    /// Highest priority handle of capability `C` whose plugin id or tags match `id_or_tag`.
    pub fn resolve_one<C: Capability>(&self, id_or_tag: &str) -> Option<Arc<C::Handle>> {
        self.ranked()
            .into_iter()
            .filter(|e| e.descriptor.matches(id_or_tag))
            .flat_map(|e| e.capabilities.iter())
            .find_map(C::extract)
    }

    /// Storage provider serving `scheme`.
    pub fn storage_for_scheme(&self, scheme: &str) -> Option<Arc<dyn StorageProvider>> {
        self.resolve::<StorageCap>()
            .into_iter()
            .find(|p| p.scheme() == scheme)
    }

    /// Transform whose own id is `id`. Used when replaying a recorded chain.
    pub fn transform(&self, id: &str) -> Option<Arc<dyn TransformPlugin>> {
        self.resolve::<TransformCap>()
            .into_iter()
            .find(|t| t.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blobhouse_core::{KeyStoreCap, MetadataCap, PluginCategory};
    use blobhouse_meta::MemoryMetadataIndex;
    use blobhouse_reduce::{CompressionTransform, EncryptionTransform};
    use blobhouse_storage::MemoryProvider;

    fn descriptor(id: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, id, "1.0.0", PluginCategory::Feature)
    }

    #[test]
    fn duplicate_id_is_configuration_error() {
        let mut reg = PluginRegistry::new();
        reg.register(PluginRegistration::transform(Arc::new(CompressionTransform::lz4())))
            .unwrap();
        let err = reg
            .register(PluginRegistration::transform(Arc::new(CompressionTransform::lz4())))
            .unwrap_err();
        assert!(matches!(err, VaultError::ConfigurationError(_)));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn empty_id_and_no_capability_are_validation_failures() {
        let mut reg = PluginRegistry::new();
        let index: Arc<dyn MetadataIndex> = Arc::new(MemoryMetadataIndex::new());
        let err = reg
            .register(PluginRegistration::new(
                descriptor(""),
                vec![CapabilityHandle::Metadata(index)],
            ))
            .unwrap_err();
        assert!(matches!(err, VaultError::ValidationFailure(_)));

        let err = reg
            .register(PluginRegistration::new(descriptor("bare"), vec![]))
            .unwrap_err();
        assert!(matches!(err, VaultError::ValidationFailure(_)));
        assert!(reg.is_empty());
    }

    #[test]
    fn resolve_orders_by_priority_then_registration() {
        let mut reg = PluginRegistry::new();
        reg.register(PluginRegistration::transform(Arc::new(CompressionTransform::lz4())))
            .unwrap();
        reg.register(PluginRegistration::transform(Arc::new(EncryptionTransform::aes_gcm())))
            .unwrap();
        reg.register(
            PluginRegistration::transform(Arc::new(CompressionTransform::zstd(3))).with_priority(10),
        )
        .unwrap();
        let ids: Vec<String> = reg
            .resolve::<TransformCap>()
            .iter()
            .map(|t| t.id().to_string())
            .collect();
        assert_eq!(ids, ["zstd", "lz4", "aes-256-gcm"]);
    }

    #[test]
    fn resolve_one_by_id_or_tag() {
        let mut reg = PluginRegistry::new();
        reg.register(PluginRegistration::storage(Arc::new(MemoryProvider::new())))
            .unwrap();
        reg.register(PluginRegistration::transform(Arc::new(CompressionTransform::lz4())))
            .unwrap();
        reg.register(
            PluginRegistration::transform(Arc::new(CompressionTransform::zstd(3))).with_priority(5),
        )
        .unwrap();

        let by_tag = reg.resolve_one::<TransformCap>("compression").unwrap();
        assert_eq!(by_tag.id(), "zstd");
        let by_id = reg.resolve_one::<TransformCap>("lz4").unwrap();
        assert_eq!(by_id.id(), "lz4");
        assert!(reg.resolve_one::<StorageCap>("compression").is_none());
        assert!(reg.resolve_one::<KeyStoreCap>("anything").is_none());
        assert_eq!(reg.storage_for_scheme("mem").unwrap().scheme(), "mem");
        assert!(reg.storage_for_scheme("file").is_none());
    }

    #[test]
    fn one_plugin_many_capabilities() {
        let index = Arc::new(MemoryMetadataIndex::new());
        let provider = Arc::new(MemoryProvider::new());
        let mut reg = PluginRegistry::new();
        reg.register(
            PluginRegistration::new(descriptor("combo"), vec![CapabilityHandle::Metadata(index)])
                .with_capability(CapabilityHandle::Storage(provider)),
        )
        .unwrap();
        assert_eq!(reg.resolve::<MetadataCap>().len(), 1);
        assert_eq!(reg.resolve::<StorageCap>().len(), 1);
        assert!(reg.has_capability(CapabilityKind::Storage));
        assert!(!reg.has_capability(CapabilityKind::KeyStore));
        assert!(reg.contains("combo"));
        assert_eq!(reg.descriptors()[0].id, "combo");
    }
}
