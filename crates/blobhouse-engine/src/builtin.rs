//! Built-in plugins completing the user's registrations at mount.
//!
//! A built-in is only added when nothing registered already covers its id, its capability or
//! its URI scheme. Stateful built-ins (memory index and storage, dedup tables, ACL, key
//! custodian) are kept across remounts of one engine so volatile data outlives a dismount.

use crate::config::WarehouseConfig;
use crate::registry::{PluginRegistration, PluginRegistry};
use blobhouse_core::{
    AccessControl, AccessControlCap, CapabilityKind, StorageProvider, TransformPlugin,
    VaultError, VaultResult,
};
use blobhouse_meta::{MemoryMetadataIndex, SqliteDatabase, SqliteMetadataIndex};
use blobhouse_reduce::compression::DEFAULT_ZSTD_LEVEL;
use blobhouse_reduce::{CompressionTransform, EncryptionTransform, MemoryDedupTable};
use blobhouse_security::{KeyCustodian, MemoryAccessControl};
use blobhouse_storage::{LocalDiskProvider, MemoryProvider};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Priority of built-in plugins; user registrations at the default priority rank first.
pub const BUILTIN_PRIORITY: i32 = -100;

/// Stateful built-ins owned by one engine.
pub(crate) struct Builtins {
    pub acl: Arc<dyn AccessControl>,
    pub custodian: Arc<KeyCustodian>,
    pub memory_index: Arc<MemoryMetadataIndex>,
    pub memory_dedup: Arc<MemoryDedupTable>,
    /// Dedup entries of objects on non-durable backends
    pub volatile_dedup: Arc<MemoryDedupTable>,
    pub memory_storage: Arc<MemoryProvider>,
}

impl Builtins {
    /// Build from `config`. The custodian guards keys with the user's ACL if one is registered.
    pub fn new(config: &WarehouseConfig, registry: &PluginRegistry) -> VaultResult<Self> {
        let acl: Arc<dyn AccessControl> = match registry.resolve::<AccessControlCap>().into_iter().next() {
            Some(user) => user,
            None => Arc::new(MemoryAccessControl::new()),
        };

        // Unused when a key store is registered.
        let user_keys = registry.has_capability(CapabilityKind::KeyStore);
        let master = config.master_key()?;
        let custodian = match (master, config.key_file_path()) {
            _ if user_keys => KeyCustodian::volatile(Arc::clone(&acl), &config.default_key_id),
            (Some(master), Some(path)) => {
                info!(path = %path.display(), "persistent key custodian");
                KeyCustodian::persistent(Arc::clone(&acl), &config.default_key_id, path, master)
            }
            (None, _) if config.key_file.is_some() => {
                return Err(VaultError::ConfigurationError(format!(
                    "key_file is set but {} holds no master key",
                    config.master_key_env
                )));
            }
            (Some(_), None) => {
                warn!("master key present but no key file location; keys are volatile");
                KeyCustodian::volatile(Arc::clone(&acl), &config.default_key_id)
            }
            (None, _) if config.root_path.is_some() => {
                warn!(
                    env = %config.master_key_env,
                    "no master key; encryption keys will not survive a restart"
                );
                KeyCustodian::volatile(Arc::clone(&acl), &config.default_key_id)
            }
            (None, _) => {
                debug!("volatile key custodian");
                KeyCustodian::volatile(Arc::clone(&acl), &config.default_key_id)
            }
        };

        Ok(Self {
            acl,
            custodian: Arc::new(custodian),
            memory_index: Arc::new(MemoryMetadataIndex::new()),
            memory_dedup: Arc::new(MemoryDedupTable::new()),
            volatile_dedup: Arc::new(MemoryDedupTable::new()),
            memory_storage: Arc::new(MemoryProvider::new()),
        })
    }
}

/// The codecs and ciphers every engine ships with. Codecs refuse to inflate past `max_object_size`.
pub fn builtin_transforms(max_object_size: u64) -> Vec<Arc<dyn TransformPlugin>> {
    vec![
        Arc::new(CompressionTransform::zstd(DEFAULT_ZSTD_LEVEL).with_output_limit(max_object_size)),
        Arc::new(CompressionTransform::lz4().with_output_limit(max_object_size)),
        Arc::new(EncryptionTransform::aes_gcm()),
        Arc::new(EncryptionTransform::chacha20()),
    ]
}

fn add(registry: &mut PluginRegistry, registration: PluginRegistration) -> VaultResult<()> {
    if registry.contains(&registration.descriptor.id) {
        debug!(id = %registration.descriptor.id, "built-in shadowed by user plugin");
        return Ok(());
    }
    registry.register(registration.with_priority(BUILTIN_PRIORITY))
}

fn add_storage(registry: &mut PluginRegistry, provider: Arc<dyn StorageProvider>) -> VaultResult<()> {
    if registry.storage_for_scheme(provider.scheme()).is_some() {
        debug!(scheme = provider.scheme(), "built-in provider shadowed by user plugin");
        return Ok(());
    }
    add(registry, PluginRegistration::storage(provider))
}

/// Add the built-ins `registry` lacks. `database` is set when metadata lives in SQLite.
pub(crate) fn complete_registry(
    registry: &mut PluginRegistry,
    builtins: &Builtins,
    config: &WarehouseConfig,
    database: Option<&Arc<SqliteDatabase>>,
) -> VaultResult<()> {
    if !registry.has_capability(CapabilityKind::AccessControl) {
        add(registry, PluginRegistration::access_control(Arc::clone(&builtins.acl)))?;
    }
    if !registry.has_capability(CapabilityKind::KeyStore) {
        add(registry, PluginRegistration::key_store(builtins.custodian.clone()))?;
    }
    if !registry.has_capability(CapabilityKind::Metadata) {
        let index = match database {
            Some(db) => PluginRegistration::metadata(Arc::new(SqliteMetadataIndex::new(Arc::clone(db)))),
            None => PluginRegistration::metadata(builtins.memory_index.clone()),
        };
        add(registry, index)?;
    }
    for transform in builtin_transforms(config.max_object_size) {
        add(registry, PluginRegistration::transform(transform))?;
    }
    add_storage(registry, builtins.memory_storage.clone())?;
    if let Some(dir) = config.objects_dir() {
        add_storage(registry, Arc::new(LocalDiskProvider::new(dir)))?;
    }
    Ok(())
}
