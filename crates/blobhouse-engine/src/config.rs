//! Engine configuration, loaded from TOML or JSON.

use blobhouse_core::{StorageIntent, VaultError, VaultResult};
use blobhouse_reduce::PipelineConfig;
use blobhouse_security::MasterKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Default environment variable holding the hex master key.
pub const DEFAULT_MASTER_KEY_ENV: &str = "BLOBHOUSE_MASTER_KEY";

/// Role granted READ on the default key at mount unless configured otherwise.
pub const DEFAULT_USER_ROLE: &str = "storage-user";

const DATABASE_FILE: &str = "blobhouse.db";
const OBJECTS_DIR: &str = "objects";
const KEY_FILE: &str = "keys.json";

/// Which metadata index backs the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetadataBackend {
    /// Let the runtime optimizer decide
    #[default]
    Auto,
    /// Volatile in-process index
    Memory,
    /// SQLite database file
    Sqlite,
}

/// Background garbage collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// Run the periodic task while mounted
    pub enabled: bool,
    /// Seconds between cycles
    pub interval_secs: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: 300,
        }
    }
}

/// Full engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Root directory for objects, the database and the key file
    pub root_path: Option<PathBuf>,
    /// Metadata index selection
    pub metadata_backend: MetadataBackend,
    /// Explicit database file; defaults to `<root_path>/blobhouse.db`
    pub database_path: Option<PathBuf>,
    /// Key id used for new encrypted writes
    pub default_key_id: String,
    /// Explicit key file; defaults to `<root_path>/keys.json` when a master key is present
    pub key_file: Option<PathBuf>,
    /// Environment variable holding the hex master key
    pub master_key_env: String,
    /// Roles granted READ on the default key at mount
    pub key_reader_roles: Vec<String>,
    /// Storage scheme per intent, overriding the runtime optimizer
    pub intent_backends: HashMap<StorageIntent, String>,
    /// Transform chain policy
    pub pipeline: PipelineConfig,
    /// Check bucket ACLs on store, retrieve and delete
    pub enforce_bucket_acl: bool,
    /// Background garbage collection
    pub gc: GcConfig,
    /// Largest accepted payload in bytes
    pub max_object_size: u64,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            root_path: None,
            metadata_backend: MetadataBackend::Auto,
            database_path: None,
            default_key_id: "default".to_string(),
            key_file: None,
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
            key_reader_roles: vec![DEFAULT_USER_ROLE.to_string()],
            intent_backends: HashMap::new(),
            pipeline: PipelineConfig::default(),
            enforce_bucket_acl: false,
            gc: GcConfig::default(),
            max_object_size: 1 << 30,
        }
    }
}

impl WarehouseConfig {
    /// Volatile configuration: memory index, memory storage, no root.
    pub fn ephemeral() -> Self {
        Self {
            metadata_backend: MetadataBackend::Memory,
            ..Self::default()
        }
    }

    /// Configuration rooted at `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self {
            root_path: Some(root.into()),
            ..Self::default()
        }
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => {
                let config: WarehouseConfig = toml::from_str(&contents)?;
                Ok(config)
            }
            "json" => {
                let config: WarehouseConfig = serde_json::from_str(&contents)?;
                Ok(config)
            }
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Reject settings that cannot be mounted.
    pub fn validate(&self) -> VaultResult<()> {
        if self.default_key_id.trim().is_empty() {
            return Err(VaultError::ConfigurationError("default_key_id must not be empty".into()));
        }
        if self.max_object_size == 0 {
            return Err(VaultError::ConfigurationError("max_object_size must be positive".into()));
        }
        if self.gc.enabled && self.gc.interval_secs == 0 {
            return Err(VaultError::ConfigurationError("gc.interval_secs must be positive".into()));
        }
        if self.metadata_backend == MetadataBackend::Sqlite && self.database_file().is_none() {
            return Err(VaultError::ConfigurationError(
                "sqlite metadata requires database_path or root_path".into(),
            ));
        }
        let wants_disk = self.intent_backends.values().any(|s| s == blobhouse_storage::FILE_SCHEME);
        if wants_disk && self.root_path.is_none() {
            return Err(VaultError::ConfigurationError(
                "file:// backend selected but root_path is not set".into(),
            ));
        }
        Ok(())
    }

    /// SQLite database location, if one can be derived.
    pub fn database_file(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(|| self.root_path.as_ref().map(|r| r.join(DATABASE_FILE)))
    }

    /// Directory of the local disk provider.
    pub fn objects_dir(&self) -> Option<PathBuf> {
        self.root_path.as_ref().map(|r| r.join(OBJECTS_DIR))
    }

    /// Key file location when keys are persisted.
    pub fn key_file_path(&self) -> Option<PathBuf> {
        self.key_file
            .clone()
            .or_else(|| self.root_path.as_ref().map(|r| r.join(KEY_FILE)))
    }

    /// Master key from the configured environment variable.
    pub fn master_key(&self) -> VaultResult<Option<MasterKey>> {
        MasterKey::from_env(&self.master_key_env)
    }
}
