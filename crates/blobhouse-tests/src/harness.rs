//! Test Harness - isolated warehouse environments on a temp directory

use blobhouse_core::{OperationContext, SecurityContext};
use blobhouse_engine::{DataWarehouse, PluginRegistration, WarehouseConfig, DEFAULT_USER_ROLE};
use blobhouse_security::{KeyCustodian, MasterKey, MemoryAccessControl};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// Master key every persistent test custodian is wrapped with.
pub const TEST_MASTER_KEY: &str = "5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a";

/// A warehouse root that lives as long as the value.
#[derive(Debug)]
pub struct TestEnv {
    temp_dir: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        Self {
            temp_dir: tempfile::tempdir().expect("failed to create temp dir"),
        }
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root().join("objects")
    }

    /// Rooted config: SQLite metadata and dedup, `file://` for durable data.
    pub fn config(&self) -> WarehouseConfig {
        WarehouseConfig::rooted(self.root())
    }

    /// Unmounted engine whose keys persist under the root, wrapped with [`TEST_MASTER_KEY`].
    pub fn engine_with(&self, config: WarehouseConfig) -> DataWarehouse {
        let acl = Arc::new(MemoryAccessControl::new());
        let master = MasterKey::from_hex(TEST_MASTER_KEY).expect("valid test master key");
        let keys = KeyCustodian::persistent(
            acl.clone(),
            config.default_key_id.clone(),
            self.root().join("keys.json"),
            master,
        );
        let engine = DataWarehouse::new(config);
        engine
            .register_plugin(PluginRegistration::access_control(acl))
            .expect("register acl");
        engine
            .register_plugin(PluginRegistration::key_store(Arc::new(keys)))
            .expect("register key custodian");
        engine
    }

    pub fn engine(&self) -> DataWarehouse {
        self.engine_with(self.config())
    }

    pub async fn mounted(&self) -> DataWarehouse {
        let engine = self.engine();
        engine.mount().await.expect("mount");
        engine
    }

    /// Physical files under the local disk provider's directory.
    pub fn object_files(&self) -> usize {
        fn walk(dir: &Path) -> usize {
            let Ok(entries) = std::fs::read_dir(dir) else {
                return 0;
            };
            entries
                .flatten()
                .map(|e| {
                    let path = e.path();
                    if path.is_dir() {
                        walk(&path)
                    } else {
                        1
                    }
                })
                .sum()
        }
        walk(&self.objects_dir())
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordinary caller holding the default user role.
pub fn user(name: &str) -> OperationContext {
    OperationContext::new(SecurityContext::user(name).with_role(DEFAULT_USER_ROLE))
}

/// The engine's own administrative identity.
pub fn admin() -> OperationContext {
    OperationContext::system()
}
