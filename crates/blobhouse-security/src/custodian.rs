//! Key custodian: named, versioned keys whose every read is gated by access control.
//!
//! Rotations of one key id are serialized by a per-id async mutex; readers take a short
//! synchronous read lock and clone the record they need, so they observe either the old or
//! the new generation. Superseded generations are kept so older blobs stay readable.
//!
//! With a key file and a master key configured, every generation is persisted wrapped (see
//! [`crate::envelope`]) in a JSON file. A new generation is written to that file atomically
//! before any reader can see it.

use crate::envelope::{self, MasterKey, WrappedKey};
use async_trait::async_trait;
use blobhouse_core::{
    AccessControl, KeyMaterial, KeyRecord, KeyStore, Permissions, Plugin, PluginCategory,
    PluginDescriptor, ResourcePath, SecurityContext, VaultError, VaultResult,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Plugin id of the built-in key custodian.
pub const CUSTODIAN_PLUGIN_ID: &str = "key-custodian";

const KEY_FILE_VERSION: u32 = 1;

#[derive(Default)]
struct KeySlot {
    rotation: Mutex<()>,
    generations: RwLock<Vec<KeyRecord>>,
}

impl KeySlot {
    fn current(&self) -> Option<KeyRecord> {
        self.generations.read().last().cloned()
    }

    fn generation(&self, generation: u32) -> Option<KeyRecord> {
        self.generations
            .read()
            .iter()
            .find(|r| r.generation == generation)
            .cloned()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedKey {
    key_id: String,
    generation: u32,
    created_at: DateTime<Utc>,
    wrapped: WrappedKey,
}

#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    version: u32,
    keys: Vec<PersistedKey>,
}

struct Persistence {
    path: PathBuf,
    master: MasterKey,
    write_lock: Mutex<()>,
}

/// Key store backed by memory, optionally persisted to an envelope-encrypted key file.
pub struct KeyCustodian {
    descriptor: PluginDescriptor,
    acl: Arc<dyn AccessControl>,
    current_key_id: String,
    slots: DashMap<String, Arc<KeySlot>>,
    persistence: Option<Persistence>,
}

impl KeyCustodian {
    /// Volatile custodian: keys are lost when the process exits.
    pub fn volatile(acl: Arc<dyn AccessControl>, current_key_id: impl Into<String>) -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                CUSTODIAN_PLUGIN_ID,
                "Key custodian",
                "1.0.0",
                PluginCategory::Security,
            )
            .with_tags(["key-store", "volatile"]),
            acl,
            current_key_id: current_key_id.into(),
            slots: DashMap::new(),
            persistence: None,
        }
    }

    /// Custodian persisting wrapped keys at `path`.
    pub fn persistent(
        acl: Arc<dyn AccessControl>,
        current_key_id: impl Into<String>,
        path: impl Into<PathBuf>,
        master: MasterKey,
    ) -> Self {
        let mut custodian = Self::volatile(acl, current_key_id);
        custodian.descriptor = custodian.descriptor.clone().with_tags(["durable"]);
        custodian.descriptor.tags.remove("volatile");
        custodian.persistence = Some(Persistence {
            path: path.into(),
            master,
            write_lock: Mutex::new(()),
        });
        custodian
    }

    /// True if keys survive a restart.
    pub fn is_durable(&self) -> bool {
        self.persistence.is_some()
    }

    /// Key file location, if persistent.
    pub fn key_file(&self) -> Option<&Path> {
        self.persistence.as_ref().map(|p| p.path.as_path())
    }

    /// Number of generations held for `key_id` (not gated; used by health and tests).
    pub fn generation_count(&self, key_id: &str) -> usize {
        self.slots
            .get(key_id)
            .map(|s| s.generations.read().len())
            .unwrap_or(0)
    }

    fn authorize(&self, key_id: &str, ctx: &SecurityContext, requested: Permissions) -> VaultResult<()> {
        if self.acl.check(&ResourcePath::key(key_id), ctx, requested) {
            Ok(())
        } else {
            warn!(key_id, identity = %ctx.identity, requested = %requested, "key access denied");
            Err(VaultError::AccessDenied)
        }
    }

    fn slot(&self, key_id: &str) -> Option<Arc<KeySlot>> {
        self.slots.get(key_id).map(|s| Arc::clone(s.value()))
    }

    /// Persist the key file with `record` included, then publish `record` to readers.
    ///
    /// Readers never see a generation the key file does not hold.
    async fn commit_generation(&self, slot: &KeySlot, record: KeyRecord) -> VaultResult<()> {
        let Some(p) = &self.persistence else {
            slot.generations.write().push(record);
            return Ok(());
        };
        let _guard = p.write_lock.lock().await;

        let mut records: Vec<KeyRecord> = self
            .slots
            .iter()
            .flat_map(|entry| entry.value().generations.read().clone())
            .collect();
        records.push(record.clone());
        let mut keys = Vec::with_capacity(records.len());
        for record in &records {
            keys.push(PersistedKey {
                wrapped: envelope::wrap(&p.master, &record.key_id, record.generation, &record.material)?,
                key_id: record.key_id.clone(),
                generation: record.generation,
                created_at: record.created_at,
            });
        }
        keys.sort_by(|a, b| (&a.key_id, a.generation).cmp(&(&b.key_id, b.generation)));

        let body = serde_json::to_vec_pretty(&KeyFile {
            version: KEY_FILE_VERSION,
            keys,
        })
        .map_err(|e| VaultError::BackendUnavailable(format!("encode key file: {e}")))?;
        Self::write_key_file(&p.path, &body).await?;
        slot.generations.write().push(record);
        Ok(())
    }

    async fn write_key_file(path: &Path, body: &[u8]) -> VaultResult<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| VaultError::BackendUnavailable(format!("create key dir: {e}")))?;
            }
        }
        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| VaultError::BackendUnavailable(format!("write key file: {e}")))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(VaultError::BackendUnavailable(format!("replace key file: {e}")));
        }
        debug!(path = %path.display(), "key file written");
        Ok(())
    }

    async fn load(&self) -> VaultResult<()> {
        let Some(p) = &self.persistence else {
            return Ok(());
        };
        let raw = match tokio::fs::read(&p.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %p.path.display(), "no key file yet");
                return Ok(());
            }
            Err(e) => {
                return Err(VaultError::BackendUnavailable(format!("read key file: {e}")));
            }
        };
        let file: KeyFile = serde_json::from_slice(&raw)
            .map_err(|e| VaultError::Corruption(format!("key file: {e}")))?;
        if file.version != KEY_FILE_VERSION {
            return Err(VaultError::ConfigurationError(format!(
                "unsupported key file version {}",
                file.version
            )));
        }

        let mut grouped: std::collections::BTreeMap<String, Vec<KeyRecord>> = Default::default();
        for k in file.keys {
            let material = envelope::unwrap(&p.master, &k.key_id, k.generation, &k.wrapped)?;
            grouped.entry(k.key_id.clone()).or_default().push(KeyRecord {
                key_id: k.key_id,
                generation: k.generation,
                material,
                created_at: k.created_at,
            });
        }
        self.slots.clear();
        let mut total = 0;
        for (key_id, mut records) in grouped {
            records.sort_by_key(|r| r.generation);
            total += records.len();
            let slot = KeySlot {
                rotation: Mutex::new(()),
                generations: RwLock::new(records),
            };
            self.slots.insert(key_id, Arc::new(slot));
        }
        info!(path = %p.path.display(), key_ids = self.slots.len(), generations = total, "key file loaded");
        Ok(())
    }
}

impl Plugin for KeyCustodian {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

#[async_trait]
impl KeyStore for KeyCustodian {
    async fn open(&self) -> VaultResult<()> {
        self.load().await
    }

    async fn close(&self) -> VaultResult<()> {
        Ok(())
    }

    async fn health(&self) -> VaultResult<()> {
        if let Some(p) = &self.persistence {
            if let Some(parent) = p.path.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::metadata(parent).await.map_err(|e| {
                    VaultError::BackendUnavailable(format!("key directory unreachable: {e}"))
                })?;
            }
        }
        Ok(())
    }

    async fn get_key(&self, key_id: &str, ctx: &SecurityContext) -> VaultResult<KeyRecord> {
        self.authorize(key_id, ctx, Permissions::READ)?;
        self.slot(key_id)
            .and_then(|s| s.current())
            .ok_or_else(|| VaultError::NotFound(format!("key {key_id}")))
    }

    async fn get_key_generation(
        &self,
        key_id: &str,
        generation: u32,
        ctx: &SecurityContext,
    ) -> VaultResult<KeyRecord> {
        self.authorize(key_id, ctx, Permissions::READ)?;
        self.slot(key_id)
            .and_then(|s| s.generation(generation))
            .ok_or_else(|| VaultError::NotFound(format!("key {key_id} generation {generation}")))
    }

    async fn create_key(&self, key_id: &str, ctx: &SecurityContext) -> VaultResult<KeyRecord> {
        self.authorize(key_id, ctx, Permissions::WRITE)?;
        if key_id.trim().is_empty() {
            return Err(VaultError::ValidationFailure("key id must not be empty".into()));
        }
        let slot = Arc::clone(
            self.slots
                .entry(key_id.to_string())
                .or_insert_with(|| Arc::new(KeySlot::default()))
                .value(),
        );
        let _rotation = slot.rotation.lock().await;

        let next = slot.current().map(|r| r.generation + 1).unwrap_or(1);
        let record = KeyRecord {
            key_id: key_id.to_string(),
            generation: next,
            material: KeyMaterial::random(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.commit_generation(&slot, record.clone()).await {
            warn!(key_id, generation = next, error = %e, "key rotation not persisted");
            return Err(e);
        }
        info!(key_id, generation = next, "key generation created");
        Ok(record)
    }

    async fn current_key_id(&self) -> VaultResult<String> {
        Ok(self.current_key_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acl::MemoryAccessControl;
    use blobhouse_core::Subject;

    fn custodian() -> (Arc<MemoryAccessControl>, KeyCustodian) {
        let acl = Arc::new(MemoryAccessControl::new());
        let c = KeyCustodian::volatile(acl.clone(), "k1");
        (acl, c)
    }

    fn master() -> MasterKey {
        MasterKey::new(KeyMaterial([5u8; 32]))
    }

    #[tokio::test]
    async fn denied_then_granted() {
        let (acl, c) = custodian();
        c.create_key("k1", &SecurityContext::system()).await.unwrap();

        let alice = SecurityContext::user("alice");
        assert!(matches!(c.get_key("k1", &alice).await, Err(VaultError::AccessDenied)));

        acl.set_permissions(
            &ResourcePath::key("k1"),
            &Subject::user("alice"),
            Permissions::READ,
            Permissions::NONE,
        );
        let rec = c.get_key("k1", &alice).await.unwrap();
        assert_eq!(rec.key_id, "k1");
        assert_eq!(rec.generation, 1);
    }

    #[tokio::test]
    async fn denial_does_not_reveal_existence() {
        let (_, c) = custodian();
        let eve = SecurityContext::user("eve");
        assert!(matches!(c.get_key("ghost", &eve).await, Err(VaultError::AccessDenied)));
        assert!(matches!(
            c.get_key("ghost", &SecurityContext::system()).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rotation_keeps_old_generations() {
        let (_, c) = custodian();
        let sys = SecurityContext::system();
        let g1 = c.create_key("k1", &sys).await.unwrap();
        let g2 = c.create_key("k1", &sys).await.unwrap();
        assert_eq!(g2.generation, 2);
        assert_ne!(g1.material, g2.material);
        assert_eq!(c.get_key("k1", &sys).await.unwrap().generation, 2);
        let old = c.get_key_generation("k1", 1, &sys).await.unwrap();
        assert_eq!(old.material, g1.material);
        assert!(matches!(
            c.get_key_generation("k1", 9, &sys).await,
            Err(VaultError::NotFound(_))
        ));
        assert_eq!(c.generation_count("k1"), 2);
    }

    #[tokio::test]
    async fn create_requires_write() {
        let (acl, c) = custodian();
        let bob = SecurityContext::user("bob");
        acl.set_permissions(&ResourcePath::key("k1"), &Subject::user("bob"), Permissions::READ, Permissions::NONE);
        assert!(matches!(c.create_key("k1", &bob).await, Err(VaultError::AccessDenied)));
    }

    #[tokio::test]
    async fn concurrent_rotations_produce_distinct_generations() {
        let (_, c) = custodian();
        let c = Arc::new(c);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let c = Arc::clone(&c);
            handles.push(tokio::spawn(async move {
                c.create_key("k1", &SecurityContext::system()).await.unwrap().generation
            }));
        }
        let mut gens = Vec::new();
        for h in handles {
            gens.push(h.await.unwrap());
        }
        gens.sort_unstable();
        assert_eq!(gens, (1..=16).collect::<Vec<u32>>());
    }

    #[tokio::test]
    async fn persisted_keys_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("custody.json");
        let acl: Arc<dyn AccessControl> = Arc::new(MemoryAccessControl::new());
        let sys = SecurityContext::system();

        let first = KeyCustodian::persistent(acl.clone(), "k1", &path, master());
        first.open().await.unwrap();
        let g1 = first.create_key("k1", &sys).await.unwrap();
        let g2 = first.create_key("k1", &sys).await.unwrap();
        assert!(first.is_durable());

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains(&hex::encode(g1.material.as_bytes())));

        let second = KeyCustodian::persistent(acl, "k1", &path, master());
        second.open().await.unwrap();
        assert_eq!(second.get_key("k1", &sys).await.unwrap().material, g2.material);
        assert_eq!(second.get_key_generation("k1", 1, &sys).await.unwrap().material, g1.material);
    }

    #[tokio::test]
    async fn wrong_master_key_fails_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.json");
        let acl: Arc<dyn AccessControl> = Arc::new(MemoryAccessControl::new());
        let first = KeyCustodian::persistent(acl.clone(), "k1", &path, master());
        first.create_key("k1", &SecurityContext::system()).await.unwrap();

        let other = KeyCustodian::persistent(acl, "k1", &path, MasterKey::new(KeyMaterial([6u8; 32])));
        assert!(matches!(other.open().await, Err(VaultError::Corruption(_))));
    }

    #[tokio::test]
    async fn failed_persist_rolls_back_generation() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let acl: Arc<dyn AccessControl> = Arc::new(MemoryAccessControl::new());
        let c = KeyCustodian::persistent(acl, "k1", blocker.join("custody.json"), master());
        assert!(c.create_key("k1", &SecurityContext::system()).await.is_err());
        assert_eq!(c.generation_count("k1"), 0);
    }

    #[tokio::test]
    async fn unpersisted_generation_is_never_served() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.json");
        let acl: Arc<dyn AccessControl> = Arc::new(MemoryAccessControl::new());
        let sys = SecurityContext::system();
        let c = Arc::new(KeyCustodian::persistent(acl, "k1", &path, master()));
        c.create_key("k1", &sys).await.unwrap();

        // A directory where the key file belongs makes the atomic rename fail.
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        std::fs::write(path.join("occupant"), b"x").unwrap();

        let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reader = {
            let (c, done) = (Arc::clone(&c), Arc::clone(&done));
            tokio::spawn(async move {
                let mut seen = std::collections::BTreeSet::new();
                while !done.load(std::sync::atomic::Ordering::SeqCst) {
                    seen.insert(c.get_key("k1", &SecurityContext::system()).await.unwrap().generation);
                    tokio::task::yield_now().await;
                }
                seen
            })
        };
        assert!(c.create_key("k1", &sys).await.is_err());
        done.store(true, std::sync::atomic::Ordering::SeqCst);

        assert_eq!(reader.await.unwrap(), std::collections::BTreeSet::from([1]));
        assert_eq!(c.generation_count("k1"), 1);
        assert_eq!(c.get_key("k1", &sys).await.unwrap().generation, 1);
    }

    #[tokio::test]
    async fn current_key_id_is_ungated() {
        let (_, c) = custodian();
        assert_eq!(c.current_key_id().await.unwrap(), "k1");
    }
}
