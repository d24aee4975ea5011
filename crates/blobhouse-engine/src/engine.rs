//! The data warehouse engine: lifecycle, the store and retrieve pipelines, and the
//! administrative operations built on them.

use crate::builtin::{self, Builtins};
use crate::config::WarehouseConfig;
use crate::gc::{GarbageCollector, GcReport};
use crate::health::{HealthReport, HealthStatus};
use crate::locks::{HashGuard, HashLocks};
use crate::metrics::{EngineMetrics, MetricsSnapshot};
use crate::registry::{PluginRegistration, PluginRegistry};
use crate::runtime::{HostEnvironment, ResolvedMetadata, RuntimeOptimizer};
use blobhouse_core::{
    validate_bucket, validate_key, AccessControl, AccessControlCap, BlobHeader, BlobMetadata,
    BlobUri, CapabilityKind, ContentHash, DedupEntry, DedupRegistration, DedupTable, KeyRecord,
    KeyStore, KeyStoreCap, MetadataCap, MetadataIndex, OperationContext, Permissions, Plugin,
    PluginDescriptor, ResourcePath, SecurityContext, StorageCap, StorageIntent, StorageProvider,
    Subject, TransformCap, TransformChain, TransformContext, TransformPlugin, VaultError,
    VaultResult, ARG_KEY_GENERATION, ARG_KEY_ID, SYSTEM_IDENTITY,
};
use blobhouse_meta::{SqliteDatabase, SqliteDedupTable};
use blobhouse_reduce::{apply_chain, blake3_hash, read_and_hash, reverse_chain, PipelineOptimizer};
use blobhouse_security::{AuditAction, AuditEvent, AuditSink, TracingAuditSink};
use bytes::Bytes;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Payload prefix the pipeline optimizer inspects for compressibility.
const SAMPLE_LEN: usize = 4096;

/// Something opened at mount that must be closed at dismount.
enum Opened {
    Database(Arc<SqliteDatabase>),
    Index(Arc<dyn MetadataIndex>),
    Dedup(Arc<dyn DedupTable>),
    Keys(Arc<dyn KeyStore>),
    Storage(Arc<dyn StorageProvider>),
}

impl Opened {
    fn name(&self) -> String {
        match self {
            Opened::Database(db) => format!("database:{}", db.path().display()),
            Opened::Index(i) => format!("metadata:{}", i.id()),
            Opened::Dedup(d) => format!("dedup:{}", d.backend_name()),
            Opened::Keys(k) => format!("keys:{}", k.id()),
            Opened::Storage(s) => format!("storage:{}", s.scheme()),
        }
    }

    async fn close(&self) -> VaultResult<()> {
        match self {
            Opened::Database(db) => {
                db.close().await;
                Ok(())
            }
            Opened::Index(i) => i.close().await,
            Opened::Dedup(d) => d.close().await,
            Opened::Keys(k) => k.close().await,
            Opened::Storage(s) => s.close().await,
        }
    }
}

/// Close in reverse open order. Failures are logged and do not stop the rest.
async fn close_all(opened: &[Opened]) {
    for item in opened.iter().rev() {
        if let Err(e) = item.close().await {
            warn!(component = %item.name(), error = %e, "close failed");
        }
    }
}

/// Everything resolved for one mount.
struct Mounted {
    config: WarehouseConfig,
    registry: Arc<PluginRegistry>,
    index: Arc<dyn MetadataIndex>,
    /// Canonical copies on durable backends
    dedup: Arc<dyn DedupTable>,
    /// Canonical copies on volatile backends; never persisted
    volatile_dedup: Arc<dyn DedupTable>,
    keys: Arc<dyn KeyStore>,
    acl: Arc<dyn AccessControl>,
    transforms: Vec<Arc<dyn TransformPlugin>>,
    optimizer: PipelineOptimizer,
    backends: HashMap<StorageIntent, Arc<dyn StorageProvider>>,
    locks: HashLocks,
    /// Serializes metadata commits per (bucket, key)
    key_locks: HashLocks,
    /// Stores hold it shared until commit; GC and dismount take it exclusively.
    gate: Arc<tokio::sync::RwLock<()>>,
    gc: Arc<GarbageCollector>,
    gc_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    opened: Vec<Opened>,
}

impl Mounted {
    fn authorize_bucket(
        &self,
        bucket: &str,
        ctx: &SecurityContext,
        requested: Permissions,
    ) -> VaultResult<()> {
        if !self.config.enforce_bucket_acl {
            return Ok(());
        }
        if self.acl.check(&ResourcePath::bucket(bucket), ctx, requested) {
            Ok(())
        } else {
            warn!(bucket, identity = %ctx.identity, %requested, "bucket access denied");
            Err(VaultError::AccessDenied)
        }
    }

    /// Record the current key on every keyed step of `chain`; returns that key.
    async fn stamp_key(
        &self,
        chain: &mut TransformChain,
        ctx: &SecurityContext,
    ) -> VaultResult<Option<KeyRecord>> {
        let keyed: Vec<usize> = chain
            .records()
            .iter()
            .enumerate()
            .filter(|(_, r)| {
                self.registry
                    .transform(&r.transform_id)
                    .is_some_and(|t| t.requires_key())
            })
            .map(|(i, _)| i)
            .collect();
        if keyed.is_empty() {
            return Ok(None);
        }

        let key_id = self.keys.current_key_id().await?;
        let key = self.keys.get_key(&key_id, ctx).await?;
        for i in keyed {
            let args = &mut chain.records_mut()[i].args;
            args.insert(ARG_KEY_ID.to_string(), key.key_id.clone());
            args.insert(ARG_KEY_GENERATION.to_string(), key.generation.to_string());
        }
        Ok(Some(key))
    }

    fn backend(&self, intent: StorageIntent) -> VaultResult<Arc<dyn StorageProvider>> {
        self.backends.get(&intent).cloned().ok_or_else(|| {
            VaultError::ConfigurationError(format!("no storage backend for intent {intent}"))
        })
    }

    /// Table that tracks objects written to `provider`.
    fn dedup_for(&self, provider: &dyn StorageProvider) -> &Arc<dyn DedupTable> {
        if provider.is_durable() {
            &self.dedup
        } else {
            &self.volatile_dedup
        }
    }

    /// Canonical copy of `hash` that a store bound for `target` may reuse.
    ///
    /// Durable copies serve every intent, volatile copies only volatile targets. An entry whose
    /// bytes are gone is unregistered and the store writes afresh.
    async fn find_existing(
        &self,
        hash: &ContentHash,
        target: &dyn StorageProvider,
    ) -> VaultResult<Option<DedupEntry>> {
        let mut tables = vec![&self.dedup];
        if !target.is_durable() {
            tables.push(&self.volatile_dedup);
        }
        for table in tables {
            let Some(existing) = table.try_get_existing(hash).await? else {
                continue;
            };
            if self.still_present(&existing).await? {
                return Ok(Some(existing));
            }
            warn!(%hash, uri = %existing.uri, "dedup entry points at missing bytes, unregistered");
            table.unregister(hash, &existing.uri).await?;
        }
        Ok(None)
    }

    async fn still_present(&self, entry: &DedupEntry) -> VaultResult<bool> {
        match self.registry.storage_for_scheme(entry.uri.scheme()) {
            Some(provider) => provider.exists(&entry.uri).await,
            // The plugin serving this scheme may be registered again later.
            None => Ok(true),
        }
    }

    /// Encode `data` for `intent` and write it to `provider`.
    async fn encode_and_write(
        &self,
        ctx: &SecurityContext,
        hash: ContentHash,
        data: Bytes,
        intent: StorageIntent,
        provider: &Arc<dyn StorageProvider>,
    ) -> VaultResult<(DedupEntry, u64)> {
        let sample = &data[..data.len().min(SAMPLE_LEN)];
        let mut chain = self.optimizer.select(intent, &self.transforms, sample);
        let key = self.stamp_key(&mut chain, ctx).await?;

        let tctx = TransformContext {
            content_hash: hash,
            key,
        };
        let (encoded, stats) =
            apply_chain(&chain, data, &tctx, |id| self.registry.transform(id)).await?;

        let written = encoded.len() as u64;
        let uri = provider.save(&provider.mint_uri(&hash), encoded).await?;
        debug!(
            %uri,
            steps = chain.len(),
            input = stats.input_bytes,
            output = stats.output_bytes,
            "object written"
        );
        Ok((
            DedupEntry {
                content_hash: hash,
                uri,
                chain,
            },
            written,
        ))
    }
}

fn key_lock_id(bucket: &str, key: &str) -> ContentHash {
    blake3_hash(format!("{bucket}\0{key}").as_bytes())
}

/// Best-effort removal of bytes that will never be referenced.
async fn discard(provider: &Arc<dyn StorageProvider>, uri: &BlobUri) {
    match provider.delete(uri).await {
        Ok(()) => debug!(%uri, "discarded unreferenced write"),
        Err(VaultError::NotSupported(_)) => debug!(%uri, "append-only backend keeps discarded write"),
        Err(e) => warn!(%uri, error = %e, "failed to discard unreferenced write"),
    }
}

/// Everything a store does after hashing: dedup lookup, encode, write, register and commit.
///
/// Runs in its own task holding the store gate and the hash lock, so a caller dropping the
/// store future can neither orphan written bytes nor leave the dedup table and the index
/// half-updated.
struct StoreTask {
    mounted: Arc<Mounted>,
    security: SecurityContext,
    cancel: CancellationToken,
    hash: ContentHash,
    data: Bytes,
    intent: StorageIntent,
    bucket: String,
    key: String,
    trace_id: Uuid,
}

impl StoreTask {
    /// Returns the committed header and the encoded bytes written, zero on a dedup hit.
    async fn run(self) -> VaultResult<(Committed, u64)> {
        let m = &self.mounted;
        let size = self.data.len() as u64;
        let provider = m.backend(self.intent)?;
        let table = Arc::clone(m.dedup_for(provider.as_ref()));

        let (entry, written, written_bytes) =
            match m.find_existing(&self.hash, provider.as_ref()).await? {
                Some(existing) => {
                    debug!(hash = %self.hash, uri = %existing.uri, "dedup hit");
                    (existing, None, 0)
                }
                None => {
                    let (entry, bytes) = m
                        .encode_and_write(&self.security, self.hash, self.data, self.intent, &provider)
                        .await?;
                    (entry, Some(provider), bytes)
                }
            };

        if self.cancel.is_cancelled() {
            if let Some(provider) = &written {
                discard(provider, &entry.uri).await;
            }
            return Err(VaultError::Cancelled);
        }

        let commit = Commit {
            index: Arc::clone(&m.index),
            key_locks: m.key_locks.clone(),
            dedup: table,
            entry,
            written,
            bucket: self.bucket,
            key: self.key,
            size,
            owner: self.security.identity.clone(),
            trace_id: self.trace_id,
        };
        Ok((commit.run().await?, written_bytes))
    }
}

/// Registration and metadata commit of one store.
struct Commit {
    index: Arc<dyn MetadataIndex>,
    key_locks: HashLocks,
    dedup: Arc<dyn DedupTable>,
    entry: DedupEntry,
    /// Set when this store wrote new bytes
    written: Option<Arc<dyn StorageProvider>>,
    bucket: String,
    key: String,
    size: u64,
    owner: String,
    trace_id: Uuid,
}

struct Committed {
    header: BlobHeader,
    dedup_hit: bool,
}

impl Commit {
    async fn run(self) -> VaultResult<Committed> {
        let (entry, inserted) = match &self.written {
            None => (self.entry.clone(), false),
            Some(provider) => match self.dedup.register(self.entry.clone()).await {
                Ok(DedupRegistration::Inserted(e)) => (e, true),
                Ok(DedupRegistration::Existing(canonical)) => {
                    debug!(hash = %canonical.content_hash, uri = %canonical.uri, "adopted concurrent writer");
                    discard(provider, &self.entry.uri).await;
                    (canonical, false)
                }
                Err(e) => {
                    discard(provider, &self.entry.uri).await;
                    return Err(e);
                }
            },
        };

        let _key = self.key_locks.acquire(key_lock_id(&self.bucket, &self.key)).await;
        match self.put_metadata(&entry).await {
            Ok(header) => Ok(Committed {
                header,
                dedup_hit: !inserted,
            }),
            Err(e) => {
                if inserted {
                    if let Err(u) = self.dedup.unregister(&entry.content_hash, &entry.uri).await {
                        warn!(uri = %entry.uri, error = %u, "rollback unregister failed");
                    }
                    if let Some(provider) = &self.written {
                        discard(provider, &entry.uri).await;
                    }
                }
                Err(e)
            }
        }
    }

    async fn put_metadata(&self, entry: &DedupEntry) -> VaultResult<BlobHeader> {
        let previous = self.index.get_header(&self.bucket, &self.key).await?;
        let now = Utc::now();
        let header = BlobHeader {
            bucket: self.bucket.clone(),
            key: self.key.clone(),
            content_hash: entry.content_hash,
            size: self.size,
            uri: entry.uri.clone(),
            owner: self.owner.clone(),
            created_at: previous.map(|p| p.created_at).unwrap_or(now),
            modified_at: now,
            trace_id: self.trace_id,
        };
        self.index
            .put(&BlobMetadata {
                header: header.clone(),
                chain: entry.chain.clone(),
            })
            .await?;
        Ok(header)
    }
}

/// Pluggable blob storage engine.
///
/// Plugins are registered while unmounted. [`mount`](Self::mount) completes the registry with
/// built-ins, opens every store and starts background GC; [`dismount`](Self::dismount) waits
/// for in-flight stores and closes everything in reverse order.
pub struct DataWarehouse {
    config: RwLock<WarehouseConfig>,
    registrations: Mutex<PluginRegistry>,
    builtins: Mutex<Option<Arc<Builtins>>>,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<EngineMetrics>,
    state: RwLock<Option<Arc<Mounted>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl DataWarehouse {
    /// Unmounted engine with no user plugins.
    pub fn new(config: WarehouseConfig) -> Self {
        Self {
            config: RwLock::new(config),
            registrations: Mutex::new(PluginRegistry::new()),
            builtins: Mutex::new(None),
            audit: Arc::new(TracingAuditSink),
            metrics: Arc::new(EngineMetrics::new()),
            state: RwLock::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Send audit events to `sink` instead of the tracing log.
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// True between a successful mount and the next dismount.
    pub fn is_mounted(&self) -> bool {
        self.state.read().is_some()
    }

    /// Replace the configuration. Only allowed while unmounted; drops retained built-ins.
    pub fn configure(&self, config: WarehouseConfig) -> VaultResult<()> {
        if self.is_mounted() {
            return Err(VaultError::InvalidState("configure while mounted".into()));
        }
        config.validate()?;
        *self.config.write() = config;
        *self.builtins.lock() = None;
        Ok(())
    }

    /// Current configuration.
    pub fn config(&self) -> WarehouseConfig {
        self.config.read().clone()
    }

    /// Add a plugin. Only allowed while unmounted.
    pub fn register_plugin(&self, registration: PluginRegistration) -> VaultResult<()> {
        if self.is_mounted() {
            return Err(VaultError::InvalidState("register_plugin while mounted".into()));
        }
        let replaces_acl = registration
            .capabilities
            .iter()
            .any(|c| c.kind() == CapabilityKind::AccessControl);
        self.registrations.lock().register(registration)?;
        if replaces_acl {
            // The retained key custodian is bound to the previous ACL.
            *self.builtins.lock() = None;
        }
        Ok(())
    }

    /// Descriptors of every plugin, including built-ins once mounted.
    pub fn descriptors(&self) -> Vec<PluginDescriptor> {
        match self.state.read().as_ref() {
            Some(m) => m.registry.descriptors(),
            None => self.registrations.lock().descriptors(),
        }
    }

    fn builtins_for(
        &self,
        config: &WarehouseConfig,
        registry: &PluginRegistry,
    ) -> VaultResult<Arc<Builtins>> {
        let mut slot = self.builtins.lock();
        if let Some(b) = slot.as_ref() {
            return Ok(Arc::clone(b));
        }
        let built = Arc::new(Builtins::new(config, registry)?);
        *slot = Some(Arc::clone(&built));
        Ok(built)
    }

    fn mounted(&self) -> VaultResult<Arc<Mounted>> {
        self.state
            .read()
            .clone()
            .ok_or_else(|| VaultError::InvalidState("engine is not mounted".into()))
    }

    fn audit(&self, ctx: &SecurityContext, action: AuditAction, resource: String, success: bool, trace_id: Uuid) {
        if let Err(e) = self
            .audit
            .record(AuditEvent::new(ctx, action, resource, success, trace_id))
        {
            self.metrics.record_audit_failure();
            warn!(error = %e, ?action, "audit sink failed");
        }
    }

    /// Audit and count the outcome of a gated operation.
    fn finish<T>(
        &self,
        ctx: &OperationContext,
        action: AuditAction,
        resource: String,
        result: &VaultResult<T>,
    ) {
        if let Err(e) = result {
            self.metrics.record_error();
            debug!(kind = e.kind(), error = %e, ?action, "operation failed");
        }
        self.audit(&ctx.security, action, resource, result.is_ok(), ctx.trace_id);
    }

    /// Resolve plugins, open every store and start background GC. Idempotent.
    #[instrument(skip(self))]
    pub async fn mount(&self) -> VaultResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.is_mounted() {
            debug!("already mounted");
            return Ok(());
        }

        let config = self.config.read().clone();
        let result = self.mount_inner(config).await;
        let system = SecurityContext::system();
        let trace_id = Uuid::new_v4();
        match result {
            Ok(mounted) => {
                info!(
                    plugins = mounted.registry.len(),
                    index = mounted.index.id(),
                    dedup = mounted.dedup.backend_name(),
                    "warehouse mounted"
                );
                *self.state.write() = Some(Arc::new(mounted));
                self.audit(&system, AuditAction::Mount, "engine".into(), true, trace_id);
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "mount failed");
                self.audit(&system, AuditAction::Mount, "engine".into(), false, trace_id);
                Err(e)
            }
        }
    }

    async fn mount_inner(&self, config: WarehouseConfig) -> VaultResult<Mounted> {
        config.validate()?;
        let decision = RuntimeOptimizer::decide(&config, &HostEnvironment::from_env());

        let mut registry = self.registrations.lock().clone();
        let builtins = self.builtins_for(&config, &registry)?;
        let database = match decision.metadata_backend {
            ResolvedMetadata::Sqlite => {
                let path = config.database_file().ok_or_else(|| {
                    VaultError::ConfigurationError("sqlite metadata without a database path".into())
                })?;
                Some(Arc::new(SqliteDatabase::new(path)))
            }
            ResolvedMetadata::Memory => None,
        };
        builtin::complete_registry(&mut registry, &builtins, &config, database.as_ref())?;
        let registry = Arc::new(registry);

        let index = first::<MetadataCap>(&registry, "metadata index")?;
        let acl = first::<AccessControlCap>(&registry, "access control")?;
        let keys = first::<KeyStoreCap>(&registry, "key store")?;
        let dedup: Arc<dyn DedupTable> = match &database {
            Some(db) if decision.durable_dedup => Arc::new(SqliteDedupTable::new(Arc::clone(db))),
            _ => builtins.memory_dedup.clone(),
        };
        let volatile_dedup: Arc<dyn DedupTable> = builtins.volatile_dedup.clone();

        let providers = registry.resolve::<StorageCap>();
        let runtime = RuntimeOptimizer::new(&config, providers.iter().map(|p| p.scheme().to_string()));
        let mut backends = HashMap::new();
        for (intent, scheme) in runtime.resolve_all()? {
            let provider = registry.storage_for_scheme(&scheme).ok_or_else(|| {
                VaultError::ConfigurationError(format!("no provider for scheme {scheme}"))
            })?;
            debug!(%intent, %scheme, "intent backend");
            backends.insert(intent, provider);
        }

        let mut opened = Vec::new();
        let stores = Stores {
            database: database.as_ref(),
            index: &index,
            dedup: &dedup,
            keys: &keys,
            acl: &acl,
            providers: &providers,
        };
        if let Err(e) = stores.open(&config, &mut opened).await {
            close_all(&opened).await;
            return Err(e);
        }

        let gate = Arc::new(tokio::sync::RwLock::new(()));
        let gc = Arc::new(GarbageCollector::new(
            Arc::clone(&index),
            vec![Arc::clone(&dedup), Arc::clone(&volatile_dedup)],
            Arc::clone(&registry),
            Arc::clone(&gate),
            Arc::clone(&self.metrics),
        ));
        let gc_task = config.gc.enabled.then(|| {
            let cancel = CancellationToken::new();
            let interval = Duration::from_secs(config.gc.interval_secs);
            let handle = Arc::clone(&gc).spawn(interval, cancel.clone());
            info!(interval_secs = config.gc.interval_secs, "background gc started");
            (cancel, handle)
        });

        Ok(Mounted {
            transforms: registry.resolve::<TransformCap>(),
            optimizer: PipelineOptimizer::new(config.pipeline.clone()),
            config,
            registry,
            index,
            dedup,
            volatile_dedup,
            keys,
            acl,
            backends,
            locks: HashLocks::new(),
            key_locks: HashLocks::new(),
            gate,
            gc,
            gc_task: Mutex::new(gc_task),
            opened,
        })
    }

    /// Stop GC, wait for in-flight stores and close every store in reverse order.
    /// Close failures are logged; the engine always ends up unmounted.
    #[instrument(skip(self))]
    pub async fn dismount(&self) -> VaultResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(mounted) = self.state.write().take() else {
            debug!("not mounted");
            return Ok(());
        };

        let task = mounted.gc_task.lock().take();
        if let Some((cancel, handle)) = task {
            cancel.cancel();
            if let Err(e) = handle.await {
                warn!(error = %e, "gc task ended abnormally");
            }
        }

        let _quiesced = mounted.gate.write().await;
        close_all(&mounted.opened).await;
        info!("warehouse dismounted");
        self.audit(
            &SecurityContext::system(),
            AuditAction::Dismount,
            "engine".into(),
            true,
            Uuid::new_v4(),
        );
        Ok(())
    }

    /// Store the bytes read from `reader` under (`bucket`, `key`).
    ///
    /// Identical content is written once: a store whose hash is already registered reuses the
    /// existing physical object. An existing (`bucket`, `key`) is overwritten and keeps its
    /// `created_at`.
    #[instrument(skip(self, ctx, reader), fields(trace_id = %ctx.trace_id))]
    pub async fn store_object<R>(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        key: &str,
        reader: R,
        intent: StorageIntent,
    ) -> VaultResult<BlobHeader>
    where
        R: AsyncRead + Unpin + Send,
    {
        let result = self.store_inner(ctx, bucket, key, reader, intent).await;
        self.finish(ctx, AuditAction::Store, format!("{bucket}/{key}"), &result);
        result
    }

    async fn store_inner<R>(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        key: &str,
        reader: R,
        intent: StorageIntent,
    ) -> VaultResult<BlobHeader>
    where
        R: AsyncRead + Unpin + Send,
    {
        let m = self.mounted()?;
        validate_bucket(bucket)?;
        validate_key(key)?;
        ctx.check_cancelled()?;
        m.authorize_bucket(bucket, &ctx.security, Permissions::WRITE)?;

        let (data, hash) = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(VaultError::Cancelled),
            read = read_and_hash(reader, m.config.max_object_size) => read?,
        };
        let size = data.len() as u64;

        let gate = Arc::clone(&m.gate).read_owned().await;
        let hash_guard: HashGuard = m.locks.acquire(hash).await;
        ctx.check_cancelled()?;

        let task = StoreTask {
            mounted: Arc::clone(&m),
            security: ctx.security.clone(),
            cancel: ctx.cancel.clone(),
            hash,
            data,
            intent,
            bucket: bucket.to_string(),
            key: key.to_string(),
            trace_id: ctx.trace_id,
        };
        let (committed, written_bytes) = tokio::spawn(async move {
            let _gate = gate;
            let _hash = hash_guard;
            task.run().await
        })
        .await
        .map_err(|e| VaultError::BackendUnavailable(format!("store task failed: {e}")))??;

        self.metrics.record_store(size, committed.dedup_hit);
        if !committed.dedup_hit {
            self.metrics.record_write(written_bytes);
        }
        info!(
            bucket,
            key,
            uri = %committed.header.uri,
            dedup_hit = committed.dedup_hit,
            size,
            "object stored"
        );
        Ok(committed.header)
    }

    /// Read back the original bytes of (`bucket`, `key`).
    #[instrument(skip(self, ctx), fields(trace_id = %ctx.trace_id))]
    pub async fn retrieve_object(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        key: &str,
    ) -> VaultResult<Bytes> {
        let result = self.retrieve_inner(ctx, bucket, key).await;
        self.finish(ctx, AuditAction::Retrieve, format!("{bucket}/{key}"), &result);
        result
    }

    async fn retrieve_inner(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        key: &str,
    ) -> VaultResult<Bytes> {
        let m = self.mounted()?;
        validate_bucket(bucket)?;
        validate_key(key)?;
        ctx.check_cancelled()?;
        m.authorize_bucket(bucket, &ctx.security, Permissions::READ)?;

        let metadata = m
            .index
            .get(bucket, key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("{bucket}/{key}")))?;
        let header = &metadata.header;

        if let Some(missing) = metadata
            .chain
            .records()
            .iter()
            .find(|r| m.registry.transform(&r.transform_id).is_none())
        {
            return Err(VaultError::TransformUnavailable(missing.transform_id.clone()));
        }
        let provider = m.registry.storage_for_scheme(header.uri.scheme()).ok_or_else(|| {
            VaultError::NotSupported(format!("no provider for scheme {}", header.uri.scheme()))
        })?;

        let stored = provider.load(&header.uri).await?;
        let key_record = match metadata.chain.key_ref()? {
            Some((key_id, generation)) => Some(
                m.keys
                    .get_key_generation(&key_id, generation, &ctx.security)
                    .await?,
            ),
            None => None,
        };
        let tctx = TransformContext {
            content_hash: header.content_hash,
            key: key_record,
        };
        let (data, _) =
            reverse_chain(&metadata.chain, stored, &tctx, |id| m.registry.transform(id)).await?;

        if data.len() as u64 != header.size || blake3_hash(&data) != header.content_hash {
            error!(uri = %header.uri, "content hash mismatch after decode");
            return Err(VaultError::Corruption(format!(
                "{bucket}/{key} does not match its recorded hash"
            )));
        }
        self.metrics.record_retrieve(header.size);
        Ok(data)
    }

    /// Remove (`bucket`, `key`). The physical bytes are reclaimed by GC once unreferenced.
    #[instrument(skip(self, ctx), fields(trace_id = %ctx.trace_id))]
    pub async fn delete_object(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        key: &str,
    ) -> VaultResult<()> {
        let result = self.delete_inner(ctx, bucket, key).await;
        self.finish(ctx, AuditAction::Delete, format!("{bucket}/{key}"), &result);
        result
    }

    async fn delete_inner(&self, ctx: &OperationContext, bucket: &str, key: &str) -> VaultResult<()> {
        let m = self.mounted()?;
        validate_bucket(bucket)?;
        validate_key(key)?;
        ctx.check_cancelled()?;
        m.authorize_bucket(bucket, &ctx.security, Permissions::DELETE)?;

        if !m.index.remove(bucket, key).await? {
            return Err(VaultError::NotFound(format!("{bucket}/{key}")));
        }
        self.metrics.record_delete();
        info!(bucket, key, "object deleted");
        Ok(())
    }

    /// Header of (`bucket`, `key`) without reading its bytes.
    pub async fn stat_object(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        key: &str,
    ) -> VaultResult<BlobHeader> {
        let m = self.mounted()?;
        validate_bucket(bucket)?;
        validate_key(key)?;
        m.authorize_bucket(bucket, &ctx.security, Permissions::READ)?;
        m.index
            .get_header(bucket, key)
            .await?
            .ok_or_else(|| VaultError::NotFound(format!("{bucket}/{key}")))
    }

    /// Headers in `bucket` whose key starts with `prefix`, ordered by key.
    pub async fn list_objects(
        &self,
        ctx: &OperationContext,
        bucket: &str,
        prefix: &str,
    ) -> VaultResult<Vec<BlobHeader>> {
        let m = self.mounted()?;
        validate_bucket(bucket)?;
        m.authorize_bucket(bucket, &ctx.security, Permissions::READ)?;
        m.index.list(bucket, prefix).await
    }

    /// Create a new generation of the current key. Older generations stay readable.
    /// Returns the new generation number.
    #[instrument(skip(self, ctx), fields(trace_id = %ctx.trace_id))]
    pub async fn rotate_key(&self, ctx: &OperationContext) -> VaultResult<u32> {
        let m = self.mounted()?;
        let key_id = m.keys.current_key_id().await?;
        let result = m
            .keys
            .create_key(&key_id, &ctx.security)
            .await
            .map(|record| record.generation);
        if let Ok(generation) = &result {
            info!(key_id = %key_id, generation, "key rotated");
        }
        self.finish(ctx, AuditAction::RotateKey, ResourcePath::key(&key_id), &result);
        result
    }

    /// Run one garbage collection cycle now.
    pub async fn run_gc(&self) -> VaultResult<GcReport> {
        let m = self.mounted()?;
        m.gc.run_cycle().await
    }

    /// Counter snapshot. Counters persist across remounts.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// The mounted access control provider, for granting bucket and key permissions.
    pub fn access_control(&self) -> VaultResult<Arc<dyn AccessControl>> {
        Ok(Arc::clone(&self.mounted()?.acl))
    }

    /// The mounted key store.
    pub fn key_store(&self) -> VaultResult<Arc<dyn KeyStore>> {
        Ok(Arc::clone(&self.mounted()?.keys))
    }

    /// Probe every mounted component.
    pub async fn check_health(&self) -> HealthReport {
        let Ok(m) = self.mounted() else {
            let mut report = HealthReport::new(false);
            report.fail("engine", HealthStatus::Unhealthy, "not mounted");
            return report;
        };

        let mut report = HealthReport::new(true);
        report.pass(format!("registry:{} plugins", m.registry.len()));
        probe(&mut report, format!("metadata:{}", m.index.id()), HealthStatus::Unhealthy, m.index.health().await);
        probe(&mut report, format!("dedup:{}", m.dedup.backend_name()), HealthStatus::Unhealthy, m.dedup.health().await);
        probe(&mut report, format!("keys:{}", m.keys.id()), HealthStatus::Degraded, m.keys.health().await);
        for provider in m.registry.resolve::<StorageCap>() {
            let in_use = m.backends.values().any(|b| b.id() == provider.id());
            let severity = if in_use {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
            probe(&mut report, format!("storage:{}", provider.scheme()), severity, provider.health().await);
        }
        report
    }
}

fn probe(report: &mut HealthReport, component: String, severity: HealthStatus, result: VaultResult<()>) {
    match result {
        Ok(()) => report.pass(component),
        Err(e) => report.fail(component, severity, e.to_string()),
    }
}

fn first<C: blobhouse_core::Capability>(
    registry: &PluginRegistry,
    what: &str,
) -> VaultResult<Arc<C::Handle>> {
    registry
        .resolve::<C>()
        .into_iter()
        .next()
        .ok_or_else(|| VaultError::ConfigurationError(format!("no {what} registered")))
}

/// The stores a mount opens, in open order.
struct Stores<'a> {
    database: Option<&'a Arc<SqliteDatabase>>,
    index: &'a Arc<dyn MetadataIndex>,
    dedup: &'a Arc<dyn DedupTable>,
    keys: &'a Arc<dyn KeyStore>,
    acl: &'a Arc<dyn AccessControl>,
    providers: &'a [Arc<dyn StorageProvider>],
}

impl Stores<'_> {
    async fn open(&self, config: &WarehouseConfig, opened: &mut Vec<Opened>) -> VaultResult<()> {
        if let Some(db) = self.database {
            db.open().await?;
            opened.push(Opened::Database(Arc::clone(db)));
        }
        self.index.open().await?;
        opened.push(Opened::Index(Arc::clone(self.index)));
        self.dedup.open().await?;
        opened.push(Opened::Dedup(Arc::clone(self.dedup)));
        self.keys.open().await?;
        opened.push(Opened::Keys(Arc::clone(self.keys)));
        self.ensure_default_key(config).await?;
        for provider in self.providers {
            provider.open().await?;
            opened.push(Opened::Storage(Arc::clone(provider)));
        }
        Ok(())
    }

    /// Make sure the write key exists and the configured reader roles may use it.
    async fn ensure_default_key(&self, config: &WarehouseConfig) -> VaultResult<()> {
        let system = SecurityContext::system();
        let key_id = self.keys.current_key_id().await?;
        match self.keys.get_key(&key_id, &system).await {
            Ok(record) => debug!(key_id = %key_id, generation = record.generation, "default key present"),
            Err(VaultError::NotFound(_)) => {
                let record = self.keys.create_key(&key_id, &system).await?;
                info!(key_id = %key_id, generation = record.generation, "default key created");
            }
            Err(e) => return Err(e),
        }

        let resource = ResourcePath::key(&key_id);
        let owner = Subject::user(SYSTEM_IDENTITY);
        if self.acl.has_access(&resource, &owner, Permissions::FULL_CONTROL) {
            return Ok(());
        }
        self.acl.create_scope(&resource, &owner);
        for role in &config.key_reader_roles {
            self.acl
                .set_permissions(&resource, &Subject::role(role.as_str()), Permissions::READ, Permissions::NONE);
        }
        Ok(())
    }
}
