//! Garbage collection of physical objects no blob references any more.
//!
//! Mark: collect every URI recorded in the metadata index. Sweep: each entry of every dedup
//! table whose URI is unmarked is unregistered and its bytes deleted. A sweep holds the store gate exclusively, so
//! no store can adopt a dedup entry while it is being reclaimed.

use crate::metrics::EngineMetrics;
use crate::registry::PluginRegistry;
use blobhouse_core::{BlobUri, DedupTable, MetadataIndex, VaultError, VaultResult};
use std::collections::HashSet;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one GC cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcReport {
    /// Dedup entries examined
    pub scanned: usize,
    /// Distinct URIs referenced by metadata
    pub referenced: usize,
    /// Unreferenced objects unregistered and deleted
    pub reclaimed: usize,
    /// Unreferenced objects unregistered but left on an append-only backend
    pub retained: usize,
    /// Unreferenced objects that could not be processed this cycle
    pub failed: usize,
}

/// Everything a GC cycle touches.
pub struct GarbageCollector {
    index: Arc<dyn MetadataIndex>,
    tables: Vec<Arc<dyn DedupTable>>,
    registry: Arc<PluginRegistry>,
    gate: Arc<RwLock<()>>,
    metrics: Arc<EngineMetrics>,
}

impl GarbageCollector {
    pub(crate) fn new(
        index: Arc<dyn MetadataIndex>,
        tables: Vec<Arc<dyn DedupTable>>,
        registry: Arc<PluginRegistry>,
        gate: Arc<RwLock<()>>,
        metrics: Arc<EngineMetrics>,
    ) -> Self {
        Self {
            index,
            tables,
            registry,
            gate,
            metrics,
        }
    }

    /// Run one mark and sweep cycle.
    pub async fn run_cycle(&self) -> VaultResult<GcReport> {
        let _exclusive = self.gate.write().await;

        let marked = self.index.referenced_uris().await?;
        let mut report = GcReport {
            referenced: marked.len(),
            ..Default::default()
        };
        for table in &self.tables {
            self.sweep(table.as_ref(), &marked, &mut report).await?;
        }

        self.metrics
            .record_gc(report.reclaimed as u64, report.retained as u64);
        info!(
            scanned = report.scanned,
            reclaimed = report.reclaimed,
            retained = report.retained,
            failed = report.failed,
            "gc cycle complete"
        );
        Ok(report)
    }

    async fn sweep(
        &self,
        table: &dyn DedupTable,
        marked: &HashSet<BlobUri>,
        report: &mut GcReport,
    ) -> VaultResult<()> {
        let entries = table.entries().await?;
        report.scanned += entries.len();

        for entry in entries.into_iter().filter(|e| !marked.contains(&e.uri)) {
            let Some(provider) = self.registry.storage_for_scheme(entry.uri.scheme()) else {
                warn!(uri = %entry.uri, "no provider for unreferenced object, skipped");
                report.failed += 1;
                continue;
            };
            match table.unregister(&entry.content_hash, &entry.uri).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    warn!(uri = %entry.uri, error = %e, "unregister failed");
                    report.failed += 1;
                    continue;
                }
            }
            match provider.delete(&entry.uri).await {
                Ok(()) => {
                    debug!(uri = %entry.uri, hash = %entry.content_hash, "reclaimed");
                    report.reclaimed += 1;
                }
                Err(VaultError::NotSupported(_)) => report.retained += 1,
                Err(e) => {
                    warn!(uri = %entry.uri, error = %e, "delete of unreferenced object failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Run a cycle every `interval` until `cancel` fires.
    pub(crate) fn spawn(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it so a fresh mount does not sweep.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.run_cycle().await {
                            warn!(error = %e, "background gc cycle failed");
                        }
                    }
                }
            }
            debug!("gc task stopped");
        })
    }
}
