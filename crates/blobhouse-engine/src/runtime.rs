//! Runtime optimizer: picks the metadata backend and the storage backend per intent.
//!
//! Explicit configuration always wins; `auto` settings are resolved from what is configured and
//! from the host environment.

use crate::config::{MetadataBackend, WarehouseConfig};
use blobhouse_core::{StorageIntent, VaultError, VaultResult};
use blobhouse_storage::{CAS_SCHEME, FILE_SCHEME, MEM_SCHEME};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use tracing::debug;

/// Environment variable forcing volatile metadata when set to `1` or `true`.
pub const EPHEMERAL_ENV: &str = "BLOBHOUSE_EPHEMERAL";

/// Facts about the host the engine runs on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostEnvironment {
    /// Nothing should outlive the process (CI, scratch containers)
    pub ephemeral: bool,
}

impl HostEnvironment {
    /// Read from the process environment.
    pub fn from_env() -> Self {
        let ephemeral = std::env::var(EPHEMERAL_ENV)
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Self { ephemeral }
    }
}

/// Resolved metadata backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolvedMetadata {
    /// In-process index and dedup table
    Memory,
    /// SQLite index and dedup table
    Sqlite,
}

/// What the optimizer decided for one mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RuntimeDecision {
    /// Index backend
    pub metadata_backend: ResolvedMetadata,
    /// True when the dedup table lives in the database
    pub durable_dedup: bool,
}

/// Maps intents to registered storage schemes.
#[derive(Debug, Clone)]
pub struct RuntimeOptimizer {
    intent_backends: HashMap<StorageIntent, String>,
    has_root: bool,
    schemes: BTreeSet<String>,
}

impl RuntimeOptimizer {
    /// Pick the metadata backend.
    pub fn decide(config: &WarehouseConfig, env: &HostEnvironment) -> RuntimeDecision {
        let metadata_backend = match config.metadata_backend {
            MetadataBackend::Memory => ResolvedMetadata::Memory,
            MetadataBackend::Sqlite => ResolvedMetadata::Sqlite,
            MetadataBackend::Auto if env.ephemeral => ResolvedMetadata::Memory,
            MetadataBackend::Auto if config.database_file().is_some() => ResolvedMetadata::Sqlite,
            MetadataBackend::Auto => ResolvedMetadata::Memory,
        };
        let decision = RuntimeDecision {
            metadata_backend,
            durable_dedup: metadata_backend == ResolvedMetadata::Sqlite,
        };
        debug!(?decision, ephemeral = env.ephemeral, "runtime decision");
        decision
    }

    /// Optimizer over the schemes actually registered.
    pub fn new(config: &WarehouseConfig, schemes: impl IntoIterator<Item = String>) -> Self {
        Self {
            intent_backends: config.intent_backends.clone(),
            has_root: config.root_path.is_some(),
            schemes: schemes.into_iter().collect(),
        }
    }

    /// Scheme new objects of `intent` are written to.
    pub fn backend_for_intent(&self, intent: StorageIntent) -> VaultResult<String> {
        if let Some(scheme) = self.intent_backends.get(&intent) {
            return if self.schemes.contains(scheme) {
                Ok(scheme.clone())
            } else {
                Err(VaultError::ConfigurationError(format!(
                    "intent {intent} mapped to unregistered scheme {scheme}"
                )))
            };
        }
        let durable = if self.has_root && self.schemes.contains(FILE_SCHEME) {
            FILE_SCHEME
        } else {
            MEM_SCHEME
        };
        let scheme = match intent {
            StorageIntent::Durable => durable,
            StorageIntent::Cache => MEM_SCHEME,
            StorageIntent::Archival if self.schemes.contains(CAS_SCHEME) => CAS_SCHEME,
            StorageIntent::Archival => durable,
        };
        if !self.schemes.contains(scheme) {
            return Err(VaultError::ConfigurationError(format!(
                "no storage provider for intent {intent} (wanted {scheme})"
            )));
        }
        Ok(scheme.to_string())
    }

    /// Resolve every intent once; used at mount to fail fast.
    pub fn resolve_all(&self) -> VaultResult<HashMap<StorageIntent, String>> {
        StorageIntent::ALL
            .iter()
            .map(|i| Ok((*i, self.backend_for_intent(*i)?)))
            .collect()
    }
}
