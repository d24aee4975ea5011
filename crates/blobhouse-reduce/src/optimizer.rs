//! Pipeline optimizer: turns a storage intent into an ordered transform chain.
//!
//! The optimizer only runs on the write path. Whatever it picks is recorded in the blob's
//! metadata and replayed verbatim on read.

use crate::compression::{is_compressible, ARG_LEVEL, LZ4_ID, ZSTD_ID};
use crate::encryption::AES_GCM_ID;
use blobhouse_core::{
    StorageIntent, TransformArgs, TransformChain, TransformPlugin, TransformRecord, TransformRole,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// One requested step of an intent policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyStep {
    /// What the step must achieve
    pub role: TransformRole,
    /// Transform id to use when registered
    pub preferred: String,
    /// Arguments for the preferred transform
    #[serde(default)]
    pub args: TransformArgs,
}

impl PolicyStep {
    /// Step with no explicit arguments.
    pub fn new(role: TransformRole, preferred: impl Into<String>) -> Self {
        Self {
            role,
            preferred: preferred.into(),
            args: TransformArgs::new(),
        }
    }

    /// Builder-style argument.
    pub fn with_arg(mut self, name: &str, value: impl ToString) -> Self {
        self.args.insert(name.to_string(), value.to_string());
        self
    }
}

/// Steps requested for one intent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentPolicy {
    /// Requested steps; reordered so compression precedes encryption
    #[serde(default)]
    pub steps: Vec<PolicyStep>,
}

/// Configuration for the pipeline optimizer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Policy for [`StorageIntent::Durable`]
    pub durable: IntentPolicy,
    /// Policy for [`StorageIntent::Cache`]
    pub cache: IntentPolicy,
    /// Policy for [`StorageIntent::Archival`]
    pub archival: IntentPolicy,
    /// Drop compression steps when a sample of the payload looks incompressible
    pub skip_incompressible: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            durable: IntentPolicy {
                steps: vec![
                    PolicyStep::new(TransformRole::Compression, ZSTD_ID).with_arg(ARG_LEVEL, 3),
                    PolicyStep::new(TransformRole::Encryption, AES_GCM_ID),
                ],
            },
            cache: IntentPolicy {
                steps: vec![PolicyStep::new(TransformRole::Compression, LZ4_ID)],
            },
            archival: IntentPolicy {
                steps: vec![
                    PolicyStep::new(TransformRole::Compression, ZSTD_ID).with_arg(ARG_LEVEL, 19),
                    PolicyStep::new(TransformRole::Encryption, AES_GCM_ID),
                ],
            },
            skip_incompressible: true,
        }
    }
}

impl PipelineConfig {
    /// Policy for `intent`.
    pub fn policy(&self, intent: StorageIntent) -> &IntentPolicy {
        match intent {
            StorageIntent::Durable => &self.durable,
            StorageIntent::Cache => &self.cache,
            StorageIntent::Archival => &self.archival,
        }
    }
}

fn role_rank(role: TransformRole) -> u8 {
    match role {
        TransformRole::Compression => 0,
        TransformRole::Other => 1,
        TransformRole::Encryption => 2,
    }
}

/// Selects the apply chain for a store.
#[derive(Debug, Clone, Default)]
pub struct PipelineOptimizer {
    config: PipelineConfig,
}

impl PipelineOptimizer {
    /// Optimizer over `config`.
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    /// Access configuration
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Build the apply chain for `intent`.
    ///
    /// `available` holds the registered transforms, highest priority first. Each policy step
    /// takes the preferred id if present, otherwise the first transform with the same role.
    /// Steps with no candidate are skipped. `sample` is a prefix of the payload used for the
    /// compressibility check.
    pub fn select(
        &self,
        intent: StorageIntent,
        available: &[Arc<dyn TransformPlugin>],
        sample: &[u8],
    ) -> TransformChain {
        let mut steps: Vec<&PolicyStep> = self.config.policy(intent).steps.iter().collect();
        steps.sort_by_key(|s| role_rank(s.role));

        let compressible = !self.config.skip_incompressible || is_compressible(sample);
        let mut chain = TransformChain::new();
        for step in steps {
            if step.role == TransformRole::Compression && !compressible {
                debug!(intent = %intent, transform = %step.preferred, "payload incompressible, skipping step");
                continue;
            }
            let preferred = available.iter().find(|t| t.id() == step.preferred);
            let record = match preferred {
                Some(t) => {
                    let mut args = t.default_args();
                    args.extend(step.args.clone());
                    TransformRecord {
                        transform_id: t.id().to_string(),
                        args,
                    }
                }
                None => match available.iter().find(|t| t.role() == step.role) {
                    Some(t) => {
                        debug!(intent = %intent, wanted = %step.preferred, using = t.id(), "preferred transform not registered, using fallback");
                        TransformRecord {
                            transform_id: t.id().to_string(),
                            args: t.default_args(),
                        }
                    }
                    None => {
                        warn!(intent = %intent, role = step.role.tag(), "no transform registered for role, step skipped");
                        continue;
                    }
                },
            };
            chain.push(record);
        }
        chain
    }
}
