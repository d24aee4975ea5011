#![warn(missing_docs)]

//! Blobhouse engine: the data warehouse that ties storage, reduction, metadata and security
//! plugins together, plus the `bhctl` command line front end.

pub mod builtin;
pub mod cli;
pub mod config;
pub mod engine;
pub mod gc;
pub mod health;
pub mod locks;
pub mod metrics;
pub mod registry;
pub mod runtime;

pub use builtin::{builtin_transforms, BUILTIN_PRIORITY};
pub use config::{GcConfig, MetadataBackend, WarehouseConfig, DEFAULT_MASTER_KEY_ENV, DEFAULT_USER_ROLE};
pub use engine::DataWarehouse;
pub use gc::{GarbageCollector, GcReport};
pub use health::{HealthCheck, HealthReport, HealthStatus};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use registry::{PluginRegistration, PluginRegistry};
pub use runtime::{HostEnvironment, ResolvedMetadata, RuntimeDecision, RuntimeOptimizer, EPHEMERAL_ENV};
