#![warn(missing_docs)]

//! Blobhouse core: data model, error taxonomy and plugin capability contracts.
//!
//! Every other crate depends on this one. It holds no behaviour beyond validation and
//! encoding helpers; implementations live in the subsystem crates.

pub mod context;
pub mod dedup;
pub mod error;
pub mod keys;
pub mod permissions;
pub mod plugin;
pub mod types;

pub use context::{OperationContext, SecurityContext, Subject, SYSTEM_IDENTITY};
pub use dedup::{DedupEntry, DedupRegistration, DedupTable};
pub use error::{VaultError, VaultResult};
pub use keys::{KeyMaterial, KeyRecord};
pub use permissions::{AccessControlEntry, Permissions, ResourcePath};
pub use plugin::{
    AccessControl, AccessControlCap, Capability, CapabilityHandle, CapabilityKind, KeyStore,
    KeyStoreCap, MetadataCap, MetadataIndex, Plugin, PluginCategory, PluginDescriptor,
    StorageCap, StorageProvider, TransformCap, TransformContext, TransformPlugin, TransformRole,
};
pub use types::{
    validate_bucket, validate_key, BlobHeader, BlobMetadata, BlobUri, ContentHash, Direction,
    StorageIntent, TransformArgs, TransformChain, TransformRecord, TransformStep, ARG_KEY_GENERATION,
    ARG_KEY_ID,
};
