#![warn(missing_docs)]

//! Blobhouse data reduction subsystem
//!
//! Content fingerprinting, the compression and encryption transforms, the volatile dedup
//! table, the pipeline optimizer that picks a chain per storage intent, and the chain runner
//! that replays a recorded chain in either direction.

pub mod compression;
pub mod dedupe;
pub mod encryption;
pub mod error;
pub mod fingerprint;
pub mod offload;
pub mod optimizer;
pub mod pipeline;

pub use compression::{
    compress, decompress, is_compressible, CompressionAlgorithm, CompressionTransform, LZ4_ID,
    ZSTD_ID,
};
pub use dedupe::MemoryDedupTable;
pub use encryption::{
    derive_object_key, EncryptionAlgorithm, EncryptionKey, EncryptionTransform, AES_GCM_ID,
    CHACHA_ID,
};
pub use error::ReduceError;
pub use fingerprint::{blake3_hash, read_and_hash, StreamingHasher};
pub use optimizer::{IntentPolicy, PipelineConfig, PipelineOptimizer, PolicyStep};
pub use pipeline::{apply_chain, reverse_chain, ReductionStats};
