//! Error types for the blobhouse-reduce subsystem

use blobhouse_core::VaultError;

/// All errors that can occur inside a transform or while fingerprinting a payload
#[derive(Debug, thiserror::Error)]
pub enum ReduceError {
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch: wrong key, or data corrupted or tampered
    #[error("Decryption failed: authentication tag mismatch (data may be corrupted)")]
    DecryptionAuthFailed,
    /// A keyed transform ran without a resolved key
    #[error("Missing encryption key: keyed transform invoked without key material")]
    MissingKey,
    /// A transform argument could not be parsed
    #[error("Invalid argument {name}={value}")]
    InvalidArgument {
        /// Argument name
        name: String,
        /// Offending value
        value: String,
    },
    /// Payload exceeded the configured object size limit
    #[error("Payload exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Limit in bytes
        limit: u64,
    },
    /// Blocking worker panicked or was cancelled
    #[error("Worker task failed: {0}")]
    WorkerFailed(String),
    /// I/O error while reading the caller's payload
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReduceError {
    /// Convert into the engine taxonomy, attributing the failure to `transform_id`.
    pub fn into_vault(self, transform_id: &str) -> VaultError {
        match self {
            ReduceError::PayloadTooLarge { .. } | ReduceError::Io(_) => self.into(),
            other => VaultError::TransformFailed {
                id: transform_id.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<ReduceError> for VaultError {
    fn from(e: ReduceError) -> Self {
        match e {
            ReduceError::PayloadTooLarge { .. } => VaultError::ValidationFailure(e.to_string()),
            ReduceError::Io(io) => {
                VaultError::ValidationFailure(format!("failed to read payload: {io}"))
            }
            other => VaultError::TransformFailed {
                id: "reduce".to_string(),
                reason: other.to_string(),
            },
        }
    }
}
