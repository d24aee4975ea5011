//! Error types for the storage subsystem.

use blobhouse_core::VaultError;
use thiserror::Error;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Error variants for storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Wraps standard I/O errors.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// The requested object does not exist.
    #[error("Object not found: {uri}")]
    ObjectNotFound {
        /// URI that was looked up.
        uri: String,
    },

    /// A URI was handed to a provider that does not serve its scheme.
    #[error("Scheme mismatch: provider serves {expected}://, got {uri}")]
    SchemeMismatch {
        /// Scheme of the provider.
        expected: String,
        /// Offending URI.
        uri: String,
    },

    /// Locator escapes the provider root or is otherwise malformed.
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// The backend cannot perform this operation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Remote backend failure.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<StorageError> for VaultError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::ObjectNotFound { uri } => VaultError::NotFound(uri),
            StorageError::IoError(ref io) if io.kind() == std::io::ErrorKind::NotFound => {
                VaultError::NotFound(e.to_string())
            }
            StorageError::SchemeMismatch { .. } | StorageError::InvalidLocator(_) => {
                VaultError::ValidationFailure(e.to_string())
            }
            StorageError::Unsupported(msg) => VaultError::NotSupported(msg),
            StorageError::IoError(_) | StorageError::Backend(_) => {
                VaultError::BackendUnavailable(e.to_string())
            }
        }
    }
}
