//! Error taxonomy shared by every Blobhouse crate.
//!
//! Crate-local errors (`ReduceError`, `StorageError`, `MetaError`) convert into
//! [`VaultError`] at the plugin boundary so callers only ever match on one enum.

/// Result alias used across plugin contracts and the engine.
pub type VaultResult<T> = Result<T, VaultError>;

/// All errors surfaced by the storage engine and its plugins.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// Missing metadata, key or physical object. Not retryable.
    #[error("not found: {0}")]
    NotFound(String),
    /// Failed access check. Deliberately carries no detail about the resource.
    #[error("access denied")]
    AccessDenied,
    /// A recorded transform id is not registered.
    #[error("transform unavailable: {0}")]
    TransformUnavailable(String),
    /// Transient I/O failure in a storage or metadata backend. Callers may retry.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    /// Malformed caller input.
    #[error("validation failure: {0}")]
    ValidationFailure(String),
    /// Invalid or inconsistent configuration. Fatal at mount.
    #[error("configuration error: {0}")]
    ConfigurationError(String),
    /// The backend does not implement the operation (e.g. delete on an append-only store).
    #[error("operation not supported: {0}")]
    NotSupported(String),
    /// A transform rejected its input (codec error, AEAD tag mismatch).
    #[error("transform {id} failed: {reason}")]
    TransformFailed {
        /// Transform id
        id: String,
        /// Failure description
        reason: String,
    },
    /// Stored data no longer matches what was recorded.
    #[error("corruption detected: {0}")]
    Corruption(String),
    /// Operation issued in the wrong lifecycle state (e.g. before mount).
    #[error("invalid state: {0}")]
    InvalidState(String),
    /// The caller cancelled the operation before it committed.
    #[error("operation cancelled")]
    Cancelled,
}

impl VaultError {
    /// True for failures the caller may retry with backoff. The engine never retries itself.
    pub fn is_retryable(&self) -> bool {
        matches!(self, VaultError::BackendUnavailable(_))
    }

    /// Stable short name of the error class, used as a log and metric label.
    pub fn kind(&self) -> &'static str {
        match self {
            VaultError::NotFound(_) => "not_found",
            VaultError::AccessDenied => "access_denied",
            VaultError::TransformUnavailable(_) => "transform_unavailable",
            VaultError::BackendUnavailable(_) => "backend_unavailable",
            VaultError::ValidationFailure(_) => "validation_failure",
            VaultError::ConfigurationError(_) => "configuration_error",
            VaultError::NotSupported(_) => "not_supported",
            VaultError::TransformFailed { .. } => "transform_failed",
            VaultError::Corruption(_) => "corruption",
            VaultError::InvalidState(_) => "invalid_state",
            VaultError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_backend_errors_are_retryable() {
        assert!(VaultError::BackendUnavailable("disk".into()).is_retryable());
        assert!(!VaultError::NotFound("x".into()).is_retryable());
        assert!(!VaultError::AccessDenied.is_retryable());
        assert!(!VaultError::TransformUnavailable("zstd".into()).is_retryable());
    }

    #[test]
    fn access_denied_message_is_opaque() {
        assert_eq!(VaultError::AccessDenied.to_string(), "access denied");
    }

    #[test]
    fn kind_labels() {
        assert_eq!(VaultError::Cancelled.kind(), "cancelled");
        assert_eq!(
            VaultError::TransformFailed {
                id: "aes-256-gcm".into(),
                reason: "tag".into()
            }
            .kind(),
            "transform_failed"
        );
    }
}
