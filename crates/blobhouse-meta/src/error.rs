//! Error types for the metadata subsystem.

use blobhouse_core::VaultError;

/// Errors raised by the metadata backends before conversion to [`VaultError`].
#[derive(Debug, thiserror::Error)]
pub enum MetaError {
    /// The database handle was used before `open` or after `close`.
    #[error("database is not open")]
    NotOpen,

    /// A stored row could not be decoded.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    /// The schema on disk is newer or incompatible.
    #[error("incompatible schema: {0}")]
    Schema(String),

    /// Underlying SQLite or driver failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem failure preparing the database location.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for metadata backend internals.
pub type MetaResult<T> = Result<T, MetaError>;

impl From<MetaError> for VaultError {
    fn from(e: MetaError) -> Self {
        match e {
            MetaError::NotOpen => VaultError::InvalidState(e.to_string()),
            MetaError::CorruptRow(msg) => VaultError::Corruption(msg),
            MetaError::Schema(msg) => VaultError::ConfigurationError(msg),
            MetaError::Database(_) | MetaError::Io(_) => VaultError::BackendUnavailable(e.to_string()),
        }
    }
}
