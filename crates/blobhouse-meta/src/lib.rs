#![warn(missing_docs)]

//! Blobhouse metadata subsystem: where each (bucket, key) lives and how it was encoded.
//!
//! Two [`MetadataIndex`](blobhouse_core::MetadataIndex) backends, volatile and SQLite, plus
//! the SQLite [`DedupTable`](blobhouse_core::DedupTable). The SQLite pieces share one
//! [`SqliteDatabase`] handle.

pub mod database;
pub mod dedup;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use database::SqliteDatabase;
pub use dedup::SqliteDedupTable;
pub use error::{MetaError, MetaResult};
pub use memory::{MemoryMetadataIndex, MEMORY_INDEX_ID};
pub use sqlite::{SqliteMetadataIndex, SQLITE_INDEX_ID};
