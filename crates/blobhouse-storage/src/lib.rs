#![warn(missing_docs)]

//! Blobhouse storage subsystem: where encoded bytes physically live.
//!
//! Each provider serves one URI scheme and implements
//! [`StorageProvider`](blobhouse_core::StorageProvider).

pub mod cas;
pub mod error;
pub mod local;
pub mod memory;

pub use cas::{
    CasClient, CasClientStats, ContentAddressedProvider, MemoryCasClient, CAS_SCHEME,
    CAS_STORAGE_ID,
};
pub use error::{StorageError, StorageResult};
pub use local::{LocalDiskProvider, FILE_SCHEME, LOCAL_DISK_ID};
pub use memory::{MemoryProvider, MEMORY_STORAGE_ID, MEM_SCHEME};
