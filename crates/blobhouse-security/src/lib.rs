#![warn(missing_docs)]

//! Blobhouse security subsystem: access control, key custody and auditing.

pub mod acl;
pub mod audit;
pub mod custodian;
pub mod envelope;

pub use acl::{MemoryAccessControl, ACL_PLUGIN_ID};
pub use audit::{AuditAction, AuditEvent, AuditSink, MemoryAuditLog, TracingAuditSink};
pub use blobhouse_core::KeyRecord;
pub use custodian::{KeyCustodian, CUSTODIAN_PLUGIN_ID};
pub use envelope::{MasterKey, WrappedKey};
