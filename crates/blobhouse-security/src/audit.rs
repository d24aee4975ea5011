//! Audit sinks for security-relevant engine operations.

use blobhouse_core::{SecurityContext, VaultResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

/// Default ring buffer capacity of [`MemoryAuditLog`].
pub const DEFAULT_AUDIT_CAPACITY: usize = 10_000;

/// What was attempted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Object written
    Store,
    /// Object read
    Retrieve,
    /// Object removed
    Delete,
    /// Key generation created
    RotateKey,
    /// Key material requested
    KeyAccess,
    /// Engine mounted
    Mount,
    /// Engine dismounted
    Dismount,
}

/// One audit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Sequence number assigned by the sink (0 until recorded)
    pub id: u64,
    /// When it happened
    pub timestamp: DateTime<Utc>,
    /// Caller identity
    pub identity: String,
    /// Attempted action
    pub action: AuditAction,
    /// Resource path or `bucket/key`
    pub resource: String,
    /// Whether it succeeded
    pub success: bool,
    /// Correlates with logs
    pub trace_id: Uuid,
}

impl AuditEvent {
    /// Event stamped now.
    pub fn new(
        ctx: &SecurityContext,
        action: AuditAction,
        resource: impl Into<String>,
        success: bool,
        trace_id: Uuid,
    ) -> Self {
        Self {
            id: 0,
            timestamp: Utc::now(),
            identity: ctx.identity.clone(),
            action,
            resource: resource.into(),
            success,
            trace_id,
        }
    }
}

/// Destination for audit events. Failures are reported, never fatal to the caller.
pub trait AuditSink: Send + Sync {
    /// Record one event.
    fn record(&self, event: AuditEvent) -> VaultResult<()>;
}

/// Bounded in-memory log; the oldest event is dropped when full.
pub struct MemoryAuditLog {
    capacity: usize,
    inner: Mutex<(VecDeque<AuditEvent>, u64)>,
}

impl Default for MemoryAuditLog {
    fn default() -> Self {
        Self::new(DEFAULT_AUDIT_CAPACITY)
    }
}

impl MemoryAuditLog {
    /// Log holding at most `capacity` events.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new((VecDeque::with_capacity(capacity.min(1024)), 1)),
        }
    }

    /// Events matching `pred`, oldest first.
    pub fn query(&self, pred: impl Fn(&AuditEvent) -> bool) -> Vec<AuditEvent> {
        self.inner.lock().0.iter().filter(|e| pred(e)).cloned().collect()
    }

    /// Events currently held.
    pub fn event_count(&self) -> usize {
        self.inner.lock().0.len()
    }
}

impl AuditSink for MemoryAuditLog {
    fn record(&self, mut event: AuditEvent) -> VaultResult<()> {
        let mut inner = self.inner.lock();
        event.id = inner.1;
        inner.1 += 1;
        if inner.0.len() >= self.capacity {
            inner.0.pop_front();
        }
        inner.0.push_back(event);
        Ok(())
    }
}

/// Emits each event as a structured `tracing` record on the `audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) -> VaultResult<()> {
        tracing::info!(
            target: "audit",
            identity = %event.identity,
            action = ?event.action,
            resource = %event.resource,
            success = event.success,
            trace_id = %event.trace_id,
            "audit"
        );
        Ok(())
    }
}
