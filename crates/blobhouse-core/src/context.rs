//! Explicit caller context threaded through every gated call.

use crate::error::{VaultError, VaultResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity the engine itself acts as (mount-time key creation, GC).
pub const SYSTEM_IDENTITY: &str = "system";

/// Caller identity and roles. Supplied per call, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityContext {
    /// Caller identity (user or service name)
    pub identity: String,
    /// Optional tenant the caller acts for
    pub tenant_id: Option<String>,
    /// Role names held by the caller
    pub roles: BTreeSet<String>,
    /// System administrators bypass access checks
    pub is_system_admin: bool,
}

impl SecurityContext {
    /// Plain user context with no roles.
    pub fn user(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            tenant_id: None,
            roles: BTreeSet::new(),
            is_system_admin: false,
        }
    }

    /// The engine's own administrative identity.
    pub fn system() -> Self {
        Self {
            identity: SYSTEM_IDENTITY.to_string(),
            tenant_id: None,
            roles: BTreeSet::new(),
            is_system_admin: true,
        }
    }

    /// Add a role.
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Set the tenant.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant.into());
        self
    }

    /// Every ACL subject this context speaks for: its identity, then each role.
    pub fn subjects(&self) -> impl Iterator<Item = Subject> + '_ {
        std::iter::once(Subject::User(self.identity.clone()))
            .chain(self.roles.iter().cloned().map(Subject::Role))
    }
}

/// ACL subject: a single user or a role.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    /// A user identity
    User(String),
    /// A role name
    Role(String),
}

impl Subject {
    /// User subject.
    pub fn user(name: impl Into<String>) -> Self {
        Subject::User(name.into())
    }

    /// Role subject.
    pub fn role(name: impl Into<String>) -> Self {
        Subject::Role(name.into())
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Subject::User(u) => write!(f, "user:{u}"),
            Subject::Role(r) => write!(f, "role:{r}"),
        }
    }
}

/// Per-operation context: who is calling, the trace id, and a cancellation token.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Caller security context
    pub security: SecurityContext,
    /// Trace id recorded on metadata and audit events
    pub trace_id: Uuid,
    /// Cooperative cancellation
    pub cancel: CancellationToken,
}

impl OperationContext {
    /// New context with a fresh trace id.
    pub fn new(security: SecurityContext) -> Self {
        Self {
            security,
            trace_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
        }
    }

    /// Context acting as the engine itself.
    pub fn system() -> Self {
        Self::new(SecurityContext::system())
    }

    /// Reuse an upstream trace id.
    pub fn with_trace_id(mut self, trace_id: Uuid) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Bind to an existing cancellation token.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fail with [`VaultError::Cancelled`] if cancellation was requested.
    pub fn check_cancelled(&self) -> VaultResult<()> {
        if self.cancel.is_cancelled() {
            Err(VaultError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_include_identity_and_roles() {
        let ctx = SecurityContext::user("alice")
            .with_role("reader")
            .with_role("auditor");
        let subjects: Vec<Subject> = ctx.subjects().collect();
        assert_eq!(
            subjects,
            vec![
                Subject::user("alice"),
                Subject::role("auditor"),
                Subject::role("reader")
            ]
        );
    }

    #[test]
    fn system_context_is_admin() {
        let ctx = SecurityContext::system();
        assert!(ctx.is_system_admin);
        assert_eq!(ctx.identity, SYSTEM_IDENTITY);
    }

    #[test]
    fn cancellation_is_observed() {
        let ctx = OperationContext::new(SecurityContext::user("bob"));
        assert!(ctx.check_cancelled().is_ok());
        ctx.cancel.cancel();
        assert!(matches!(ctx.check_cancelled(), Err(VaultError::Cancelled)));
    }
}
