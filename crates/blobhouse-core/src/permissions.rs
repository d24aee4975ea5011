//! Permission masks, ACL entries and resource path conventions.

use crate::context::Subject;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, Not};

/// Bitmask of permissions on a resource.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permissions(pub u32);

impl Permissions {
    /// No permission.
    pub const NONE: Permissions = Permissions(0);
    /// Read data or key material.
    pub const READ: Permissions = Permissions(1);
    /// Write data or rotate keys.
    pub const WRITE: Permissions = Permissions(2);
    /// Delete data.
    pub const DELETE: Permissions = Permissions(4);
    /// Change permissions.
    pub const ADMIN: Permissions = Permissions(8);
    /// Every permission.
    pub const FULL_CONTROL: Permissions = Permissions(1 | 2 | 4 | 8);

    /// True if every bit of `other` is set in `self`.
    pub fn contains(&self, other: Permissions) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if no bit is set.
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Effective mask: allow bits minus deny bits.
    pub fn effective(allow: Permissions, deny: Permissions) -> Permissions {
        allow & !deny
    }

    /// Deny always wins: `(allow & !deny) & requested == requested`.
    pub fn grants(allow: Permissions, deny: Permissions, requested: Permissions) -> bool {
        Self::effective(allow, deny).contains(requested)
    }
}

impl BitOr for Permissions {
    type Output = Permissions;
    fn bitor(self, rhs: Self) -> Self::Output {
        Permissions(self.0 | rhs.0)
    }
}

impl BitAnd for Permissions {
    type Output = Permissions;
    fn bitand(self, rhs: Self) -> Self::Output {
        Permissions(self.0 & rhs.0)
    }
}

impl Not for Permissions {
    type Output = Permissions;
    fn not(self) -> Self::Output {
        Permissions(!self.0 & Permissions::FULL_CONTROL.0)
    }
}

impl fmt::Display for Permissions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flags = [
            (Permissions::READ, 'r'),
            (Permissions::WRITE, 'w'),
            (Permissions::DELETE, 'd'),
            (Permissions::ADMIN, 'a'),
        ];
        for (flag, c) in flags {
            let shown = if self.contains(flag) { c } else { '-' };
            write!(f, "{shown}")?;
        }
        Ok(())
    }
}

/// One allow/deny rule for a subject on a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlEntry {
    /// Resource path (see [`ResourcePath`])
    pub resource: String,
    /// User or role the rule applies to
    pub subject: Subject,
    /// Granted bits
    pub allow: Permissions,
    /// Denied bits; win over `allow`
    pub deny: Permissions,
}

impl AccessControlEntry {
    /// Effective permission of this entry.
    pub fn effective(&self) -> Permissions {
        Permissions::effective(self.allow, self.deny)
    }
}

/// Resource path conventions shared by the key custodian and the engine.
pub struct ResourcePath;

impl ResourcePath {
    /// Resource guarding a key id.
    pub fn key(key_id: &str) -> String {
        format!("keys/{key_id}")
    }

    /// Resource guarding a bucket.
    pub fn bucket(bucket: &str) -> String {
        format!("buckets/{bucket}")
    }
}
