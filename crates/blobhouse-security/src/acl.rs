//! Allow/deny access control with deny precedence.
//!
//! Rules live in one `DashMap` keyed by resource; each resource owns a `parking_lot::RwLock`
//! over its subject table, so checks on the same resource share a read lock and writers only
//! contend with their own resource.

use blobhouse_core::{
    AccessControl, AccessControlEntry, Permissions, Plugin, PluginCategory, PluginDescriptor,
    SecurityContext, Subject,
};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Plugin id of the built-in access control provider.
pub const ACL_PLUGIN_ID: &str = "acl-memory";

#[derive(Debug, Clone, Copy)]
struct Rule {
    allow: Permissions,
    deny: Permissions,
}

type SubjectTable = Arc<RwLock<HashMap<Subject, Rule>>>;

/// In-process access control provider.
pub struct MemoryAccessControl {
    descriptor: PluginDescriptor,
    resources: DashMap<String, SubjectTable>,
}

impl Default for MemoryAccessControl {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAccessControl {
    /// Empty rule set: everyone is denied everything.
    pub fn new() -> Self {
        Self {
            descriptor: PluginDescriptor::new(
                ACL_PLUGIN_ID,
                "In-memory access control",
                "1.0.0",
                PluginCategory::Security,
            )
            .with_tags(["access-control"]),
            resources: DashMap::new(),
        }
    }

    fn table(&self, resource: &str) -> Option<SubjectTable> {
        self.resources.get(resource).map(|t| Arc::clone(t.value()))
    }

    fn table_or_create(&self, resource: &str) -> SubjectTable {
        Arc::clone(
            self.resources
                .entry(resource.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(HashMap::new())))
                .value(),
        )
    }

    /// All rules on `resource`, sorted by subject.
    pub fn entries(&self, resource: &str) -> Vec<AccessControlEntry> {
        let Some(table) = self.table(resource) else {
            return Vec::new();
        };
        let mut out: Vec<AccessControlEntry> = table
            .read()
            .iter()
            .map(|(subject, rule)| AccessControlEntry {
                resource: resource.to_string(),
                subject: subject.clone(),
                allow: rule.allow,
                deny: rule.deny,
            })
            .collect();
        out.sort_by(|a, b| a.subject.cmp(&b.subject));
        out
    }

    /// Number of resources with at least one rule table.
    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }
}

impl Plugin for MemoryAccessControl {
    fn descriptor(&self) -> &PluginDescriptor {
        &self.descriptor
    }
}

impl AccessControl for MemoryAccessControl {
    fn set_permissions(
        &self,
        resource: &str,
        subject: &Subject,
        allow: Permissions,
        deny: Permissions,
    ) {
        let table = self.table_or_create(resource);
        table.write().insert(subject.clone(), Rule { allow, deny });
        debug!(resource, subject = %subject, allow = %allow, deny = %deny, "acl rule set");
    }

    fn has_access(&self, resource: &str, subject: &Subject, requested: Permissions) -> bool {
        let Some(table) = self.table(resource) else {
            return false;
        };
        let guard = table.read();
        match guard.get(subject) {
            Some(rule) => Permissions::grants(rule.allow, rule.deny, requested),
            None => false,
        }
    }

    fn create_scope(&self, resource: &str, owner: &Subject) {
        self.set_permissions(resource, owner, Permissions::FULL_CONTROL, Permissions::NONE);
    }

    fn check(&self, resource: &str, ctx: &SecurityContext, requested: Permissions) -> bool {
        if ctx.is_system_admin {
            return true;
        }
        let Some(table) = self.table(resource) else {
            return false;
        };
        let guard = table.read();
        let (allow, deny) = ctx
            .subjects()
            .filter_map(|s| guard.get(&s).copied())
            .fold((Permissions::NONE, Permissions::NONE), |(a, d), r| {
                (a | r.allow, d | r.deny)
            });
        Permissions::grants(allow, deny, requested)
    }

    fn remove_resource(&self, resource: &str) -> bool {
        self.resources.remove(resource).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const RES: &str = "keys/k1";

    #[test]
    fn default_is_deny() {
        let acl = MemoryAccessControl::new();
        assert!(!acl.has_access(RES, &Subject::user("alice"), Permissions::READ));
        assert!(!acl.check(RES, &SecurityContext::user("alice"), Permissions::READ));
    }

    #[test]
    fn scope_owner_gets_full_control_only() {
        let acl = MemoryAccessControl::new();
        acl.create_scope(RES, &Subject::user("owner"));
        assert!(acl.has_access(RES, &Subject::user("owner"), Permissions::FULL_CONTROL));
        assert!(!acl.has_access(RES, &Subject::user("other"), Permissions::READ));
    }

    #[test]
    fn deny_wins_over_allow() {
        let acl = MemoryAccessControl::new();
        let bob = Subject::user("bob");
        acl.set_permissions(RES, &bob, Permissions::READ | Permissions::WRITE, Permissions::WRITE);
        assert!(acl.has_access(RES, &bob, Permissions::READ));
        assert!(!acl.has_access(RES, &bob, Permissions::WRITE));
        assert!(!acl.has_access(RES, &bob, Permissions::READ | Permissions::WRITE));
    }

    #[test]
    fn role_grants_and_role_denies() {
        let acl = MemoryAccessControl::new();
        acl.set_permissions(RES, &Subject::role("readers"), Permissions::READ, Permissions::NONE);
        let carol = SecurityContext::user("carol").with_role("readers");
        assert!(acl.check(RES, &carol, Permissions::READ));
        assert!(!acl.check(RES, &carol, Permissions::WRITE));

        acl.set_permissions(RES, &Subject::role("suspended"), Permissions::NONE, Permissions::READ);
        let suspended = carol.clone().with_role("suspended");
        assert!(!acl.check(RES, &suspended, Permissions::READ));
    }

    #[test]
    fn system_admin_bypasses() {
        let acl = MemoryAccessControl::new();
        assert!(acl.check(RES, &SecurityContext::system(), Permissions::FULL_CONTROL));
    }

    #[test]
    fn remove_resource_drops_rules() {
        let acl = MemoryAccessControl::new();
        acl.create_scope(RES, &Subject::user("o"));
        assert_eq!(acl.entries(RES).len(), 1);
        assert!(acl.remove_resource(RES));
        assert!(!acl.remove_resource(RES));
        assert!(!acl.has_access(RES, &Subject::user("o"), Permissions::READ));
        assert_eq!(acl.resource_count(), 0);
    }

    #[test]
    fn set_replaces_previous_rule() {
        let acl = MemoryAccessControl::new();
        let s = Subject::user("dave");
        acl.set_permissions(RES, &s, Permissions::FULL_CONTROL, Permissions::NONE);
        acl.set_permissions(RES, &s, Permissions::READ, Permissions::NONE);
        assert!(!acl.has_access(RES, &s, Permissions::WRITE));
        assert_eq!(acl.entries(RES)[0].allow, Permissions::READ);
    }

    proptest! {
        #[test]
        fn prop_access_is_allow_minus_deny(
            allow in 0u32..16,
            deny in 0u32..16,
            requested in 1u32..16,
        ) {
            let acl = MemoryAccessControl::new();
            let s = Subject::user("p");
            acl.set_permissions(RES, &s, Permissions(allow), Permissions(deny));
            let expected = (allow & !deny) & requested == requested;
            prop_assert_eq!(acl.has_access(RES, &s, Permissions(requested)), expected);
            let ctx = SecurityContext::user("p");
            prop_assert_eq!(acl.check(RES, &ctx, Permissions(requested)), expected);
        }

        #[test]
        fn prop_deny_on_any_subject_wins(
            user_allow in 0u32..16,
            role_deny in 1u32..16,
        ) {
            let acl = MemoryAccessControl::new();
            acl.set_permissions(RES, &Subject::user("p"), Permissions(user_allow), Permissions::NONE);
            acl.set_permissions(RES, &Subject::role("r"), Permissions::NONE, Permissions(role_deny));
            let ctx = SecurityContext::user("p").with_role("r");
            prop_assert!(!acl.check(RES, &ctx, Permissions(role_deny)));
        }
    }
}
