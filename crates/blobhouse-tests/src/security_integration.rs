//! Access control integration: bucket ACLs, key access and the audit trail.

use crate::harness::{admin, user};
use blobhouse_core::{
    OperationContext, Permissions, ResourcePath, SecurityContext, StorageIntent, Subject,
    VaultError,
};
use blobhouse_engine::{DataWarehouse, WarehouseConfig};
use blobhouse_security::{AuditAction, MemoryAuditLog};
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;

async fn guarded_engine() -> (DataWarehouse, Arc<MemoryAuditLog>) {
    let log = Arc::new(MemoryAuditLog::new(1024));
    let config = WarehouseConfig {
        enforce_bucket_acl: true,
        ..WarehouseConfig::ephemeral()
    };
    let engine = DataWarehouse::new(config).with_audit_sink(log.clone());
    engine.mount().await.unwrap();
    (engine, log)
}

#[tokio::test]
async fn test_denied_then_granted_then_allowed() {
    let (engine, log) = guarded_engine().await;
    let alice = user("alice");

    let err = engine
        .store_object(&alice, "finance", "ledger", Cursor::new(b"1,2,3".to_vec()), StorageIntent::Durable)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::AccessDenied));
    assert_eq!(err.to_string(), "access denied");

    let acl = engine.access_control().unwrap();
    acl.set_permissions(
        &ResourcePath::bucket("finance"),
        &Subject::user("alice"),
        Permissions::READ | Permissions::WRITE,
        Permissions::NONE,
    );

    engine
        .store_object(&alice, "finance", "ledger", Cursor::new(b"1,2,3".to_vec()), StorageIntent::Durable)
        .await
        .unwrap();
    assert_eq!(
        engine.retrieve_object(&alice, "finance", "ledger").await.unwrap(),
        Bytes::from_static(b"1,2,3")
    );

    let denied = log.query(|e| e.action == AuditAction::Store && !e.success);
    let allowed = log.query(|e| e.action == AuditAction::Store && e.success);
    assert_eq!(denied.len(), 1);
    assert_eq!(allowed.len(), 1);
    assert_eq!(denied[0].identity, "alice");
    assert_eq!(denied[0].resource, "finance/ledger");
}

#[tokio::test]
async fn test_denial_does_not_reveal_existence() {
    let (engine, _log) = guarded_engine().await;
    engine
        .access_control()
        .unwrap()
        .create_scope(&ResourcePath::bucket("private"), &Subject::user("alice"));
    engine
        .store_object(&user("alice"), "private", "exists", Cursor::new(b"x".to_vec()), StorageIntent::Cache)
        .await
        .unwrap();

    let mallory = user("mallory");
    let existing = engine.retrieve_object(&mallory, "private", "exists").await.unwrap_err();
    let missing = engine.retrieve_object(&mallory, "private", "missing").await.unwrap_err();
    assert!(matches!(existing, VaultError::AccessDenied));
    assert!(matches!(missing, VaultError::AccessDenied));
    assert!(matches!(
        engine.stat_object(&mallory, "private", "exists").await,
        Err(VaultError::AccessDenied)
    ));
    assert!(matches!(
        engine.list_objects(&mallory, "private", "").await,
        Err(VaultError::AccessDenied)
    ));
}

#[tokio::test]
async fn test_role_grants_and_deny_wins() {
    let (engine, _log) = guarded_engine().await;
    let acl = engine.access_control().unwrap();
    let bucket = ResourcePath::bucket("shared");
    acl.set_permissions(&bucket, &Subject::role("analysts"), Permissions::READ | Permissions::WRITE, Permissions::NONE);
    acl.set_permissions(&bucket, &Subject::user("eve"), Permissions::NONE, Permissions::WRITE);

    let carol = OperationContext::new(SecurityContext::user("carol").with_role("analysts").with_role("storage-user"));
    let eve = OperationContext::new(SecurityContext::user("eve").with_role("analysts").with_role("storage-user"));

    engine
        .store_object(&carol, "shared", "k", Cursor::new(b"data".to_vec()), StorageIntent::Cache)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .store_object(&eve, "shared", "k2", Cursor::new(b"data".to_vec()), StorageIntent::Cache)
            .await,
        Err(VaultError::AccessDenied)
    ));
    // Eve's deny is on WRITE only.
    engine.retrieve_object(&eve, "shared", "k").await.unwrap();
}

#[tokio::test]
async fn test_delete_needs_delete_permission() {
    let (engine, _log) = guarded_engine().await;
    let acl = engine.access_control().unwrap();
    acl.set_permissions(
        &ResourcePath::bucket("b"),
        &Subject::user("alice"),
        Permissions::READ | Permissions::WRITE,
        Permissions::NONE,
    );
    engine
        .store_object(&user("alice"), "b", "k", Cursor::new(b"x".to_vec()), StorageIntent::Cache)
        .await
        .unwrap();
    assert!(matches!(
        engine.delete_object(&user("alice"), "b", "k").await,
        Err(VaultError::AccessDenied)
    ));
    acl.set_permissions(&ResourcePath::bucket("b"), &Subject::user("alice"), Permissions::FULL_CONTROL, Permissions::NONE);
    engine.delete_object(&user("alice"), "b", "k").await.unwrap();
}

#[tokio::test]
async fn test_encrypted_intents_need_key_access() {
    let engine = DataWarehouse::new(WarehouseConfig::ephemeral());
    engine.mount().await.unwrap();
    let outsider = OperationContext::new(SecurityContext::user("outsider"));

    // Cache is unencrypted: no key needed.
    engine
        .store_object(&outsider, "b", "plain", Cursor::new(b"x".to_vec()), StorageIntent::Cache)
        .await
        .unwrap();
    assert!(matches!(
        engine
            .store_object(&outsider, "b", "sealed", Cursor::new(b"x".to_vec()), StorageIntent::Durable)
            .await,
        Err(VaultError::AccessDenied)
    ));

    engine
        .store_object(&user("alice"), "b", "sealed", Cursor::new(b"secret".to_vec()), StorageIntent::Durable)
        .await
        .unwrap();
    assert!(matches!(
        engine.retrieve_object(&outsider, "b", "sealed").await,
        Err(VaultError::AccessDenied)
    ));

    engine.access_control().unwrap().set_permissions(
        &ResourcePath::key("default"),
        &Subject::user("outsider"),
        Permissions::READ,
        Permissions::NONE,
    );
    assert_eq!(
        engine.retrieve_object(&outsider, "b", "sealed").await.unwrap(),
        Bytes::from_static(b"secret")
    );
}

#[tokio::test]
async fn test_key_rotation_is_audited_and_gated() {
    let (engine, log) = guarded_engine().await;
    assert!(matches!(engine.rotate_key(&user("alice")).await, Err(VaultError::AccessDenied)));
    assert_eq!(engine.rotate_key(&admin()).await.unwrap(), 2);

    let rotations = log.query(|e| e.action == AuditAction::RotateKey);
    assert_eq!(rotations.len(), 2);
    assert!(!rotations[0].success);
    assert!(rotations[1].success);
    assert_eq!(rotations[1].resource, ResourcePath::key("default"));
}

#[tokio::test]
async fn test_lifecycle_is_audited() {
    let (engine, log) = guarded_engine().await;
    engine.dismount().await.unwrap();
    assert_eq!(log.query(|e| e.action == AuditAction::Mount && e.success).len(), 1);
    assert_eq!(log.query(|e| e.action == AuditAction::Dismount).len(), 1);
    let trace = log.query(|_| true);
    assert!(trace.windows(2).all(|w| w[0].id < w[1].id));
}
