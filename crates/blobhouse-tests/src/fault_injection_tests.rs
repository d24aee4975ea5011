//! Fault injection: failing saves and metadata writes, corrupted reads, cancelled and abandoned
//! stores, failed mounts and missing transforms.

use crate::chaos::{FailingIndex, FaultyStorage, ReversingTransform, REVERSING_TRANSFORM_ID};
use crate::harness::{user, TestEnv};
use blobhouse_core::{OperationContext, SecurityContext, StorageIntent, TransformRole, VaultError};
use blobhouse_engine::{DataWarehouse, PluginRegistration, WarehouseConfig, DEFAULT_USER_ROLE};
use blobhouse_meta::MemoryMetadataIndex;
use blobhouse_reduce::{IntentPolicy, PipelineConfig, PolicyStep};
use blobhouse_storage::MemoryProvider;
use bytes::Bytes;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

fn faulty_engine(config: WarehouseConfig) -> (DataWarehouse, Arc<FaultyStorage>, Arc<MemoryProvider>) {
    let inner = Arc::new(MemoryProvider::new());
    let storage = Arc::new(FaultyStorage::new(inner.clone()));
    let engine = DataWarehouse::new(config);
    engine
        .register_plugin(PluginRegistration::storage(storage.clone()))
        .unwrap();
    (engine, storage, inner)
}

#[tokio::test]
async fn test_failed_save_leaves_no_trace() {
    let (engine, storage, inner) = faulty_engine(WarehouseConfig::ephemeral());
    engine.mount().await.unwrap();
    let alice = user("alice");
    let body = b"written while the backend is down".to_vec();

    storage.set_fail_saves(true);
    let err = engine
        .store_object(&alice, "b", "k", Cursor::new(body.clone()), StorageIntent::Durable)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::BackendUnavailable(_)), "{err:?}");
    assert!(matches!(
        engine.stat_object(&alice, "b", "k").await,
        Err(VaultError::NotFound(_))
    ));
    assert_eq!(inner.object_count(), 0);
    assert_eq!(engine.metrics().errors, 1);

    // The failed attempt registered nothing, so the retry is a fresh write, not a dedup hit.
    storage.set_fail_saves(false);
    engine
        .store_object(&alice, "b", "k", Cursor::new(body.clone()), StorageIntent::Durable)
        .await
        .unwrap();
    assert_eq!(storage.save_count(), 1);
    assert_eq!(engine.metrics().dedup_hits, 0);
    assert_eq!(engine.retrieve_object(&alice, "b", "k").await.unwrap(), Bytes::from(body));
}

#[tokio::test]
async fn test_failed_metadata_write_rolls_back_dedup_and_bytes() {
    let index = Arc::new(FailingIndex::new(Arc::new(MemoryMetadataIndex::new())));
    let (engine, storage, inner) = faulty_engine(WarehouseConfig::ephemeral());
    engine
        .register_plugin(PluginRegistration::metadata(index.clone()))
        .unwrap();
    engine.mount().await.unwrap();
    let alice = user("alice");
    let body = b"indexed only on the second try".to_vec();

    index.set_fail_puts(true);
    let err = engine
        .store_object(&alice, "b", "k", Cursor::new(body.clone()), StorageIntent::Durable)
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::BackendUnavailable(_)), "{err:?}");
    assert_eq!(index.put_count(), 1);
    assert_eq!(storage.save_count(), 1);
    assert_eq!(inner.object_count(), 0);
    assert!(matches!(
        engine.stat_object(&alice, "b", "k").await,
        Err(VaultError::NotFound(_))
    ));
    // No dedup entry is left behind for a collector to find.
    assert_eq!(engine.run_gc().await.unwrap().scanned, 0);

    index.set_fail_puts(false);
    engine
        .store_object(&alice, "b", "k", Cursor::new(body.clone()), StorageIntent::Durable)
        .await
        .unwrap();
    assert_eq!(storage.save_count(), 2);
    assert_eq!(engine.metrics().dedup_hits, 0);
    assert_eq!(inner.object_count(), 1);
    assert_eq!(engine.retrieve_object(&alice, "b", "k").await.unwrap(), Bytes::from(body));
}

#[tokio::test]
async fn test_corrupted_plain_bytes_fail_the_hash_check() {
    let config = WarehouseConfig {
        pipeline: PipelineConfig {
            cache: IntentPolicy::default(),
            ..PipelineConfig::default()
        },
        ..WarehouseConfig::ephemeral()
    };
    let (engine, storage, _inner) = faulty_engine(config);
    engine.mount().await.unwrap();
    engine
        .store_object(&user("alice"), "b", "k", Cursor::new(b"stored without transforms".to_vec()), StorageIntent::Cache)
        .await
        .unwrap();

    storage.set_corrupt_loads(true);
    let err = engine.retrieve_object(&user("alice"), "b", "k").await.unwrap_err();
    assert!(matches!(err, VaultError::Corruption(_)), "{err:?}");

    storage.set_corrupt_loads(false);
    engine.retrieve_object(&user("alice"), "b", "k").await.unwrap();
}

#[tokio::test]
async fn test_corrupted_ciphertext_fails_authentication() {
    let (engine, storage, _inner) = faulty_engine(WarehouseConfig::ephemeral());
    engine.mount().await.unwrap();
    engine
        .store_object(&user("alice"), "b", "k", Cursor::new(b"sealed then tampered".repeat(30)), StorageIntent::Durable)
        .await
        .unwrap();

    storage.set_corrupt_loads(true);
    let err = engine.retrieve_object(&user("alice"), "b", "k").await.unwrap_err();
    assert!(matches!(err, VaultError::TransformFailed { .. }), "{err:?}");
}

#[tokio::test(start_paused = true)]
async fn test_cancel_during_save_discards_written_bytes() {
    let (engine, storage, inner) = faulty_engine(WarehouseConfig::ephemeral());
    storage.set_save_delay(Some(Duration::from_millis(50)));
    engine.mount().await.unwrap();
    let engine = Arc::new(engine);

    let ctx = OperationContext::new(SecurityContext::user("alice").with_role(DEFAULT_USER_ROLE));
    let cancel = ctx.cancel.clone();
    let store = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .store_object(&ctx, "b", "k", Cursor::new(b"abandoned halfway".to_vec()), StorageIntent::Cache)
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;
    cancel.cancel();

    let err = store.await.unwrap().unwrap_err();
    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(storage.save_count(), 1);
    assert_eq!(inner.object_count(), 0);
    assert!(matches!(
        engine.stat_object(&user("alice"), "b", "k").await,
        Err(VaultError::NotFound(_))
    ));

    // Nothing was registered: the same content writes again.
    storage.set_save_delay(None);
    engine
        .store_object(&user("alice"), "b", "k", Cursor::new(b"abandoned halfway".to_vec()), StorageIntent::Cache)
        .await
        .unwrap();
    assert_eq!(inner.object_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_abandoned_store_still_commits_its_write() {
    let (engine, storage, inner) = faulty_engine(WarehouseConfig::ephemeral());
    storage.set_save_delay(Some(Duration::from_millis(50)));
    engine.mount().await.unwrap();
    let alice = user("alice");

    let abandoned = tokio::time::timeout(
        Duration::from_millis(10),
        engine.store_object(&alice, "b", "k", Cursor::new(b"caller walked away".to_vec()), StorageIntent::Cache),
    )
    .await;
    assert!(abandoned.is_err());
    assert_eq!(storage.save_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(storage.save_count(), 1);
    assert_eq!(
        engine.retrieve_object(&alice, "b", "k").await.unwrap(),
        Bytes::from_static(b"caller walked away")
    );

    // The write is tracked, so deleting the blob lets GC reclaim it.
    engine.delete_object(&alice, "b", "k").await.unwrap();
    assert_eq!(engine.run_gc().await.unwrap().reclaimed, 1);
    assert_eq!(inner.object_count(), 0);
}

#[tokio::test]
async fn test_failed_open_aborts_mount() {
    let (engine, storage, _inner) = faulty_engine(WarehouseConfig::ephemeral());
    storage.set_fail_open(true);
    let err = engine.mount().await.unwrap_err();
    assert!(matches!(err, VaultError::BackendUnavailable(_)), "{err:?}");
    assert!(!engine.is_mounted());
    assert!(matches!(
        engine.retrieve_object(&user("alice"), "b", "k").await,
        Err(VaultError::InvalidState(_))
    ));

    storage.set_fail_open(false);
    engine.mount().await.unwrap();
    assert!(engine.is_mounted());
    engine.dismount().await.unwrap();
    assert_eq!(storage.close_count(), 1);
}

#[tokio::test]
async fn test_missing_transform_is_reported_on_read() {
    let env = TestEnv::new();
    let mut config = env.config();
    config.pipeline = PipelineConfig {
        durable: IntentPolicy {
            steps: vec![PolicyStep::new(TransformRole::Other, REVERSING_TRANSFORM_ID)],
        },
        skip_incompressible: false,
        ..PipelineConfig::default()
    };

    let header = {
        let engine = env.engine_with(config.clone());
        engine
            .register_plugin(PluginRegistration::transform(Arc::new(ReversingTransform::new())))
            .unwrap();
        engine.mount().await.unwrap();
        let header = engine
            .store_object(&user("alice"), "b", "k", Cursor::new(b"abc".to_vec()), StorageIntent::Durable)
            .await
            .unwrap();
        assert_eq!(
            engine.retrieve_object(&user("alice"), "b", "k").await.unwrap(),
            Bytes::from_static(b"abc")
        );
        engine.dismount().await.unwrap();
        header
    };
    let on_disk = std::fs::read(env.objects_dir().join(header.uri.locator())).unwrap();
    assert_eq!(on_disk, b"cba");

    let engine = env.engine_with(config);
    engine.mount().await.unwrap();
    let err = engine.retrieve_object(&user("alice"), "b", "k").await.unwrap_err();
    match err {
        VaultError::TransformUnavailable(id) => assert_eq!(id, REVERSING_TRANSFORM_ID),
        other => panic!("expected TransformUnavailable, got {other:?}"),
    }
    // Header-only paths still work without the transform.
    assert_eq!(engine.stat_object(&user("alice"), "b", "k").await.unwrap().size, 3);
    engine.dismount().await.unwrap();
}
