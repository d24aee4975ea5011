//! Property-based tests over a mounted warehouse

use crate::harness::user;
use blobhouse_core::StorageIntent;
use blobhouse_engine::{DataWarehouse, WarehouseConfig};
use proptest::prelude::*;
use std::io::Cursor;
use tokio::runtime::Runtime;

/// Random payloads, empty included.
pub fn arb_data(max_size: usize) -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..max_size),
        // Long runs compress, which exercises the compression steps.
        (any::<u8>(), 1..max_size).prop_map(|(b, n)| vec![b; n]),
    ]
}

fn arb_intent() -> impl Strategy<Value = StorageIntent> {
    prop::sample::select(StorageIntent::ALL.to_vec())
}

fn arb_key() -> impl Strategy<Value = String> {
    "[a-z0-9/_.-]{1,40}"
}

fn mounted(rt: &Runtime) -> DataWarehouse {
    rt.block_on(async {
        let engine = DataWarehouse::new(WarehouseConfig::ephemeral());
        engine.mount().await.expect("mount");
        engine
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_store_retrieve_roundtrip(data in arb_data(8192), intent in arb_intent(), key in arb_key()) {
        let rt = Runtime::new().unwrap();
        let engine = mounted(&rt);
        let back = rt.block_on(async {
            let header = engine
                .store_object(&user("alice"), "props", &key, Cursor::new(data.clone()), intent)
                .await
                .unwrap();
            assert_eq!(header.size, data.len() as u64);
            engine.retrieve_object(&user("alice"), "props", &key).await.unwrap()
        });
        prop_assert_eq!(back.as_ref(), data.as_slice());
    }

    #[test]
    fn prop_same_content_same_uri(data in arb_data(4096), first in arb_intent(), second in arb_intent()) {
        let rt = Runtime::new().unwrap();
        let engine = mounted(&rt);
        let (a, b) = rt.block_on(async {
            let a = engine
                .store_object(&user("alice"), "props", "one", Cursor::new(data.clone()), first)
                .await
                .unwrap();
            let b = engine
                .store_object(&user("bob"), "props", "two", Cursor::new(data.clone()), second)
                .await
                .unwrap();
            (a, b)
        });
        // The first intent decides placement; a later store of the same bytes reuses it.
        prop_assert_eq!(&a.uri, &b.uri);
        prop_assert_eq!(a.content_hash, b.content_hash);
        prop_assert_eq!(engine.metrics().dedup_hits, 1);
    }

    #[test]
    fn prop_listing_matches_prefix(keys in prop::collection::btree_set(arb_key(), 1..12), prefix in "[a-z]{0,2}") {
        let rt = Runtime::new().unwrap();
        let engine = mounted(&rt);
        let listed = rt.block_on(async {
            for key in &keys {
                engine
                    .store_object(&user("alice"), "props", key, Cursor::new(key.clone().into_bytes()), StorageIntent::Cache)
                    .await
                    .unwrap();
            }
            engine.list_objects(&user("alice"), "props", &prefix).await.unwrap()
        });
        let expected: Vec<&String> = keys.iter().filter(|k| k.starts_with(&prefix)).collect();
        let got: Vec<&String> = listed.iter().map(|h| &h.key).collect();
        prop_assert_eq!(got, expected);
    }
}
