// Compare-exchange and scan consistency tests run against every backend.

mod common;

use bytes::Bytes;
use common::{backends, seeded_bytes};
use futures::StreamExt;
use quarry_storage::{FilesystemKeyValueStore, KeyValueStore, KeyValueStoreScanExt};
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn test_concurrent_increments_never_lose_updates() {
    let (_temp, stores) = backends().await;

    for store in stores {
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                for _ in 0..10 {
                    // Classic read / modify / compare-exchange retry loop.
                    loop {
                        let current = store.get("counters", "n").await.unwrap();
                        let value = current
                            .as_ref()
                            .map(|b| std::str::from_utf8(b).unwrap().parse::<u64>().unwrap())
                            .unwrap_or(0);
                        let next = Bytes::from((value + 1).to_string());
                        if store
                            .compare_exchange("counters", "n", current.as_deref(), Some(next))
                            .await
                            .unwrap()
                        {
                            break;
                        }
                    }
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let value = store.get("counters", "n").await.unwrap().unwrap();
        assert_eq!(
            std::str::from_utf8(&value).unwrap(),
            "80",
            "backend {} lost updates",
            store.backend_name()
        );
    }
}

#[tokio::test]
async fn test_scan_stream_yields_each_key_once_in_order() {
    let (_temp, stores) = backends().await;

    for store in stores {
        let mut expected = BTreeSet::new();
        for i in 0..57u64 {
            let key = format!("SHA2:{:020x}", i * 7919);
            store
                .compare_exchange("content", &key, None, Some(seeded_bytes(i, 16)))
                .await
                .unwrap();
            expected.insert(key);
        }
        // A key in another column and one outside the prefix must not appear.
        store
            .compare_exchange("other", "SHA2:zzz", None, Some(Bytes::from_static(b"x")))
            .await
            .unwrap();
        store
            .compare_exchange("content", "BLK3:0", None, Some(Bytes::from_static(b"x")))
            .await
            .unwrap();

        let keys: Vec<String> = store
            .scan_stream("content", "SHA2:", 10)
            .map(|entry| entry.unwrap().0)
            .collect()
            .await;

        let sorted: Vec<String> = expected.into_iter().collect();
        assert_eq!(keys, sorted, "backend {}", store.backend_name());
    }
}

#[tokio::test]
async fn test_scan_skips_keys_deleted_mid_scan() {
    let (_temp, stores) = backends().await;

    for store in stores {
        for key in ["a", "b", "c", "d"] {
            store
                .compare_exchange("c", key, None, Some(Bytes::from_static(b"v")))
                .await
                .unwrap();
        }

        let first = store.scan("c", "", None, 2).await.unwrap();
        assert_eq!(first.entries.len(), 2);

        store
            .compare_exchange("c", "c", Some(b"v"), None)
            .await
            .unwrap();

        let second = store
            .scan("c", "", first.next_start_after.as_deref(), 2)
            .await
            .unwrap();
        let keys: Vec<_> = second.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["d"]);
    }
}

#[tokio::test]
async fn test_filesystem_store_persists_across_reopen() {
    let temp = tempfile::tempdir().unwrap();
    let root = temp.path().join("kv");

    {
        let store = FilesystemKeyValueStore::open(&root).await.unwrap();
        store
            .compare_exchange("content", "k", None, Some(Bytes::from_static(b"v")))
            .await
            .unwrap();
    }

    let store = FilesystemKeyValueStore::open(&root).await.unwrap();
    assert_eq!(
        store.get("content", "k").await.unwrap(),
        Some(Bytes::from_static(b"v"))
    );
}

#[tokio::test]
async fn test_invalid_keys_and_columns_rejected() {
    let (_temp, stores) = backends().await;

    for store in stores {
        assert!(store.get("content", "").await.is_err());
        assert!(store.get("../up", "k").await.is_err());
    }
}
