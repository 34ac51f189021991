// End-to-end behaviour of the distributed content store across two machines.

mod common;

use common::{TestCluster, hash_of};
use quarry_core::HashType;
use quarry_core::config::PinConfig;
use quarry_distributed::{ContentStoreError, CopyError, Pinned, ReclaimStats};
use std::sync::atomic::Ordering;
use tokio_util::sync::CancellationToken;

const PAYLOAD: &[u8] = b"compiled object file";

#[tokio::test]
async fn test_content_copies_between_machines() {
    let cluster = TestCluster::new();
    let a = cluster.machine(false).await;
    let mut b = cluster.machine(false).await;

    let path = a.write_file("out.o", PAYLOAD).await;
    let put = a.store.put_local(&path, HashType::Sha256).await.unwrap();
    assert_eq!(put.hash, hash_of(PAYLOAD));

    b.sync().await;
    let locations = b.store.get_locations(&put.hash).await.unwrap();
    assert_eq!(locations.locations, vec![a.location.clone()]);
    assert_eq!(locations.size, Some(PAYLOAD.len() as u64));

    let copied = b
        .store
        .copy_and_put(&put.hash, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(copied, put);
    assert_eq!(b.store.content().read(&put.hash).await.unwrap(), PAYLOAD);

    // b announced itself as a second location.
    b.sync().await;
    let locations = b.store.get_locations(&put.hash).await.unwrap();
    assert_eq!(locations.locations.len(), 2);
    assert!(locations.locations.contains(&b.location));
}

#[tokio::test]
async fn test_copy_of_unknown_content_is_exhausted() {
    let cluster = TestCluster::new();
    let b = cluster.machine(false).await;

    let err = b
        .store
        .copy_and_put(&hash_of(b"nobody has this"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ContentStoreError::Copy(CopyError::Exhausted { attempts: 0, .. })
    ));
}

#[tokio::test]
async fn test_pin_reports_where_content_lives() {
    let cluster = TestCluster::new();
    let a = cluster.machine(false).await;
    let mut b = cluster.machine(false).await;
    let cancel = CancellationToken::new();

    let path = a.write_file("out.o", PAYLOAD).await;
    let put = a.store.put_local(&path, HashType::Sha256).await.unwrap();
    b.sync().await;

    assert_eq!(a.store.pin(&put.hash, &cancel).await.unwrap(), Pinned::Local);
    assert_eq!(
        b.store.pin(&put.hash, &cancel).await.unwrap(),
        Pinned::Remote { replicas: 1 }
    );
    assert_eq!(
        b.store.pin(&hash_of(b"missing"), &cancel).await.unwrap(),
        Pinned::NotFound
    );
    assert!(!b.store.content().contains(&put.hash).await);
}

#[tokio::test]
async fn test_pin_copies_scarce_content_when_configured() {
    let cluster = TestCluster::new();
    let a = cluster.machine(false).await;
    let mut b = cluster.machine(false).await;
    let b_store = b.store.with_pin_config(PinConfig {
        min_replica_count: 2,
        copy_below_threshold: true,
    });
    b.store = b_store;

    let path = a.write_file("out.o", PAYLOAD).await;
    let put = a.store.put_local(&path, HashType::Sha256).await.unwrap();
    b.sync().await;

    assert_eq!(
        b.store.pin(&put.hash, &CancellationToken::new()).await.unwrap(),
        Pinned::Local
    );
    assert!(b.store.content().contains(&put.hash).await);
}

#[tokio::test]
async fn test_small_content_is_served_from_blob_store() {
    let cluster = TestCluster::new();
    let a = cluster.machine(true).await;
    let b = cluster.machine(true).await;

    let path = a.write_file("small", PAYLOAD).await;
    let put = a.store.put_local(&path, HashType::Sha256).await.unwrap();
    assert_eq!(cluster.shared.set_calls.load(Ordering::SeqCst), 1);

    // Without a peer copy path the blob store is the only source.
    assert!(a.store.content().delete(&put.hash).await.unwrap());

    let copied = b
        .store
        .copy_and_put(&put.hash, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(copied.size, PAYLOAD.len() as u64);
    assert_eq!(b.store.content().read(&put.hash).await.unwrap(), PAYLOAD);
    assert!(cluster.shared.get_calls.load(Ordering::SeqCst) >= 1);
}

#[tokio::test]
async fn test_reclaim_evicts_oldest_content_first() {
    let cluster = TestCluster::new();
    let a = cluster.machine(false).await;

    let mut hashes = Vec::new();
    for (name, size) in [("old", 10), ("middle", 20), ("new", 30)] {
        let data = vec![name.as_bytes()[0]; size];
        let path = a.write_file(name, &data).await;
        hashes.push(a.store.put_local(&path, HashType::Sha256).await.unwrap().hash);
        cluster.clock.advance(time::Duration::hours(2));
    }

    let stats = a.store.reclaim(1000).await.unwrap();
    assert_eq!(
        stats,
        ReclaimStats {
            scanned: 3,
            total_bytes: 60,
            evicted: 0,
            evicted_bytes: 0,
        }
    );

    let stats = a.store.reclaim(35).await.unwrap();
    assert_eq!(stats.evicted, 2);
    assert_eq!(stats.evicted_bytes, 30);

    let content = a.store.content();
    assert!(!content.contains(&hashes[0]).await);
    assert!(!content.contains(&hashes[1]).await);
    assert!(content.contains(&hashes[2]).await);

    let database = a.store.location_store().local_database();
    assert!(database.get(&hashes[0].to_short_hash()).await.unwrap().is_none());
    assert!(database.get(&hashes[2].to_short_hash()).await.unwrap().is_some());
}

#[tokio::test]
async fn test_reclaim_unregisters_content_missing_from_disk() {
    let cluster = TestCluster::new();
    let a = cluster.machine(false).await;

    let mut hashes = Vec::new();
    for (name, size) in [("old", 10), ("middle", 20), ("new", 30)] {
        let data = vec![name.as_bytes()[0]; size];
        let path = a.write_file(name, &data).await;
        hashes.push(a.store.put_local(&path, HashType::Sha256).await.unwrap().hash);
        cluster.clock.advance(time::Duration::hours(2));
    }
    // The oldest file vanishes behind the store's back.
    assert!(a.store.content().delete(&hashes[0]).await.unwrap());

    let stats = a.store.reclaim(35).await.unwrap();
    assert_eq!(stats.evicted, 1);
    assert_eq!(stats.evicted_bytes, 20);

    let database = a.store.location_store().local_database();
    assert!(database.get(&hashes[0].to_short_hash()).await.unwrap().is_none());
    assert!(database.get(&hashes[1].to_short_hash()).await.unwrap().is_none());
    assert!(database.get(&hashes[2].to_short_hash()).await.unwrap().is_some());
}
