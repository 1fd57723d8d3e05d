use std::sync::Arc;
use std::time::Duration;

use des_core::models::{EventRecord, SampleRecord, Source};
use des_storage::{Provisioned, StoreHandle, StoreProvisioner};
use tokio::test;

#[test]
async fn test_disconnect_waits_for_background_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = StoreHandle::open("demo42_cmdarchive", dir.path().join("demo42_cmdarchive.redb"))
        .unwrap();

    const N: i64 = 64;
    let writes: Vec<_> = (0..N)
        .map(|i| {
            store.create_in_background(SampleRecord {
                time: 1_700_000_000_000 + i,
                press: i as f32,
                ..Default::default()
            })
        })
        .collect();

    store.disconnect().await;
    assert_eq!(store.pending(), 0);

    // Every write issued before the disconnect committed.
    for write in writes {
        write.await.unwrap().unwrap();
    }

    store.connect().unwrap();
    assert_eq!(store.count::<SampleRecord>().unwrap(), N as u64);
}

#[test]
async fn test_disconnect_from_another_task() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<StoreHandle> =
        StoreHandle::open("demo42_1", dir.path().join("demo42_1.redb")).unwrap();

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            let mut handles = Vec::new();
            for i in 0..32 {
                handles.push(store.create_in_background(EventRecord::new(
                    "DEMO42",
                    "DEMO42_1",
                    2000,
                    Source::server(i),
                    format!("note {}", i),
                )));
                tokio::task::yield_now().await;
            }
            handles
        })
    };

    let handles = writer.await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), store.disconnect())
        .await
        .unwrap();
    for h in handles {
        assert!(h.await.unwrap().is_ok());
    }
    assert!(!store.is_connected());
}

#[test]
async fn test_provisioned_store_reopens() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = StoreProvisioner::new(dir.path());

    let Provisioned::Created(store) = provisioner.create("DEMO42_1700000000000").unwrap() else {
        panic!("expected a new store");
    };
    store.create(SampleRecord::default()).unwrap();
    store.disconnect().await;

    let reopened = provisioner.connect("DEMO42_1700000000000").unwrap();
    assert_eq!(reopened.count::<SampleRecord>().unwrap(), 1);
    assert_eq!(reopened.name(), "DEMO42_1700000000000");
}
