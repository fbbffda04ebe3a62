use burrowmq_core::{Attributes, MessageState, QueueConfig, QueueError};
use burrowmq_storage::{PersistentStore, Storage};
use chrono::Utc;
use std::io::Write;

fn queue_cfg(tenant: u64, name: &str) -> QueueConfig {
    QueueConfig::new(tenant, name.to_string(), None, None)
}

async fn open(dir: &std::path::Path) -> PersistentStore {
    PersistentStore::open(dir.to_path_buf()).expect("open store")
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path()).await;
        store.create_queue(queue_cfg(1, "orders")).await.unwrap();
        store
            .insert_message(1, "orders", b"alpha".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
        store
            .insert_message(1, "orders", b"beta".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
        store.tombstone(1, "orders", 1).await.unwrap();
    }

    let store = open(dir.path()).await;
    assert_eq!(store.list_queues(1).await.unwrap(), vec!["orders"]);

    let claimed = store
        .claim_visible(1, "orders", Utc::now(), None, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1, "tombstoned message must not come back");
    assert_eq!(claimed[0].body, b"beta");

    // ids keep increasing after restart
    let next = store
        .insert_message(1, "orders", b"gamma".to_vec(), Attributes::default(), Utc::now(), 30)
        .await
        .unwrap();
    assert_eq!(next, 3);
}

#[tokio::test]
async fn claims_survive_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path()).await;
        store.create_queue(queue_cfg(1, "work")).await.unwrap();
        store
            .insert_message(1, "work", b"job".to_vec(), Attributes::default(), Utc::now(), 300)
            .await
            .unwrap();
        let claimed = store
            .claim_visible(1, "work", Utc::now(), None, 1)
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
    }

    // the lease was logged: after restart the message is still invisible
    let store = open(dir.path()).await;
    let msg = store.peek(1, "work", 1).await.unwrap().unwrap();
    assert_eq!(msg.state, MessageState::Leased);
    let claimed = store
        .claim_visible(1, "work", Utc::now(), None, 1)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}

#[tokio::test]
async fn queue_delete_and_purge_replay() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path()).await;
        store.create_queue(queue_cfg(1, "keep")).await.unwrap();
        store.create_queue(queue_cfg(1, "drop")).await.unwrap();
        store
            .insert_message(1, "keep", b"m".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
        store
            .insert_message(1, "drop", b"m".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
        store.delete_queue(1, "drop").await.unwrap();
        store.purge_queue(1, "keep").await.unwrap();
    }

    let store = open(dir.path()).await;
    assert_eq!(store.list_queues(1).await.unwrap(), vec!["keep"]);
    assert!(matches!(
        store.get_queue(1, "drop").await,
        Err(QueueError::QueueNotFound)
    ));
    let stats = store.stats(1, "keep").await.unwrap();
    assert_eq!(stats.total, 0);
}

#[tokio::test]
async fn snapshot_then_trim_still_replays() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path()).await;
        store.create_queue(queue_cfg(1, "q")).await.unwrap();
        store
            .insert_message(1, "q", b"before".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
        let (snap_id, _) = store.admin_snapshot().await.unwrap();
        store.admin_trim_wal(&snap_id).await.unwrap();
        store
            .insert_message(1, "q", b"after".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
    }

    let store = open(dir.path()).await;
    let claimed = store
        .claim_visible(1, "q", Utc::now(), None, 10)
        .await
        .unwrap();
    let mut bodies: Vec<Vec<u8>> = claimed.into_iter().map(|m| m.body).collect();
    bodies.sort();
    assert_eq!(bodies, vec![b"after".to_vec(), b"before".to_vec()]);
}

#[tokio::test]
async fn corrupt_wal_tail_is_dropped() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = open(dir.path()).await;
        store.create_queue(queue_cfg(1, "q")).await.unwrap();
        store
            .insert_message(1, "q", b"good".to_vec(), Attributes::default(), Utc::now(), 30)
            .await
            .unwrap();
    }

    // simulate a torn write at the end of the current segment
    let seg = dir.path().join("wal").join("00000001.wal");
    let mut f = std::fs::OpenOptions::new().append(true).open(seg).unwrap();
    f.write_all(b"BMQW\x01\x04garbage-without-valid-length-or-crc")
        .unwrap();

    let store = open(dir.path()).await;
    let claimed = store
        .claim_visible(1, "q", Utc::now(), None, 10)
        .await
        .unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].body, b"good");
}
