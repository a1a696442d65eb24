//! Crash-recovery, garbage-collection and nonce-durability tests.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;

use metafs_core::VolumeConfig;
use metafs_storage::checkpoint::CHECKPOINT_HEADER_NAME;
use metafs_storage::replay::{ReplayLog, Transaction, RECORD_ALIGNMENT};
use metafs_storage::{CheckpointHeader, LocalObjectClient, MockObjectClient, TreeKind, Volume};

fn test_config(replay_log_path: Option<PathBuf>) -> VolumeConfig {
    VolumeConfig {
        account_name: "acct".to_string(),
        checkpoint_container: "ckpt".to_string(),
        replay_log_path,
        checkpoint_interval_secs: 3600,
        nonce_values_to_reserve: 1000,
        first_nonce: 100,
        leaf_fanout: 4,
        leaf_cache_capacity: 8,
        halt_on_fatal_error: false,
        ..VolumeConfig::default()
    }
}

#[tokio::test]
async fn replay_restores_uncheckpointed_state() {
    let store_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();
    let config = test_config(Some(log_dir.path().join("replay.log")));

    {
        let client = Arc::new(LocalObjectClient::new(store_dir.path()).await.unwrap());
        let volume = Volume::up(client, config.clone(), true).await.unwrap();

        volume
            .put_inode_rec(0x11, Bytes::from_static(b"abc"))
            .await
            .unwrap();
        volume
            .put_log_segment_rec(0x21, Bytes::from_static(b"seg"))
            .await
            .unwrap();
        volume.delete_inode_rec(0x99).await.unwrap();

        // Crash: no final checkpoint.
        volume.abort();
    }

    let client = Arc::new(LocalObjectClient::new(store_dir.path()).await.unwrap());
    let volume = Volume::up(client, config, false).await.unwrap();

    assert_eq!(
        volume.get_inode_rec(0x11).await.unwrap(),
        Some(Bytes::from_static(b"abc"))
    );
    assert_eq!(
        volume.get_log_segment_rec(0x21).await.unwrap(),
        Some(Bytes::from_static(b"seg"))
    );
    volume.validate_layouts().await.unwrap();
    volume.down().await.unwrap();
}

#[tokio::test]
async fn torn_tail_is_truncated_on_replay() {
    let store_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();
    let log_path = log_dir.path().join("replay.log");
    let config = test_config(Some(log_path.clone()));

    {
        let client = Arc::new(LocalObjectClient::new(store_dir.path()).await.unwrap());
        let volume = Volume::up(client, config.clone(), true).await.unwrap();
        volume
            .put_inode_rec(1, Bytes::from_static(b"one"))
            .await
            .unwrap();
        volume
            .put_inode_rec(2, Bytes::from_static(b"two"))
            .await
            .unwrap();
        volume.abort();
    }

    // A third record torn mid-write: only 2000 of its bytes made it out.
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&log_path)
        .unwrap();
    file.write_all(&[0xCD; 2000]).unwrap();
    drop(file);

    let client = Arc::new(LocalObjectClient::new(store_dir.path()).await.unwrap());
    let volume = Volume::up(client, config, false).await.unwrap();

    assert_eq!(
        volume.get_inode_rec(1).await.unwrap(),
        Some(Bytes::from_static(b"one"))
    );
    assert_eq!(
        volume.get_inode_rec(2).await.unwrap(),
        Some(Bytes::from_static(b"two"))
    );
    assert_eq!(volume.tree_len(TreeKind::InodeRec).await.unwrap(), 2);
    assert_eq!(
        std::fs::metadata(&log_path).unwrap().len(),
        2 * RECORD_ALIGNMENT
    );

    volume.down().await.unwrap();
}

#[tokio::test]
async fn stale_log_from_an_older_checkpoint_is_ignored() {
    let store_dir = TempDir::new().unwrap();
    let log_dir = TempDir::new().unwrap();
    let log_path = log_dir.path().join("replay.log");
    let config = test_config(Some(log_path.clone()));

    // A leftover log whose records were written under a checkpoint object
    // this volume has never had.
    {
        let mut log = ReplayLog::new(log_path.clone());
        log.append(
            &Transaction::PutInodeRec {
                inode_number: 0x22,
                value: Bytes::from_static(b"stale"),
            },
            999,
        )
        .unwrap();
    }

    let client = Arc::new(LocalObjectClient::new(store_dir.path()).await.unwrap());
    let volume = Volume::up(client, config, true).await.unwrap();

    assert_eq!(volume.get_inode_rec(0x22).await.unwrap(), None);
    assert_eq!(std::fs::metadata(&log_path).unwrap().len(), 0);

    volume.down().await.unwrap();
}

#[tokio::test]
async fn gc_deletes_unreferenced_objects_after_header_swap() {
    let mock = Arc::new(MockObjectClient::new());
    let volume = Volume::up(mock.clone(), test_config(None), true)
        .await
        .unwrap();

    volume
        .put_inode_rec(0x1, Bytes::from_static(b"v1"))
        .await
        .unwrap();
    volume.checkpoint().await.unwrap();

    let first_object = "0000000000000065";
    assert!(mock.object("acct", "ckpt", first_object).is_some());
    assert!(volume
        .layout_report(TreeKind::InodeRec)
        .await
        .unwrap()
        .contains_key(&0x65));

    volume.delete_inode_rec(0x1).await.unwrap();
    volume.checkpoint().await.unwrap();

    // A third checkpoint request awaits the async deletes spawned by the
    // second one before doing anything else.
    volume.checkpoint().await.unwrap();

    assert_eq!(mock.deleted_objects(), vec![first_object.to_string()]);
    assert!(mock.object("acct", "ckpt", first_object).is_none());
    assert!(!volume
        .layout_report(TreeKind::InodeRec)
        .await
        .unwrap()
        .contains_key(&0x65));

    // The delete was issued strictly after the header POST that made it
    // safe: both checkpoints' POSTs precede it.
    let history = mock.call_history();
    let delete = history
        .iter()
        .position(|e| e.operation == "object_delete")
        .unwrap();
    let posts_before_delete = history[..delete]
        .iter()
        .filter(|e| e.operation == "container_post")
        .count();
    assert!(
        posts_before_delete >= 3,
        "expected the format and both checkpoint POSTs before the delete, saw {posts_before_delete}"
    );

    volume.validate_layouts().await.unwrap();
    volume.down().await.unwrap();
}

#[tokio::test]
async fn nonce_reservation_extends_before_first_use() {
    let mock = Arc::new(MockObjectClient::new());
    let volume = Volume::up(mock.clone(), test_config(None), true)
        .await
        .unwrap();

    let read_header = || {
        let headers = mock.container_headers("acct", "ckpt").unwrap();
        CheckpointHeader::parse(headers.get(CHECKPOINT_HEADER_NAME).unwrap()).unwrap()
    };

    // Formatted reservation is 100; the first allocation crosses it and
    // durably reserves the next window before returning.
    assert_eq!(read_header().reserved_to_nonce, 100);
    let first = volume.fetch_nonce().await.unwrap();
    assert_eq!(first, 101);
    assert_eq!(read_header().reserved_to_nonce, 1100);
    let posts_after_extension = mock.calls("container_post");

    // Draining the rest of the window posts nothing further.
    let mut last = first;
    for _ in 0..999 {
        last = volume.fetch_nonce().await.unwrap();
    }
    assert_eq!(last, 1100);
    assert_eq!(mock.calls("container_post"), posts_after_extension);

    // The next allocation crosses the mark again.
    let next = volume.fetch_nonce().await.unwrap();
    assert_eq!(next, 1101);
    assert_eq!(read_header().reserved_to_nonce, 2100);
    assert_eq!(mock.calls("container_post"), posts_after_extension + 1);

    volume.down().await.unwrap();
}

#[tokio::test]
async fn nonces_stay_unique_across_restart() {
    let mock = Arc::new(MockObjectClient::new());
    let config = test_config(None);

    let highest = {
        let volume = Volume::up(mock.clone(), config.clone(), true)
            .await
            .unwrap();
        let mut highest = 0;
        for _ in 0..5 {
            highest = volume.fetch_nonce().await.unwrap();
        }
        // Killed between reservation and use of the remaining window.
        volume.abort();
        highest
    };

    let volume = Volume::up(mock, config, false).await.unwrap();
    let after_restart = volume.fetch_nonce().await.unwrap();
    assert!(
        after_restart > highest,
        "nonce {after_restart} reused after restart (had handed out up to {highest})"
    );
    volume.down().await.unwrap();
}
