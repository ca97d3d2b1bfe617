//! Durability tests: replicated state survives a node restart, with and
//! without snapshot compaction.

mod common;

use common::{start_node, wait_until, NodeOptions};
use mlcoord::store::{Job, JobStatus};

#[tokio::test]
async fn store_is_rebuilt_from_wal_after_restart() {
    let data = tempfile::tempdir().unwrap();

    let node = start_node(NodeOptions {
        data_dir: Some(data.path().to_path_buf()),
        ..NodeOptions::default()
    })
    .await;

    node.submit("job-a", "mnist_train").await;
    let store = node.store.clone();
    assert!(wait_until(5_000, || store.len() == 3).await);

    let mut shard = node.store.get("job-a-node-2").unwrap();
    shard.status = JobStatus::Completed;
    shard.result_url = "/tmp/m2.pth".to_string();
    node.apply_set_job(shard).await;

    node.stop().await;

    // Same data dir, fresh process.
    let node = start_node(NodeOptions {
        data_dir: Some(data.path().to_path_buf()),
        ..NodeOptions::default()
    })
    .await;

    let store = node.store.clone();
    assert!(
        wait_until(10_000, || {
            store
                .get("job-a-node-2")
                .is_some_and(|j| j.status == JobStatus::Completed)
        })
        .await,
        "state not recovered from wal"
    );
    let shard = node.store.get("job-a-node-2").unwrap();
    assert_eq!(shard.result_url, "/tmp/m2.pth");
    assert_eq!(node.store.len(), 3);

    node.stop().await;
}

#[tokio::test]
async fn snapshot_compaction_survives_restart() {
    let data = tempfile::tempdir().unwrap();

    let node = start_node(NodeOptions {
        data_dir: Some(data.path().to_path_buf()),
        snapshot_threshold: 5,
        ..NodeOptions::default()
    })
    .await;

    for i in 0..8 {
        let job = Job::shard(
            format!("job-{i}-node-1"),
            "mnist_train".to_string(),
            "node-1".to_string(),
        );
        node.apply_set_job(job).await;
    }

    // The applier crosses the threshold and compacts into a snapshot.
    let snapshot_dir = data.path().join("snapshots");
    assert!(
        wait_until(10_000, || {
            std::fs::read_dir(&snapshot_dir)
                .map(|entries| entries.count() > 0)
                .unwrap_or(false)
        })
        .await,
        "no snapshot was taken"
    );

    node.stop().await;

    let node = start_node(NodeOptions {
        data_dir: Some(data.path().to_path_buf()),
        snapshot_threshold: 5,
        ..NodeOptions::default()
    })
    .await;

    let store = node.store.clone();
    assert!(
        wait_until(10_000, || store.len() == 8).await,
        "state not recovered from snapshot + wal, have {} jobs",
        node.store.len()
    );
    assert!(node.store.get("job-0-node-1").is_some());
    assert!(node.store.get("job-7-node-1").is_some());

    node.stop().await;
}
