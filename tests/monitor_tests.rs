//! Health-monitor integration tests: stuck shards get rotated to the
//! next worker or failed once the retry budget is gone.

mod common;

use common::{start_node, wait_until, NodeOptions, QUIET_MS};
use mlcoord::store::{now_secs, Job, JobStatus};

fn stuck_shard(retry_count: u32) -> Job {
    Job {
        id: "job-b-node-1".to_string(),
        job_type: "mnist_train".to_string(),
        status: JobStatus::Running,
        worker_id: "node-1".to_string(),
        result_url: String::new(),
        started_at: now_secs() - 30,
        updated_at: now_secs() - 30,
        retry_count,
    }
}

fn monitor_options() -> NodeOptions {
    NodeOptions {
        // Keep the worker away from the reassigned shard.
        node_id: "node-9".to_string(),
        health_check_interval_ms: 100,
        job_timeout_secs: 15,
        worker_poll_ms: QUIET_MS,
        ..NodeOptions::default()
    }
}

#[tokio::test]
async fn stuck_shard_is_reassigned_to_next_worker() {
    let node = start_node(monitor_options()).await;

    node.apply_set_job(stuck_shard(0)).await;

    let store = node.store.clone();
    assert!(
        wait_until(10_000, || {
            store
                .get("job-b-node-1")
                .is_some_and(|j| j.status == JobStatus::Pending)
        })
        .await,
        "shard never reassigned"
    );

    let shard = node.get_job("job-b-node-1").await.unwrap();
    assert_eq!(shard.worker_id, "node-2");
    assert_eq!(shard.retry_count, 1);
    assert_eq!(shard.started_at, 0);
    assert!(shard.updated_at > 0);

    node.stop().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_shard() {
    let node = start_node(monitor_options()).await;

    node.apply_set_job(stuck_shard(2)).await;

    let store = node.store.clone();
    assert!(
        wait_until(10_000, || {
            store
                .get("job-b-node-1")
                .is_some_and(|j| j.status == JobStatus::Failed)
        })
        .await,
        "shard never failed"
    );

    let shard = node.get_job("job-b-node-1").await.unwrap();
    assert_eq!(shard.retry_count, 2);
    assert_eq!(shard.result_url, "");

    node.stop().await;
}

#[tokio::test]
async fn fresh_running_shards_are_left_alone() {
    let node = start_node(monitor_options()).await;

    let mut shard = stuck_shard(0);
    shard.started_at = now_secs();
    shard.updated_at = shard.started_at;
    node.apply_set_job(shard).await;

    // Several monitor cycles pass; the shard is within its timeout.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    let shard = node.store.get("job-b-node-1").unwrap();
    assert_eq!(shard.status, JobStatus::Running);
    assert_eq!(shard.retry_count, 0);

    node.stop().await;
}
