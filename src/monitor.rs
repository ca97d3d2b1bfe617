//! Leader-only health monitor.
//!
//! Scans for shards that have been RUNNING past the job timeout and
//! either rotates them to the next worker or fails them once the retry
//! budget is spent. Every decision flows through the replicated log, so
//! followers observe reassignments the same way they observe any other
//! update.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::consensus::command::{self, LogEvent};
use crate::consensus::{RaftNode, RaftRole};
use crate::store::{now_secs, Job, JobStatus, JobStore};

/// What to do about one stuck shard.
#[derive(Debug, PartialEq)]
pub enum StuckAction {
    /// Retry budget exhausted: fail the shard for good.
    Fail(Job),
    /// Hand the shard to the next worker in rotation.
    Reassign(Job),
}

/// Decide how to handle a stuck shard. Pure so the rotation and retry
/// rules are testable without a cluster.
pub fn plan_stuck_action(mut job: Job, max_retries: u32, cluster_size: u32, now: i64) -> StuckAction {
    job.updated_at = now;
    if job.retry_count >= max_retries {
        job.status = JobStatus::Failed;
        return StuckAction::Fail(job);
    }
    job.worker_id = next_worker(&job.worker_id, cluster_size);
    job.status = JobStatus::Pending;
    job.retry_count += 1;
    job.started_at = 0;
    StuckAction::Reassign(job)
}

/// Deterministic round-robin: from `node-k` over `N` workers the next
/// worker is `node-((k mod N) + 1)`, so a stuck shard never lands back
/// on the worker suspected dead (unless the cluster has one node).
pub fn next_worker(current: &str, cluster_size: u32) -> String {
    let k = command::parse_node_index(current).unwrap_or(0);
    if cluster_size == 0 {
        return command::worker_for_index(1);
    }
    command::worker_for_index((k % cluster_size) + 1)
}

pub struct HealthMonitor {
    store: Arc<JobStore>,
    raft: Arc<RaftNode>,
    cluster_size: u32,
    job_timeout_secs: i64,
    max_retries: u32,
    interval: Duration,
    apply_timeout: Duration,
}

impl HealthMonitor {
    pub fn new(config: &NodeConfig, store: Arc<JobStore>, raft: Arc<RaftNode>) -> Self {
        Self {
            store,
            raft,
            cluster_size: config.cluster_size,
            job_timeout_secs: config.job_timeout_secs,
            max_retries: config.max_retries,
            interval: Duration::from_millis(config.health_check_interval_ms),
            apply_timeout: config.apply_timeout(),
        }
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            timeout_secs = self.job_timeout_secs,
            interval_ms = self.interval.as_millis() as u64,
            "health monitor started"
        );
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            // Only the leader reclaims stuck work; followers idle.
            if self.raft.role().await != RaftRole::Leader {
                continue;
            }

            let stuck = self.store.stuck(self.job_timeout_secs);
            if stuck.is_empty() {
                continue;
            }
            tracing::warn!(count = stuck.len(), "found stuck jobs");

            for job in stuck {
                self.handle_stuck(job).await;
            }
        }

        tracing::debug!("health monitor stopped");
    }

    async fn handle_stuck(&self, job: Job) {
        // Re-read: the shard may have completed between the scan and now,
        // and COMPLETED is terminal.
        let Some(current) = self.store.get(&job.id) else {
            return;
        };
        if current.status != JobStatus::Running || current.status.is_terminal() {
            return;
        }

        let action = plan_stuck_action(current, self.max_retries, self.cluster_size, now_secs());
        let job = match &action {
            StuckAction::Fail(job) => {
                tracing::warn!(
                    job_id = %job.id,
                    retries = job.retry_count,
                    "retry budget exhausted, failing shard"
                );
                job
            }
            StuckAction::Reassign(job) => {
                tracing::info!(
                    job_id = %job.id,
                    new_worker = %job.worker_id,
                    retry = job.retry_count,
                    max_retries = self.max_retries,
                    "reassigning stuck shard"
                );
                job
            }
        };

        let event = LogEvent::SetJob {
            job_id: job.id.clone(),
            job: Some(job.clone()),
        };
        let data = match command::encode(&event) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "failed to encode stuck-job update");
                return;
            }
        };
        if let Err(e) = self.raft.apply(data, self.apply_timeout).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to replicate stuck-job update");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stuck_job(worker: &str, retry_count: u32) -> Job {
        Job {
            id: format!("job-b-{worker}"),
            job_type: "mnist_train".to_string(),
            status: JobStatus::Running,
            worker_id: worker.to_string(),
            result_url: String::new(),
            started_at: 100,
            updated_at: 100,
            retry_count,
        }
    }

    #[test]
    fn rotation_follows_modular_formula() {
        assert_eq!(next_worker("node-1", 3), "node-2");
        assert_eq!(next_worker("node-2", 3), "node-3");
        assert_eq!(next_worker("node-3", 3), "node-1");
        assert_eq!(next_worker("node-2", 5), "node-3");
        // Unparsable worker falls back to the first worker.
        assert_eq!(next_worker("unknown", 3), "node-1");
    }

    #[test]
    fn reassignment_increments_retry_and_resets_start() {
        let action = plan_stuck_action(stuck_job("node-1", 0), 2, 3, 500);
        match action {
            StuckAction::Reassign(job) => {
                assert_eq!(job.status, JobStatus::Pending);
                assert_eq!(job.worker_id, "node-2");
                assert_eq!(job.retry_count, 1);
                assert_eq!(job.started_at, 0);
                assert_eq!(job.updated_at, 500);
            }
            other => panic!("expected reassignment, got {other:?}"),
        }
    }

    #[test]
    fn exhausted_retries_fail_the_shard() {
        let action = plan_stuck_action(stuck_job("node-1", 2), 2, 3, 500);
        match action {
            StuckAction::Fail(job) => {
                assert_eq!(job.status, JobStatus::Failed);
                assert_eq!(job.retry_count, 2);
                assert_eq!(job.updated_at, 500);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn rotation_walks_every_worker_before_repeating() {
        let mut worker = "node-1".to_string();
        let mut seen = vec![worker.clone()];
        for _ in 0..2 {
            worker = next_worker(&worker, 3);
            seen.push(worker.clone());
        }
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 3);
    }
}
