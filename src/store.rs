//! In-memory replicated job registry.
//!
//! The store is a passive container: all validation and mutation policy
//! lives in the FSM, which is the only writer on the replication path.
//! Background loops (worker, health monitor, aggregator) and the HTTP
//! `/job` handler read it concurrently; reads may observe any committed
//! prefix of the log.

use std::collections::BTreeMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "COMPLETED")]
    Completed,
    #[serde(rename = "FAILED")]
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "PENDING"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Completed => write!(f, "COMPLETED"),
            JobStatus::Failed => write!(f, "FAILED"),
        }
    }
}

impl JobStatus {
    /// Completed jobs are terminal: the worker and the health monitor skip
    /// them, and nothing on the replication path regresses them on purpose.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed)
    }
}

/// A single tracked unit of work. Parent jobs carry an empty `worker_id`;
/// shard jobs are keyed `"<parent>-<worker>"` and owned by one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub status: JobStatus,
    #[serde(default)]
    pub worker_id: String,
    #[serde(default)]
    pub result_url: String,
    #[serde(default)]
    pub started_at: i64,
    #[serde(default)]
    pub updated_at: i64,
    #[serde(default)]
    pub retry_count: u32,
}

impl Job {
    /// A freshly split shard: pending, unstarted, owned by `worker_id`.
    pub fn shard(id: String, job_type: String, worker_id: String) -> Self {
        Self {
            id,
            job_type,
            status: JobStatus::Pending,
            worker_id,
            result_url: String::new(),
            started_at: 0,
            updated_at: 0,
            retry_count: 0,
        }
    }
}

/// Seconds since the Unix epoch, the timestamp unit used throughout the
/// job records.
pub fn now_secs() -> i64 {
    Utc::now().timestamp()
}

/// Registry of jobs keyed by id.
///
/// Backed by a `BTreeMap` so that `snapshot_bytes` is canonical: two
/// replicas that applied the same log prefix produce byte-identical
/// snapshots regardless of insertion order.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: RwLock<BTreeMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot read of a single job.
    pub fn get(&self, id: &str) -> Option<Job> {
        self.jobs.read().get(id).cloned()
    }

    /// Unconditional upsert.
    pub fn put(&self, id: &str, job: Job) {
        self.jobs.write().insert(id.to_string(), job);
    }

    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    /// Canonical serialization of the whole map, stable across replicas.
    pub fn snapshot_bytes(&self) -> serde_json::Result<Vec<u8>> {
        let jobs = self.jobs.read();
        serde_json::to_vec(&*jobs)
    }

    /// Atomic replacement of the map from snapshot bytes.
    pub fn restore(&self, data: &[u8]) -> serde_json::Result<()> {
        let restored: BTreeMap<String, Job> = serde_json::from_slice(data)?;
        *self.jobs.write() = restored;
        Ok(())
    }

    /// Jobs that have been `RUNNING` for longer than `timeout_secs`.
    /// Jobs with `started_at == 0` were never observed starting and are
    /// not considered stuck.
    pub fn stuck(&self, timeout_secs: i64) -> Vec<Job> {
        let now = now_secs();
        self.jobs
            .read()
            .values()
            .filter(|j| {
                j.status == JobStatus::Running && j.started_at > 0 && now - j.started_at > timeout_secs
            })
            .cloned()
            .collect()
    }

    /// Defensive copy of the whole map for iteration outside the lock.
    pub fn all(&self) -> BTreeMap<String, Job> {
        self.jobs.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_job(id: &str, started_at: i64) -> Job {
        Job {
            id: id.to_string(),
            job_type: "mnist_train".to_string(),
            status: JobStatus::Running,
            worker_id: "node-1".to_string(),
            result_url: String::new(),
            started_at,
            updated_at: started_at,
            retry_count: 0,
        }
    }

    #[test]
    fn put_then_get_round_trips() {
        let store = JobStore::new();
        let job = Job::shard("job-a-node-1".into(), "mnist_train".into(), "node-1".into());

        store.put(&job.id.clone(), job.clone());

        assert_eq!(store.get("job-a-node-1"), Some(job));
        assert_eq!(store.get("missing"), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn put_overwrites_existing() {
        let store = JobStore::new();
        let mut job = Job::shard("j".into(), "mnist_train".into(), "node-1".into());
        store.put("j", job.clone());

        job.status = JobStatus::Completed;
        job.result_url = "/tmp/model.pth".into();
        store.put("j", job.clone());

        assert_eq!(store.get("j"), Some(job));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn stuck_filters_by_status_and_age() {
        let store = JobStore::new();
        let now = now_secs();

        store.put("old-running", running_job("old-running", now - 30));
        store.put("fresh-running", running_job("fresh-running", now - 2));
        // Never observed starting; the monitor must not reclaim it.
        store.put("unstarted", running_job("unstarted", 0));
        let mut done = running_job("done", now - 30);
        done.status = JobStatus::Completed;
        done.result_url = "/tmp/m.pth".into();
        store.put("done", done);

        let stuck = store.stuck(15);
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].id, "old-running");
    }

    #[test]
    fn snapshot_restore_round_trips() {
        let store = JobStore::new();
        store.put("b", Job::shard("b".into(), "mnist_train".into(), "node-2".into()));
        store.put("a", Job::shard("a".into(), "mnist_train".into(), "node-1".into()));

        let bytes = store.snapshot_bytes().unwrap();

        let restored = JobStore::new();
        restored.put("stale", Job::shard("stale".into(), "x".into(), "node-9".into()));
        restored.restore(&bytes).unwrap();

        assert_eq!(restored.all(), store.all());
        assert_eq!(restored.get("stale"), None);
    }

    #[test]
    fn snapshot_is_canonical_regardless_of_insertion_order() {
        let forward = JobStore::new();
        forward.put("a", Job::shard("a".into(), "t".into(), "node-1".into()));
        forward.put("b", Job::shard("b".into(), "t".into(), "node-2".into()));

        let reverse = JobStore::new();
        reverse.put("b", Job::shard("b".into(), "t".into(), "node-2".into()));
        reverse.put("a", Job::shard("a".into(), "t".into(), "node-1".into()));

        assert_eq!(
            forward.snapshot_bytes().unwrap(),
            reverse.snapshot_bytes().unwrap()
        );
    }

    #[test]
    fn status_serializes_upper_case() {
        let job = Job::shard("j".into(), "mnist_train".into(), "node-1".into());
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "PENDING");
        assert_eq!(json["type"], "mnist_train");
    }
}
