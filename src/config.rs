use std::net::SocketAddr;
use std::path::PathBuf;

/// Consensus timing knobs. The defaults suit a LAN cluster; tests shrink
/// them for faster elections.
#[derive(Debug, Clone)]
pub struct RaftTimings {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl Default for RaftTimings {
    fn default() -> Self {
        Self {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Unique node id, `"node-<i>"`. It names the shards this node owns
    /// and is handed to the trainer verbatim as its shard index.
    pub node_id: String,
    /// Address the consensus transport binds and advertises.
    pub raft_addr: SocketAddr,
    /// Address of the HTTP control API.
    pub http_addr: SocketAddr,
    /// Per-node directory holding the WAL and the snapshot subdirectory.
    pub data_dir: PathBuf,
    /// Establish a new single-server cluster instead of waiting to be
    /// joined by an existing leader.
    pub bootstrap: bool,
    /// Number of shards a parent job splits into, one per worker.
    pub cluster_size: u32,
    /// Trainer command line, e.g. `"python3 ml-code/train.py"`.
    pub trainer_cmd: String,
    /// Merger command line, e.g. `"python3 ml-code/merge.py"`.
    pub merger_cmd: String,
    pub raft: RaftTimings,
    /// How often the worker looks for pending shards.
    pub worker_poll_ms: u64,
    /// How often the aggregator looks for completed shard sets.
    pub aggregator_poll_ms: u64,
    /// How often the leader scans for stuck jobs.
    pub health_check_interval_ms: u64,
    /// A RUNNING job older than this is considered stuck.
    pub job_timeout_secs: i64,
    /// Stuck-job reassignments before a shard is failed for good.
    pub max_retries: u32,
    /// Deadline for replicating one command.
    pub apply_timeout_ms: u64,
    /// Applied entries between snapshots.
    pub snapshot_threshold: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            raft_addr: "127.0.0.1:7000".parse().unwrap(),
            http_addr: "127.0.0.1:8000".parse().unwrap(),
            data_dir: PathBuf::from("raft-data/node-1"),
            bootstrap: false,
            cluster_size: 3,
            trainer_cmd: "python3 ml-code/train.py".to_string(),
            merger_cmd: "python3 ml-code/merge.py".to_string(),
            raft: RaftTimings::default(),
            worker_poll_ms: 2_000,
            aggregator_poll_ms: 2_000,
            health_check_interval_ms: 5_000,
            job_timeout_secs: 15,
            max_retries: 2,
            apply_timeout_ms: 5_000,
            snapshot_threshold: 1_024,
        }
    }
}

impl NodeConfig {
    pub fn apply_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.apply_timeout_ms)
    }
}
