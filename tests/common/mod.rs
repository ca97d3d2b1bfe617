//! Test harness for spawning full nodes with real HTTP and transport
//! listeners, fast consensus timings, and controllable background loops.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use mlcoord::aggregator::Aggregator;
use mlcoord::api::{self, ApiState};
use mlcoord::config::{NodeConfig, RaftTimings};
use mlcoord::consensus::command::{self, LogEvent};
use mlcoord::consensus::RaftNode;
use mlcoord::monitor::HealthMonitor;
use mlcoord::node::Node;
use mlcoord::store::{Job, JobStore};
use mlcoord::transport;
use mlcoord::worker::Worker;

/// A quiet interval for loops a test does not exercise.
pub const QUIET_MS: u64 = 3_600_000;

pub struct NodeOptions {
    pub node_id: String,
    pub bootstrap: bool,
    /// Port for the consensus transport; 0 is fine for single-node tests.
    pub raft_port: u16,
    pub cluster_size: u32,
    /// Reuse an existing data directory (restart tests); a tempdir is
    /// created otherwise.
    pub data_dir: Option<PathBuf>,
    pub trainer_cmd: String,
    pub merger_cmd: String,
    pub worker_poll_ms: u64,
    pub aggregator_poll_ms: u64,
    pub health_check_interval_ms: u64,
    pub job_timeout_secs: i64,
    pub snapshot_threshold: u64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            bootstrap: true,
            raft_port: 0,
            cluster_size: 3,
            data_dir: None,
            trainer_cmd: "python3 ml-code/train.py".to_string(),
            merger_cmd: "python3 ml-code/merge.py".to_string(),
            worker_poll_ms: QUIET_MS,
            aggregator_poll_ms: QUIET_MS,
            health_check_interval_ms: QUIET_MS,
            job_timeout_secs: 15,
            snapshot_threshold: 1_024,
        }
    }
}

pub struct TestNode {
    pub config: NodeConfig,
    pub store: Arc<JobStore>,
    pub raft: Arc<RaftNode>,
    pub base_url: String,
    pub client: reqwest::Client,
    pub data_dir: PathBuf,
    _tmp: Option<TempDir>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

pub async fn start_node(mut opts: NodeOptions) -> TestNode {
    let (tmp, data_dir) = match opts.data_dir.take() {
        Some(dir) => (None, dir),
        None => {
            let tmp = tempfile::tempdir().unwrap();
            let dir = tmp.path().to_path_buf();
            (Some(tmp), dir)
        }
    };

    // Bind the control API listener first so the worker knows its own
    // reporting endpoint.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let http_addr = listener.local_addr().unwrap();

    let config = NodeConfig {
        node_id: opts.node_id.clone(),
        raft_addr: format!("127.0.0.1:{}", opts.raft_port).parse().unwrap(),
        http_addr,
        data_dir: data_dir.clone(),
        bootstrap: opts.bootstrap,
        cluster_size: opts.cluster_size,
        trainer_cmd: opts.trainer_cmd.clone(),
        merger_cmd: opts.merger_cmd.clone(),
        // Shorter timeouts for faster tests
        raft: RaftTimings {
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 100,
            heartbeat_interval_ms: 20,
        },
        worker_poll_ms: opts.worker_poll_ms,
        aggregator_poll_ms: opts.aggregator_poll_ms,
        health_check_interval_ms: opts.health_check_interval_ms,
        job_timeout_secs: opts.job_timeout_secs,
        max_retries: 2,
        apply_timeout_ms: 5_000,
        snapshot_threshold: opts.snapshot_threshold,
    };

    let shutdown = CancellationToken::new();
    let (node, raft_rx) = Node::new(config.clone(), shutdown.clone()).unwrap();
    let store = node.store.clone();
    let raft = node.raft.clone();

    if config.bootstrap {
        raft.bootstrap_singleton().await.unwrap();
    }

    let mut handles = Vec::new();
    handles.push(tokio::spawn(raft.clone().run(raft_rx)));
    handles.push(tokio::spawn(raft.clone().run_applier()));

    {
        let raft = raft.clone();
        let addr = config.raft_addr;
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let _ = transport::serve(addr, raft, token).await;
        }));
    }

    {
        let worker = Worker::new(&config, store.clone()).unwrap();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { worker.run(token).await }));
    }
    {
        let monitor = HealthMonitor::new(&config, store.clone(), raft.clone());
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { monitor.run(token).await }));
    }
    {
        let aggregator = Aggregator::new(&config, store.clone()).unwrap();
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move { aggregator.run(token).await }));
    }

    {
        let state = ApiState {
            store: store.clone(),
            raft: raft.clone(),
            cluster_size: config.cluster_size,
            apply_timeout: config.apply_timeout(),
        };
        let token = shutdown.clone();
        handles.push(tokio::spawn(async move {
            let _ = axum::serve(listener, api::router(state))
                .with_graceful_shutdown(token.cancelled_owned())
                .await;
        }));
    }

    TestNode {
        base_url: format!("http://{http_addr}"),
        config,
        store,
        raft,
        client: reqwest::Client::new(),
        data_dir,
        _tmp: tmp,
        shutdown,
        handles,
    }
}

impl TestNode {
    pub async fn submit(&self, id: &str, job_type: &str) -> reqwest::Response {
        self.client
            .post(format!("{}/submit", self.base_url))
            .body(format!(r#"{{"id":"{id}","type":"{job_type}"}}"#))
            .send()
            .await
            .unwrap()
    }

    pub async fn update(&self, body: serde_json::Value) -> reqwest::Response {
        self.client
            .post(format!("{}/update", self.base_url))
            .body(body.to_string())
            .send()
            .await
            .unwrap()
    }

    pub async fn get_job(&self, id: &str) -> Option<Job> {
        let response = self
            .client
            .get(format!("{}/job?id={id}", self.base_url))
            .send()
            .await
            .unwrap();
        if response.status().is_success() {
            Some(response.json().await.unwrap())
        } else {
            None
        }
    }

    /// Replicate a full job record directly, bypassing the merge step.
    pub async fn apply_set_job(&self, job: Job) {
        let data = command::encode(&LogEvent::SetJob {
            job_id: job.id.clone(),
            job: Some(job),
        })
        .unwrap();
        self.raft
            .apply(data, Duration::from_secs(5))
            .await
            .unwrap();
    }

    /// Stop all loops and flush durable state, releasing ports and files.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.await;
        }
        self.raft.shutdown();
    }
}

impl Drop for TestNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for handle in &self.handles {
            handle.abort();
        }
    }
}

/// Poll `cond` until it holds or `deadline_ms` elapses.
pub async fn wait_until(deadline_ms: u64, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(deadline_ms);
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

/// Write an executable shell script for use as a fake trainer or merger.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    let mut perms = std::fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&path, perms).unwrap();
    path
}
