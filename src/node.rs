//! Node lifecycle: builds every subsystem from a `NodeConfig`, runs them
//! as cooperating tasks, and tears them down in order on shutdown.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::aggregator::Aggregator;
use crate::api::{self, ApiState};
use crate::config::NodeConfig;
use crate::consensus::node::RaftMessage;
use crate::consensus::storage::{SnapshotStore, WalStore};
use crate::consensus::{Fsm, RaftNode};
use crate::error::Result;
use crate::monitor::HealthMonitor;
use crate::store::JobStore;
use crate::transport;
use crate::worker::Worker;

/// Main node that owns all components
pub struct Node {
    pub config: NodeConfig,
    pub store: Arc<JobStore>,
    pub raft: Arc<RaftNode>,
    shutdown: CancellationToken,
}

impl Node {
    /// Recover durable state and construct the node.
    ///
    /// The newest snapshot (if any) is restored into the FSM before the
    /// WAL is replayed, so the apply loop resumes from the compaction
    /// point rather than the beginning of history.
    pub fn new(
        config: NodeConfig,
        shutdown: CancellationToken,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>)> {
        std::fs::create_dir_all(&config.data_dir)?;

        let store = Arc::new(JobStore::new());
        let fsm = Arc::new(Fsm::new(store.clone()));

        let snapshots = SnapshotStore::open(config.data_dir.join("snapshots"))?;
        let restored = match snapshots.latest()? {
            Some((meta, data)) => {
                fsm.restore(&data[..])?;
                tracing::info!(
                    index = meta.index,
                    term = meta.term,
                    jobs = store.len(),
                    "restored job store from snapshot"
                );
                Some(meta)
            }
            None => None,
        };

        let (wal, wal_state) = WalStore::open(config.data_dir.join("raft.wal"))?;
        tracing::info!(
            wal = %wal.path().display(),
            term = wal_state.current_term,
            entries = wal_state.entries.len(),
            members = wal_state.members.len(),
            "recovered write-ahead log"
        );

        let (raft, raft_rx) = RaftNode::new(
            config.node_id.clone(),
            config.raft_addr.to_string(),
            config.raft.clone(),
            config.snapshot_threshold,
            fsm,
            wal,
            wal_state,
            restored,
            snapshots,
            shutdown.clone(),
        );

        let node = Self {
            config,
            store,
            raft: Arc::new(raft),
            shutdown,
        };
        Ok((node, raft_rx))
    }

    /// Run the node until the shutdown token fires.
    ///
    /// Spawns the consensus loop, the apply loop, the peer transport, the
    /// worker, the health monitor, and the aggregator, then blocks serving
    /// the HTTP control API. When the API drains, consensus is stopped
    /// before the durable stores are flushed.
    pub async fn run(self, raft_rx: mpsc::Receiver<RaftMessage>) -> Result<()> {
        if self.config.bootstrap {
            self.raft.bootstrap_singleton().await?;
        }

        let raft_handle = tokio::spawn(self.raft.clone().run(raft_rx));
        let applier_handle = tokio::spawn(self.raft.clone().run_applier());

        let transport_handle = {
            let raft = self.raft.clone();
            let addr = self.config.raft_addr;
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = transport::serve(addr, raft, shutdown.clone()).await {
                    tracing::error!(error = %e, "consensus transport failed");
                    shutdown.cancel();
                }
            })
        };

        let worker = Worker::new(&self.config, self.store.clone())?;
        let worker_shutdown = self.shutdown.clone();
        let worker_handle = tokio::spawn(async move { worker.run(worker_shutdown).await });

        let monitor = HealthMonitor::new(&self.config, self.store.clone(), self.raft.clone());
        let monitor_shutdown = self.shutdown.clone();
        let monitor_handle = tokio::spawn(async move { monitor.run(monitor_shutdown).await });

        let aggregator = Aggregator::new(&self.config, self.store.clone())?;
        let aggregator_shutdown = self.shutdown.clone();
        let aggregator_handle = tokio::spawn(async move { aggregator.run(aggregator_shutdown).await });

        // The control API blocks until shutdown; it is the last listener
        // to stop accepting work.
        let api_state = ApiState {
            store: self.store.clone(),
            raft: self.raft.clone(),
            cluster_size: self.config.cluster_size,
            apply_timeout: self.config.apply_timeout(),
        };
        let serve_result = api::serve(self.config.http_addr, api_state, self.shutdown.clone()).await;
        if let Err(e) = &serve_result {
            tracing::error!(error = %e, "control api failed");
            self.shutdown.cancel();
        }

        // Ordered teardown: consensus loops stop before the WAL is synced
        // and (on drop) closed.
        let _ = raft_handle.await;
        let _ = applier_handle.await;
        self.raft.shutdown();
        let _ = transport_handle.await;
        let _ = worker_handle.await;
        let _ = monitor_handle.await;
        let _ = aggregator_handle.await;

        tracing::info!(node_id = %self.config.node_id, "node stopped");
        serve_result
    }
}
