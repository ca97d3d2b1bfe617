//! Per-node worker loop.
//!
//! Each node polls the local store for pending shards assigned to it,
//! drives the external trainer process, and reports the outcome back
//! through the control API so the transition travels the replicated log.
//! The worker never mutates the store directly and never takes the
//! process down; failures are logged and the next poll carries on.

pub mod trainer;

pub use trainer::TrainResult;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{CoordError, Result};
use crate::exec::CommandSpec;
use crate::store::{now_secs, Job, JobStatus, JobStore};

pub struct Worker {
    node_id: String,
    cluster_size: u32,
    store: Arc<JobStore>,
    trainer: CommandSpec,
    update_url: String,
    http: reqwest::Client,
    poll: Duration,
}

impl Worker {
    pub fn new(config: &NodeConfig, store: Arc<JobStore>) -> Result<Self> {
        Ok(Self {
            node_id: config.node_id.clone(),
            cluster_size: config.cluster_size,
            store,
            trainer: CommandSpec::parse(&config.trainer_cmd)?,
            update_url: local_update_url(config.http_addr),
            http: reqwest::Client::new(),
            poll: Duration::from_millis(config.worker_poll_ms),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(node_id = %self.node_id, "worker started");
        let mut interval = tokio::time::interval(self.poll);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(job) = self.next_pending() else {
                continue;
            };
            self.process(job).await;
        }

        tracing::debug!(node_id = %self.node_id, "worker stopped");
    }

    /// First pending shard owned by this node, in store order. Completed
    /// shards are terminal and never picked up again.
    fn next_pending(&self) -> Option<Job> {
        self.store
            .all()
            .into_values()
            .find(|job| job.status == JobStatus::Pending && job.worker_id == self.node_id)
    }

    async fn process(&self, job: Job) {
        tracing::info!(job_id = %job.id, "claiming pending shard");

        // Mark the shard RUNNING first. Best effort: if the update cannot
        // be replicated right now the trainer still runs, and the health
        // monitor reclaims the shard if nothing ever lands.
        let now = now_secs();
        let mark = serde_json::json!({
            "id": job.id,
            "status": "RUNNING",
            "started_at": now,
            "updated_at": now,
        });
        if let Err(e) = self.post_update(&mark).await {
            tracing::warn!(job_id = %job.id, error = %e, "failed to mark shard running");
        }

        match trainer::run_trainer(&self.trainer, &job.id, &self.node_id, self.cluster_size).await {
            Ok(result) => {
                tracing::info!(
                    job_id = %job.id,
                    model_path = %result.model_path,
                    accuracy = result.accuracy,
                    "shard training completed"
                );
                let report = serde_json::json!({
                    "id": job.id,
                    "status": "COMPLETED",
                    "result_url": result.model_path,
                    "updated_at": now_secs(),
                });
                if let Err(e) = self.post_update(&report).await {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to report completion");
                }
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "shard training failed");
                let report = serde_json::json!({
                    "id": job.id,
                    "status": "FAILED",
                    "updated_at": now_secs(),
                });
                if let Err(e) = self.post_update(&report).await {
                    tracing::warn!(job_id = %job.id, error = %e, "failed to report failure");
                }
            }
        }
    }

    async fn post_update(&self, body: &serde_json::Value) -> Result<()> {
        let response = self.http.post(&self.update_url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(CoordError::Internal(format!(
                "update rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// The local control-API endpoint workers report through. A wildcard
/// bind address is reached via loopback.
fn local_update_url(http_addr: SocketAddr) -> String {
    if http_addr.ip().is_unspecified() {
        format!("http://127.0.0.1:{}/update", http_addr.port())
    } else {
        format!("http://{http_addr}/update")
    }
}
