//! Background aggregator: waits for a parent's full shard set to
//! complete, then drives the external merger over the shard artifacts.
//!
//! Runs on every node; the work is cheap and the merge itself is
//! idempotent. Nothing replicated records that a merge happened, so the
//! loop memoizes per process and a restarted node may re-merge a
//! completed set, which the merger contract allows.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::consensus::command;
use crate::error::{CoordError, Result};
use crate::exec::CommandSpec;
use crate::store::{Job, JobStatus, JobStore};

/// The merger's final stdout line:
/// `{parent_id, status, model_path, num_models}`.
#[derive(Debug, Clone, Deserialize)]
pub struct MergeResult {
    pub parent_id: String,
    pub status: String,
    pub model_path: String,
    pub num_models: u32,
}

/// Parents whose full shard set (`1..=cluster_size`) is COMPLETED with a
/// recorded artifact, together with the ordered artifact list.
pub fn complete_parents(
    jobs: &BTreeMap<String, Job>,
    cluster_size: u32,
) -> Vec<(String, Vec<String>)> {
    let mut parents: Vec<String> = Vec::new();
    for id in jobs.keys() {
        if let Some((parent, index)) = command::parse_shard_id(id) {
            if index >= 1 && index <= cluster_size && !parents.iter().any(|p| p == parent) {
                parents.push(parent.to_string());
            }
        }
    }

    parents
        .into_iter()
        .filter_map(|parent| {
            let mut models = Vec::with_capacity(cluster_size as usize);
            for index in 1..=cluster_size {
                let shard_id = command::shard_id(&parent, &command::worker_for_index(index));
                let job = jobs.get(&shard_id)?;
                if job.status != JobStatus::Completed || job.result_url.is_empty() {
                    return None;
                }
                models.push(job.result_url.clone());
            }
            Some((parent, models))
        })
        .collect()
}

/// Arguments handed to the merger:
/// `<parent> --models <url_1> … <url_N> --out <dir>/<parent>_global.pth`.
pub fn merge_args(parent_id: &str, models: &[String], out_dir: &Path) -> Vec<String> {
    let out_path = out_dir.join(format!("{parent_id}_global.pth"));
    let mut args = vec![parent_id.to_string(), "--models".to_string()];
    args.extend(models.iter().cloned());
    args.push("--out".to_string());
    args.push(out_path.to_string_lossy().into_owned());
    args
}

pub struct Aggregator {
    store: Arc<JobStore>,
    cluster_size: u32,
    merger: CommandSpec,
    out_dir: PathBuf,
    poll: Duration,
}

impl Aggregator {
    pub fn new(config: &NodeConfig, store: Arc<JobStore>) -> Result<Self> {
        Ok(Self {
            store,
            cluster_size: config.cluster_size,
            merger: CommandSpec::parse(&config.merger_cmd)?,
            out_dir: config.data_dir.clone(),
            poll: Duration::from_millis(config.aggregator_poll_ms),
        })
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!("aggregator started");
        let mut interval = tokio::time::interval(self.poll);
        // Parents merged by this process. Not replicated: a re-merge after
        // restart is observable to the merger and must be safe.
        let mut merged: HashSet<String> = HashSet::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {}
            }

            let jobs = self.store.all();
            for (parent, models) in complete_parents(&jobs, self.cluster_size) {
                if merged.contains(&parent) {
                    continue;
                }
                match self.merge(&parent, &models).await {
                    Ok(result) => {
                        tracing::info!(
                            parent = %parent,
                            num_models = result.num_models,
                            model_path = %result.model_path,
                            "merged shard models"
                        );
                        merged.insert(parent);
                    }
                    Err(e) => {
                        // Left un-memoized: a transient merger failure is
                        // retried on a later poll.
                        tracing::warn!(parent = %parent, error = %e, "merge failed");
                    }
                }
            }
        }

        tracing::debug!("aggregator stopped");
    }

    async fn merge(&self, parent_id: &str, models: &[String]) -> Result<MergeResult> {
        let args = merge_args(parent_id, models, &self.out_dir);
        let last_line = self.merger.run_last_line(args, parent_id).await?;
        serde_json::from_str(&last_line)
            .map_err(|e| CoordError::Process(format!("malformed merger result line: {e}")))
    }
}
