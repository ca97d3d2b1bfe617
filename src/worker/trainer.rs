//! Contract with the external trainer process.

use serde::Deserialize;

use crate::error::{CoordError, Result};
use crate::exec::CommandSpec;

/// The trainer's final stdout line:
/// `{job_id, status, accuracy, loss, model_path}`.
#[derive(Debug, Clone, Deserialize)]
pub struct TrainResult {
    pub job_id: String,
    pub status: String,
    #[serde(default)]
    pub accuracy: f64,
    #[serde(default)]
    pub loss: f64,
    pub model_path: String,
}

/// Invoke the trainer as
/// `<trainer> <job_id> --shard_index <node_id> --total_shards <n>` and
/// parse its final non-empty stdout line.
///
/// The shard index argument is the full node id (`"node-2"`), not a bare
/// number; the trainer derives its numeric shard from the id.
pub async fn run_trainer(
    trainer: &CommandSpec,
    job_id: &str,
    node_id: &str,
    total_shards: u32,
) -> Result<TrainResult> {
    let args = vec![
        job_id.to_string(),
        "--shard_index".to_string(),
        node_id.to_string(),
        "--total_shards".to_string(),
        total_shards.to_string(),
    ];
    let last_line = trainer.run_last_line(args, job_id).await?;
    serde_json::from_str(&last_line)
        .map_err(|e| CoordError::Process(format!("malformed trainer result line: {e}")))
}
