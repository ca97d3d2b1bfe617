//! Wire codec for replicated log commands.
//!
//! Commands are JSON objects with a `"type"` tag. Decoders accept the
//! legacy `"data"` alias for the `"job"` field; encoders always emit
//! `"job"`. Field order is fixed by the envelope struct, so encoding is
//! deterministic across replicas.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::Job;

const SET_JOB: &str = "SET_JOB";
const SUBMIT_PARENT_JOB: &str = "SUBMIT_PARENT_JOB";

/// A replicated mutation of the job registry.
///
/// `job` is optional at the codec layer: a missing job is a semantic
/// error the FSM rejects, not a decode failure.
#[derive(Debug, Clone, PartialEq)]
pub enum LogEvent {
    SetJob {
        job_id: String,
        job: Option<Job>,
    },
    SubmitParent {
        job_id: String,
        job: Option<Job>,
        cluster_size: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    job_id: String,
    #[serde(default, alias = "data", skip_serializing_if = "Option::is_none")]
    job: Option<Job>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    cluster_size: Option<u32>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    /// The entry is not a valid command envelope at all. Committed log
    /// entries are produced by this codec, so this indicates corruption
    /// or a software bug; the applier halts the replica on it.
    #[error("malformed log entry: {0}")]
    Malformed(#[from] serde_json::Error),

    /// A well-formed envelope with a command tag this version does not
    /// know. Rejected identically on every replica; the node stays live.
    #[error("unknown command type: {0}")]
    UnknownCommand(String),
}

pub fn encode(event: &LogEvent) -> serde_json::Result<Vec<u8>> {
    let envelope = match event {
        LogEvent::SetJob { job_id, job } => Envelope {
            kind: SET_JOB.to_string(),
            job_id: job_id.clone(),
            job: job.clone(),
            cluster_size: None,
        },
        LogEvent::SubmitParent {
            job_id,
            job,
            cluster_size,
        } => Envelope {
            kind: SUBMIT_PARENT_JOB.to_string(),
            job_id: job_id.clone(),
            job: job.clone(),
            cluster_size: Some(*cluster_size),
        },
    };
    serde_json::to_vec(&envelope)
}

pub fn decode(data: &[u8]) -> Result<LogEvent, DecodeError> {
    let envelope: Envelope = serde_json::from_slice(data)?;
    match envelope.kind.as_str() {
        SET_JOB => Ok(LogEvent::SetJob {
            job_id: envelope.job_id,
            job: envelope.job,
        }),
        SUBMIT_PARENT_JOB => Ok(LogEvent::SubmitParent {
            job_id: envelope.job_id,
            job: envelope.job,
            cluster_size: envelope.cluster_size.unwrap_or(0),
        }),
        other => Err(DecodeError::UnknownCommand(other.to_string())),
    }
}

/// Worker id for a 1-based node index: `"node-<i>"`.
pub fn worker_for_index(index: u32) -> String {
    format!("node-{index}")
}

/// Numeric index of a worker id, `"node-3"` -> `3`. Only canonical ids
/// parse; `"node-03"` does not.
pub fn parse_node_index(worker_id: &str) -> Option<u32> {
    let digits = worker_id.strip_prefix("node-")?;
    let index: u32 = digits.parse().ok()?;
    if index == 0 || worker_for_index(index) != worker_id {
        return None;
    }
    Some(index)
}

/// Shard id for a parent and the worker that owns the shard.
pub fn shard_id(parent_id: &str, worker_id: &str) -> String {
    format!("{parent_id}-{worker_id}")
}

/// Split a shard id into its parent id and worker index. The suffix must
/// be a canonical `-node-<i>`; anything else is not a shard id.
pub fn parse_shard_id(id: &str) -> Option<(&str, u32)> {
    let marker = id.rfind("-node-")?;
    let parent = &id[..marker];
    if parent.is_empty() {
        return None;
    }
    let index = parse_node_index(&id[marker + 1..])?;
    Some((parent, index))
}
