//! Deterministic state machine applied on every replica.
//!
//! `apply` is the only writer of the job store on the replication path.
//! For the same committed log prefix every replica must hold a
//! byte-identical store; anything non-deterministic (clocks, randomness,
//! local node identity) is forbidden here.

use std::io::Read;
use std::sync::Arc;

use thiserror::Error;

use crate::consensus::command::{self, DecodeError, LogEvent};
use crate::consensus::storage::SnapshotSink;
use crate::error::CoordError;
use crate::store::{Job, JobStore};

#[derive(Debug, Error)]
pub enum FsmError {
    /// The entry cannot be decoded at all. Replicas must halt on this
    /// rather than diverge; the applier turns it into a process exit.
    #[error("corrupt log entry: {0}")]
    Corrupt(serde_json::Error),

    /// The entry is committed but semantically invalid. Every replica
    /// rejects it identically and stays live; outside the FSM this
    /// surfaces as [`CoordError::InvalidCommand`].
    #[error("rejected command: {0}")]
    Rejected(String),
}

impl From<FsmError> for CoordError {
    fn from(err: FsmError) -> Self {
        match err {
            FsmError::Corrupt(e) => CoordError::Codec(e),
            FsmError::Rejected(reason) => CoordError::InvalidCommand(reason),
        }
    }
}

pub struct Fsm {
    store: Arc<JobStore>,
}

impl Fsm {
    pub fn new(store: Arc<JobStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Apply one committed log entry.
    pub fn apply(&self, data: &[u8]) -> Result<(), FsmError> {
        let event = match command::decode(data) {
            Ok(event) => event,
            Err(DecodeError::Malformed(e)) => return Err(FsmError::Corrupt(e)),
            Err(DecodeError::UnknownCommand(kind)) => {
                return Err(FsmError::Rejected(format!("unknown command type: {kind}")))
            }
        };

        match event {
            LogEvent::SetJob { job_id, job } => {
                let Some(job) = job else {
                    return Err(FsmError::Rejected(format!(
                        "set job {job_id}: missing job data"
                    )));
                };
                self.store.put(&job_id, job);
                Ok(())
            }
            LogEvent::SubmitParent {
                job_id,
                job,
                cluster_size,
            } => {
                let Some(parent) = job else {
                    return Err(FsmError::Rejected(format!(
                        "submit parent {job_id}: missing job data"
                    )));
                };
                if cluster_size == 0 {
                    return Err(FsmError::Rejected(format!(
                        "submit parent {job_id}: cluster size must be positive"
                    )));
                }
                for index in 1..=cluster_size {
                    let worker_id = command::worker_for_index(index);
                    let shard_id = command::shard_id(&job_id, &worker_id);
                    let shard = Job::shard(shard_id.clone(), parent.job_type.clone(), worker_id);
                    self.store.put(&shard_id, shard);
                }
                Ok(())
            }
        }
    }

    /// Point-in-time snapshot of the store.
    pub fn snapshot(&self) -> serde_json::Result<FsmSnapshot> {
        Ok(FsmSnapshot {
            data: self.store.snapshot_bytes()?,
        })
    }

    /// Replace the store from a snapshot stream.
    pub fn restore<R: Read>(&self, mut reader: R) -> crate::error::Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data)?;
        self.store.restore(&data)?;
        Ok(())
    }
}

/// Owned snapshot bytes, decoupled from later store mutations.
pub struct FsmSnapshot {
    data: Vec<u8>,
}

impl FsmSnapshot {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Write the snapshot to a sink and commit it. On any write error the
    /// sink is cancelled and the error surfaced.
    pub fn persist<S: SnapshotSink>(&self, mut sink: S) -> std::io::Result<()> {
        if let Err(e) = std::io::Write::write_all(&mut sink, &self.data) {
            let _ = sink.cancel();
            return Err(e);
        }
        sink.commit()
    }
}
