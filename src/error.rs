use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordError {
    #[error("not the leader, current leader is {0:?}")]
    NotLeader(Option<String>),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("apply timed out after {0:?}")]
    ApplyTimeout(Duration),

    #[error("replication error: {0}")]
    Replication(String),

    /// A committed command the state machine rejects, identically on
    /// every replica (unknown variant, missing job, zero cluster size).
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("child process failed: {0}")]
    Process(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CoordError>;
