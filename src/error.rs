use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::types::job::JobId;
use crate::types::states::JobState;

/// Errors returned by the store and the handler registry.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The write-ahead log could not be read or written.
    #[error("storage unavailable: {0}")]
    Storage(#[from] io::Error),
    #[error("failed to encode log entry: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("corrupt write-ahead log at line {line}: {source}")]
    CorruptLog {
        line: usize,
        source: serde_json::Error,
    },
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("job {id} is {state}, not running")]
    NotRunning { id: JobId, state: JobState },
    #[error("job {id} is {state} and can't be killed")]
    NotKillable { id: JobId, state: JobState },
    #[error("invalid name {0:?}")]
    InvalidName(String),
    #[error("a handler for {0:?} is already registered")]
    DuplicateHandler(String),
}

/// The error a job handler signals. Whether a failure is worth retrying is
/// the handler's call, never inferred from the message.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum JobError {
    /// Network blips, lock contention, anything likely to pass.
    #[error("transient: {0}")]
    Transient(String),
    /// Bad input or a bug; retrying won't help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl JobError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }
}

/// Everything that can go wrong while executing one job.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ExecError {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("no handler registered for job type {0:?}")]
    UnknownJobType(String),
    #[error("handler panicked")]
    Panicked,
}
