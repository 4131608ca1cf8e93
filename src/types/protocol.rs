use chrono::{DateTime, Utc};
use serde::Serialize;

use super::job::{JobId, JobRecord, Payload};
use super::serialisable::WireSerialisable;
use super::states::JobState;
use crate::store::StoreStats;

/// A command sent by a client to the server.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Command {
    /// Submits a job to `queue`, runnable after `delay` seconds. The command
    /// line is followed by a JSON payload of `n_bytes` bytes and a CRLF.
    /// A `max_attempts` of 0 means the server default.
    ///
    /// On the wire:
    /// `enqueue <queue> <job-type> <delay> <max-attempts> <n_bytes>`
    Enqueue {
        queue: String,
        job_type: String,
        delay: u32,
        max_attempts: u32,
        n_bytes: u32,
    },
    /// As `enqueue`, but runnable from an absolute UNIX timestamp (seconds).
    ///
    /// On the wire:
    /// `enqueue-at <queue> <job-type> <unix-secs> <max-attempts> <n_bytes>`
    EnqueueAt {
        queue: String,
        job_type: String,
        at: u64,
        max_attempts: u32,
        n_bytes: u32,
    },
    /// Returns a job's current record as YAML, or `NOT_FOUND`.
    ///
    /// On the wire: `status <id>`
    Status { id: u64 },
    /// Returns up to `limit` jobs with ids greater than `after`, optionally
    /// filtered by queue and state (`*` matches anything). The reply carries
    /// a `next` cursor to pass as `after` for the following page.
    ///
    /// On the wire: `list <queue|*> <state|*> <after> <limit>`
    List {
        queue: Option<String>,
        state: Option<JobState>,
        after: u64,
        limit: u32,
    },
    /// Marks a pending or scheduled job dead so it never runs. Returns
    /// `KILLED`, `NOT_FOUND` or `NOT_KILLABLE`.
    ///
    /// On the wire: `kill <id>`
    Kill { id: u64 },
    /// Job counts by state and by queue.
    ///
    /// On the wire: `stats`
    Stats,
    /// Requests that the server close this connection.
    ///
    /// On the wire: `quit`
    Quit,
}

impl Command {
    /// Size of the body following the command line, if any.
    pub fn body_len(&self) -> Option<u32> {
        match self {
            Command::Enqueue { n_bytes, .. } => Some(*n_bytes),
            Command::EnqueueAt { n_bytes, .. } => Some(*n_bytes),
            _ => None,
        }
    }
}

/// All possible replies to a `Command`.
#[derive(Debug)]
pub enum Response {
    /// The store failed. Can be sent in response to any command.
    ///
    /// On the wire: `INTERNAL_ERROR`.
    InternalError,
    /// The client sent a malformed line, a bad name or number, or a job body
    /// that isn't JSON.
    ///
    /// On the wire: `BAD_FORMAT`.
    BadFormat,
    /// On the wire: `UNKNOWN_COMMAND`.
    UnknownCommand,
    /// In response to an `enqueue`, the id of the new job.
    ///
    /// On the wire: `INSERTED <id>`.
    Inserted { id: JobId },
    /// The job body was not exactly `n_bytes` long.
    ///
    /// On the wire: `EXPECTED_CRLF`.
    ExpectedCRLF,
    /// The job body exceeds the configured maximum.
    ///
    /// On the wire: `JOB_TOO_BIG`.
    JobTooBig,
    /// On the wire: `NOT_FOUND`.
    NotFound,
    /// In response to a `kill`, the job is already running or finished.
    ///
    /// On the wire: `NOT_KILLABLE`.
    NotKillable,
    /// On the wire: `KILLED`.
    Killed,
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary.
    OkStatus { data: JobStatus },
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary holding a list.
    OkList { data: JobList },
    /// On the wire: `OK <n_bytes>` plus a YAML dictionary.
    OkStats { data: StoreStats },
}

fn ok_yaml<T: Serialize>(data: &T) -> Vec<u8> {
    match serde_yaml::to_string(data) {
        Ok(data) => format!("OK {}\r\n{data}\r\n", data.len()).into(),
        Err(error) => {
            tracing::error!(%error, "failed to render reply");
            b"INTERNAL_ERROR\r\n".to_vec()
        },
    }
}

impl WireSerialisable for Response {
    fn serialise_wire(&self) -> Vec<u8> {
        use Response::*;

        match self {
            InternalError => b"INTERNAL_ERROR\r\n".to_vec(),
            BadFormat => b"BAD_FORMAT\r\n".to_vec(),
            UnknownCommand => b"UNKNOWN_COMMAND\r\n".to_vec(),
            Inserted { id } => format!("INSERTED {id}\r\n").into(),
            ExpectedCRLF => b"EXPECTED_CRLF\r\n".to_vec(),
            JobTooBig => b"JOB_TOO_BIG\r\n".to_vec(),
            NotFound => b"NOT_FOUND\r\n".to_vec(),
            NotKillable => b"NOT_KILLABLE\r\n".to_vec(),
            Killed => b"KILLED\r\n".to_vec(),
            OkStatus { data } => ok_yaml(data),
            OkList { data } => ok_yaml(data),
            OkStats { data } => ok_yaml(data),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobStatus {
    /// job ID
    pub id: JobId,
    /// queue the job was submitted to
    pub queue: String,
    /// handler name
    #[serde(rename = "job-type")]
    pub job_type: String,
    pub state: JobState,
    /// earliest time the job may run
    #[serde(rename = "run-at")]
    pub run_at: DateTime<Utc>,
    /// number of times the job was claimed
    pub attempts: u32,
    #[serde(rename = "max-attempts")]
    pub max_attempts: u32,
    /// most recent failure, if any
    #[serde(rename = "last-error")]
    pub last_error: Option<String>,
    #[serde(rename = "created-at")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updated-at")]
    pub updated_at: DateTime<Utc>,
    pub payload: Payload,
}

impl From<JobRecord> for JobStatus {
    fn from(job: JobRecord) -> Self {
        Self {
            id: job.id,
            queue: job.queue_name,
            job_type: job.job_type,
            state: job.state,
            run_at: job.run_at,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
            payload: job.payload,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobList {
    pub jobs: Vec<JobStatus>,
    /// cursor for the next page, absent on the last one
    pub next: Option<JobId>,
}
