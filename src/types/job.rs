use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::states::JobState;

/// Arguments a job is run with. Only plain values and references to things
/// stored elsewhere belong here: the payload is written to disk verbatim.
pub type Payload = serde_json::Value;

pub const DEFAULT_QUEUE: &str = "default";

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue_name: String,
    pub job_type: String,
    pub payload: Payload,
    pub state: JobState,
    /// not eligible before this instant
    pub run_at: DateTime<Utc>,
    /// execution attempts so far, bumped on every claim
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Key of the per-queue ready index: oldest `run_at` first, then
    /// creation order.
    pub(crate) fn ready_key(&self) -> (DateTime<Utc>, DateTime<Utc>, JobId) {
        (self.run_at, self.created_at, self.id)
    }
}

/// How an execution attempt ended, as reported back to the store.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Outcome {
    Success,
    /// Try again after backoff if attempts remain.
    RetryableFailure(String),
    /// Give up now.
    FatalFailure(String),
}

/// Options accepted when submitting a job.
#[derive(Clone, Debug, Default)]
pub struct EnqueueOptions {
    /// Delay relative to submission.
    pub wait: Option<Duration>,
    /// Absolute time to run at; wins over `wait`.
    pub wait_until: Option<DateTime<Utc>>,
    /// Falls back to the store default when unset.
    pub max_attempts: Option<u32>,
}

impl EnqueueOptions {
    pub fn wait(mut self, wait: Duration) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn wait_until(mut self, at: DateTime<Utc>) -> Self {
        self.wait_until = Some(at);
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Resolves the time a job submitted at `now` becomes runnable.
    pub fn run_at(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match (self.wait_until, self.wait) {
            (Some(at), _) => at,
            (None, Some(wait)) => chrono::Duration::from_std(wait)
                .ok()
                .and_then(|wait| now.checked_add_signed(wait))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            (None, None) => now,
        }
    }
}
