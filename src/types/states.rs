use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a job is in its lifecycle.
///
/// Legal moves are `Pending`/`Scheduled` → `Running` → one of `Succeeded`,
/// `Pending` (retry without delay), `Scheduled` (retry after backoff) or
/// `Dead`. Waiting jobs may also be killed straight to `Dead`, and jobs found
/// `Running` after a restart go back to `Pending`.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Scheduled,
    Running,
    Succeeded,
    /// Accepted by status filters, but the store never moves a job here.
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Pending,
        JobState::Scheduled,
        JobState::Running,
        JobState::Succeeded,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(&self) -> &'static str {
        use JobState::*;

        match self {
            Pending => "pending",
            Scheduled => "scheduled",
            Running => "running",
            Succeeded => "succeeded",
            Failed => "failed",
            Dead => "dead",
        }
    }

    /// Parses the lowercase name used on the wire and in the log.
    pub fn from_name(name: &[u8]) -> Option<JobState> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_str().as_bytes() == name)
    }

    /// Waiting states are the only ones a job can be claimed from.
    pub fn is_waiting(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Scheduled)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Dead)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
