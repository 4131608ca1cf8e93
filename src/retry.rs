//! Turns execution errors into retry decisions.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExecError, JobError};
use crate::types::job::Outcome;

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at `max`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(with = "crate::config::secs")]
    pub base: Duration,
    #[serde(with = "crate::config::secs")]
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(3600),
        }
    }
}

impl Backoff {
    /// Delay before the retry following the given (1-based) attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63);
        let factor = 1u64 << exp;

        u32::try_from(factor)
            .ok()
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(self.max)
            .min(self.max)
    }
}

/// Maps an execution failure onto what the store should do with the job.
pub fn classify(error: &ExecError) -> Outcome {
    let msg = error.to_string();

    match error {
        ExecError::Job(JobError::Transient(_)) | ExecError::Timeout(_) => {
            Outcome::RetryableFailure(msg)
        },
        ExecError::Job(JobError::Permanent(_))
        | ExecError::UnknownJobType(_)
        | ExecError::Panicked => Outcome::FatalFailure(msg),
    }
}
