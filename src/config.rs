//! Runtime configuration, loaded from a YAML file.
//!
//! ```yaml
//! concurrency: 5
//! queues: [critical, default, low]   # highest priority first
//! poll_interval: 5                   # seconds; fractions allowed
//! job_timeout: 300
//! retention: 86400
//! prune_interval: 60
//! max_attempts: 25
//! backoff:
//!   base: 1
//!   max: 3600
//! ```
use std::path::Path;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use crate::parser::is_valid_name;
use crate::retry::Backoff;
use crate::types::job::DEFAULT_QUEUE;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Number of jobs allowed to run at once.
    pub concurrency: usize,
    /// Queues to work, in priority order.
    pub queues: Vec<String>,
    /// How long the dispatcher sleeps when nothing is eligible.
    #[serde(with = "secs")]
    pub poll_interval: Duration,
    /// A job running longer than this is abandoned and retried.
    #[serde(with = "secs")]
    pub job_timeout: Duration,
    /// How long finished jobs stay visible before being pruned.
    #[serde(with = "secs")]
    pub retention: Duration,
    #[serde(with = "secs")]
    pub prune_interval: Duration,
    /// Used for jobs submitted without their own limit.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 5,
            queues: vec![DEFAULT_QUEUE.to_owned()],
            poll_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(300),
            retention: Duration::from_secs(24 * 60 * 60),
            prune_interval: Duration::from_secs(60),
            max_attempts: 25,
            backoff: Backoff::default(),
        }
    }
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config =
            serde_yaml::from_str(yaml).context("parsing configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml(&yaml)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.concurrency > 0, "concurrency must be at least 1");
        ensure!(!self.queues.is_empty(), "at least one queue is required");
        for queue in &self.queues {
            ensure!(
                is_valid_name(queue.as_bytes()),
                "invalid queue name {queue:?}"
            );
        }
        ensure!(self.max_attempts > 0, "max_attempts must be at least 1");
        ensure!(
            !self.poll_interval.is_zero(),
            "poll_interval must be positive"
        );
        ensure!(!self.job_timeout.is_zero(), "job_timeout must be positive");
        Ok(())
    }
}

/// (De)serialises a `Duration` as a number of seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Duration,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(de::Error::custom)
    }
}
