//! The job store: the single source of truth for job records.
//!
//! All mutation goes through one async mutex, which is what makes claiming
//! atomic: a job moves to `Running` while the lock is held, so no two callers
//! can ever claim it together. With a log directory every change is appended
//! to the write-ahead log and synced before it becomes visible.
mod listing;
mod wal;

use std::borrow::Cow;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

pub use self::listing::{ListFilter, Listing, Page};
use self::wal::{Entry, Wal};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::QueueError;
use crate::parser::is_valid_name;
use crate::retry::Backoff;
use crate::types::job::{EnqueueOptions, JobId, JobRecord, Outcome, Payload};
use crate::types::states::JobState;

type ReadyKey = (DateTime<Utc>, DateTime<Utc>, JobId);

#[derive(Clone, Copy, Debug)]
pub struct StoreOptions {
    /// Applied to submissions that don't set their own.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Config::default().into()
    }
}

impl From<&Config> for StoreOptions {
    fn from(config: &Config) -> Self {
        Self {
            max_attempts: config.max_attempts,
            backoff: config.backoff,
        }
    }
}

impl From<Config> for StoreOptions {
    fn from(config: Config) -> Self {
        (&config).into()
    }
}

/// Job counts, as reported by `stats`.
#[derive(Debug, Default, Serialize)]
pub struct StoreStats {
    /// number of job records held
    pub jobs: u64,
    /// counts per state
    #[serde(rename = "by-state")]
    pub by_state: BTreeMap<JobState, u64>,
    /// counts per state, per queue
    #[serde(rename = "by-queue")]
    pub by_queue: BTreeMap<String, BTreeMap<JobState, u64>>,
    /// whether jobs survive a restart
    pub durable: bool,
}

pub struct JobStore {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
    options: StoreOptions,
}

struct Inner {
    jobs: BTreeMap<JobId, JobRecord>,
    /// Pending and scheduled jobs, per queue, in dispatch order.
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    next_id: u64,
    wal: Option<Wal>,
}

impl Inner {
    fn new(wal: Option<Wal>) -> Self {
        Self {
            jobs: BTreeMap::new(),
            ready: HashMap::new(),
            next_id: 1,
            wal,
        }
    }

    /// Logs then applies a new version of a job record.
    async fn put(&mut self, job: JobRecord) -> Result<(), QueueError> {
        if let Some(wal) = &mut self.wal {
            wal.append(&Entry::Put {
                job: Cow::Borrowed(&job),
            })
            .await?;
        }

        self.unindex(job.id);
        if job.state.is_waiting() {
            self.ready
                .entry(job.queue_name.clone())
                .or_default()
                .insert(job.ready_key());
        }
        self.jobs.insert(job.id, job);

        Ok(())
    }

    async fn remove(&mut self, id: JobId) -> Result<(), QueueError> {
        if let Some(wal) = &mut self.wal {
            wal.append(&Entry::Remove { id }).await?;
        }

        self.unindex(id);
        self.jobs.remove(&id);

        Ok(())
    }

    fn unindex(&mut self, id: JobId) {
        let Some(old) = self.jobs.get(&id) else {
            return;
        };

        if old.state.is_waiting() {
            if let Some(ready) = self.ready.get_mut(&old.queue_name) {
                ready.remove(&old.ready_key());
                if ready.is_empty() {
                    self.ready.remove(&old.queue_name);
                }
            }
        }
    }

    fn get(&self, id: JobId) -> Result<&JobRecord, QueueError> {
        self.jobs.get(&id).ok_or(QueueError::NotFound(id))
    }
}

impl JobStore {
    /// A store that forgets everything when dropped.
    pub fn in_memory(options: StoreOptions, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner::new(None)),
            clock,
            options,
        }
    }

    /// Opens (or creates) a durable store in `dir`.
    ///
    /// Jobs found `Running` were interrupted by a crash: they go back to
    /// `Pending` to be run again, or to `Dead` if that was their last allowed
    /// attempt. The log is compacted once recovery is done.
    #[instrument(skip_all, err, fields(dir = %dir.as_ref().display()))]
    pub async fn open(
        dir: impl AsRef<Path>,
        options: StoreOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let dir = dir.as_ref();
        let mut replayed = Wal::replay(dir).await?;
        let now = clock.now();

        let mut recovered = 0;
        for job in replayed.jobs.values_mut() {
            if job.state != JobState::Running {
                continue;
            }

            recovered += 1;
            job.updated_at = now;
            if job.attempts >= job.max_attempts {
                job.state = JobState::Dead;
                job.last_error =
                    Some("interrupted during final attempt".into());
            } else {
                job.state = JobState::Pending;
            }
            warn!(
                id = %job.id,
                state = %job.state,
                "recovered interrupted job"
            );
        }

        let wal = Wal::compact(dir, &replayed.jobs, replayed.next_id).await?;
        info!(
            path = %wal.path().display(),
            jobs = replayed.jobs.len(),
            recovered,
            "opened job store"
        );

        let mut inner = Inner::new(Some(wal));
        inner.next_id = replayed.next_id;
        for (id, job) in replayed.jobs {
            if job.state.is_waiting() {
                inner
                    .ready
                    .entry(job.queue_name.clone())
                    .or_default()
                    .insert(job.ready_key());
            }
            inner.jobs.insert(id, job);
        }

        Ok(Self {
            inner: Mutex::new(inner),
            clock,
            options,
        })
    }

    /// Records a new job, runnable from `run_at`. Fails only on bad names or
    /// when the log can't be written.
    #[instrument(skip(self, payload), err)]
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: Payload,
        run_at: DateTime<Utc>,
        max_attempts: u32,
    ) -> Result<JobId, QueueError> {
        for name in [queue_name, job_type] {
            if !is_valid_name(name.as_bytes()) {
                return Err(QueueError::InvalidName(name.to_owned()));
            }
        }

        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        // Reserved up front: an id is never handed out twice, even if the
        // write below fails after reaching the disk.
        let id = JobId(inner.next_id);
        inner.next_id += 1;

        let state = if run_at > now {
            JobState::Scheduled
        } else {
            JobState::Pending
        };

        inner
            .put(JobRecord {
                id,
                queue_name: queue_name.to_owned(),
                job_type: job_type.to_owned(),
                payload,
                state,
                run_at,
                attempts: 0,
                max_attempts: max_attempts.max(1),
                last_error: None,
                created_at: now,
                updated_at: now,
            })
            .await?;

        debug!(%id, %state, %run_at, "enqueued job");

        Ok(id)
    }

    /// Submits a job, now or later depending on `options`.
    pub async fn submit(
        &self,
        queue_name: &str,
        job_type: &str,
        payload: Payload,
        options: EnqueueOptions,
    ) -> Result<JobId, QueueError> {
        let run_at = options.run_at(self.clock.now());
        let max_attempts =
            options.max_attempts.unwrap_or(self.options.max_attempts);

        self.enqueue(queue_name, job_type, payload, run_at, max_attempts)
            .await
    }

    /// Claims the oldest eligible job from the first queue in `queue_names`
    /// that has one, marking it `Running` and counting the attempt.
    pub async fn claim_next<S: AsRef<str>>(
        &self,
        queue_names: &[S],
    ) -> Result<Option<JobRecord>, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        for queue in queue_names {
            let Some(&(run_at, _, id)) =
                inner.ready.get(queue.as_ref()).and_then(BTreeSet::first)
            else {
                continue;
            };

            if run_at > now {
                continue;
            }

            let mut job = inner.get(id)?.clone();
            job.state = JobState::Running;
            job.attempts += 1;
            job.updated_at = now;

            inner.put(job.clone()).await?;
            debug!(
                %id,
                queue = queue.as_ref(),
                attempt = job.attempts,
                "claimed job"
            );

            return Ok(Some(job));
        }

        Ok(None)
    }

    /// Records how a claimed job's attempt went, returning its new state.
    #[instrument(skip(self), err)]
    pub async fn complete(
        &self,
        id: JobId,
        outcome: Outcome,
    ) -> Result<JobState, QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let mut job = inner.get(id)?.clone();
        if job.state != JobState::Running {
            return Err(QueueError::NotRunning {
                id,
                state: job.state,
            });
        }

        match outcome {
            Outcome::Success => {
                job.state = JobState::Succeeded;
                job.last_error = None;
            },
            Outcome::RetryableFailure(error)
                if job.attempts < job.max_attempts =>
            {
                let delay = self.options.backoff.delay(job.attempts);
                job.run_at = later(now, delay);
                job.state = if delay.is_zero() {
                    JobState::Pending
                } else {
                    JobState::Scheduled
                };
                job.last_error = Some(error);
            },
            Outcome::RetryableFailure(error) | Outcome::FatalFailure(error) => {
                job.state = JobState::Dead;
                job.last_error = Some(error);
            },
        }
        job.updated_at = now;

        let state = job.state;
        inner.put(job).await?;
        debug!(%id, %state, "completed job");

        Ok(state)
    }

    /// Marks a job that hasn't started yet as dead.
    pub async fn kill(&self, id: JobId) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        let mut job = inner.get(id)?.clone();
        if !job.state.is_waiting() {
            return Err(QueueError::NotKillable {
                id,
                state: job.state,
            });
        }

        job.state = JobState::Dead;
        job.last_error = Some("killed".into());
        job.updated_at = now;
        inner.put(job).await?;
        info!(%id, "killed job");

        Ok(())
    }

    /// Drops succeeded and dead jobs last touched more than `retention` ago.
    pub async fn prune(
        &self,
        retention: Duration,
    ) -> Result<usize, QueueError> {
        let cutoff = earlier(self.clock.now(), retention);
        let mut inner = self.inner.lock().await;

        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|job| job.state.is_finished() && job.updated_at < cutoff)
            .map(|job| job.id)
            .collect();

        for id in &expired {
            inner.remove(*id).await?;
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "pruned finished jobs");
        }

        Ok(expired.len())
    }

    pub async fn status(&self, id: JobId) -> Result<JobRecord, QueueError> {
        self.inner.lock().await.get(id).cloned()
    }

    /// Returns up to `limit` jobs matching `filter` with ids after `after`.
    pub async fn list(
        &self,
        filter: &ListFilter,
        after: Option<JobId>,
        limit: usize,
    ) -> Page {
        let inner = self.inner.lock().await;
        listing::page(&inner.jobs, filter, after, limit)
    }

    /// A lazy listing that fetches `page_size` jobs at a time.
    pub fn listing(&self, filter: ListFilter, page_size: usize) -> Listing<'_> {
        Listing::new(self, filter, None, page_size)
    }

    /// Resumes a listing from a cursor saved off an earlier one.
    pub fn listing_from(
        &self,
        filter: ListFilter,
        cursor: JobId,
        page_size: usize,
    ) -> Listing<'_> {
        Listing::new(self, filter, Some(cursor), page_size)
    }

    pub async fn stats(&self) -> StoreStats {
        let inner = self.inner.lock().await;

        let mut stats = StoreStats {
            jobs: inner.jobs.len() as u64,
            durable: inner.wal.is_some(),
            ..Default::default()
        };

        for job in inner.jobs.values() {
            *stats.by_state.entry(job.state).or_default() += 1;
            *stats
                .by_queue
                .entry(job.queue_name.clone())
                .or_default()
                .entry(job.state)
                .or_default() += 1;
        }

        stats
    }
}

fn later(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn earlier(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_sub_signed(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
