//! A fixed number of slots in which claimed jobs run.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::error::{ExecError, JobError};
use crate::registry::Registry;
use crate::retry::classify;
use crate::store::JobStore;
use crate::types::job::{JobRecord, Outcome};

/// One free execution slot. Dropping it hands the slot back to the pool.
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

pub struct WorkerPool {
    store: Arc<JobStore>,
    registry: Arc<Registry>,
    slots: Arc<Semaphore>,
    concurrency: usize,
    job_timeout: Duration,
}

impl WorkerPool {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<Registry>,
        concurrency: usize,
        job_timeout: Duration,
    ) -> Self {
        let concurrency = concurrency.max(1);

        Self {
            store,
            registry,
            slots: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            job_timeout,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a slot to free up. Returns None once the pool is closed.
    pub async fn reserve(&self) -> Option<Slot> {
        let permit = self.slots.clone().acquire_owned().await.ok()?;
        Some(Slot { _permit: permit })
    }

    /// Runs a claimed job in `slot` without waiting for it. The job's outcome
    /// is written back to the store exactly once, then the slot is released.
    pub fn spawn(&self, job: JobRecord, slot: Slot) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let registry = Arc::clone(&self.registry);
        let job_timeout = self.job_timeout;
        let span = info_span!(
            "job",
            id = %job.id,
            job_type = %job.job_type,
            queue = %job.queue_name,
            attempt = job.attempts,
        );

        tokio::spawn(
            async move {
                let _slot = slot;
                let id = job.id;

                let result = execute(&registry, &job, job_timeout).await;
                let outcome = match result {
                    Ok(()) => Outcome::Success,
                    Err(error) => {
                        warn!(%error, "job failed");
                        classify(&error)
                    },
                };

                // If this fails the job stays Running in the log and is
                // picked up again by crash recovery.
                match store.complete(id, outcome).await {
                    Ok(state) => info!(%state, "job finished"),
                    Err(error) => {
                        error!(%error, "failed to record job outcome")
                    },
                }
            }
            .instrument(span),
        )
    }

    /// Waits until every running job has finished.
    pub async fn drain(&self) {
        let n = u32::try_from(self.concurrency).unwrap_or(u32::MAX);
        if let Ok(all) = self.slots.acquire_many(n).await {
            drop(all);
        }
    }
}

/// Runs one job's handler with a time limit. The handler gets its own task,
/// so a handler that never yields still can't hold on to its slot: on timeout
/// the task is aborted and left behind.
pub async fn execute(
    registry: &Registry,
    job: &JobRecord,
    job_timeout: Duration,
) -> Result<(), ExecError> {
    let handler = registry.get(&job.job_type)?;
    let payload = job.payload.clone();

    let mut task =
        tokio::spawn(async move { handler.perform(&payload).await });

    match tokio::time::timeout(job_timeout, &mut task).await {
        Ok(Ok(result)) => result.map_err(ExecError::from),
        Ok(Err(join_error)) if join_error.is_panic() => {
            Err(ExecError::Panicked)
        },
        Ok(Err(_)) => Err(JobError::transient("handler task cancelled").into()),
        Err(_) => {
            task.abort();
            Err(ExecError::Timeout(job_timeout))
        },
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::clock::SystemClock;
    use crate::retry::Backoff;
    use crate::store::StoreOptions;
    use crate::types::job::Payload;
    use crate::types::states::JobState;

    fn store() -> Arc<JobStore> {
        let options = StoreOptions {
            max_attempts: 3,
            backoff: Backoff {
                base: Duration::from_secs(30),
                max: Duration::from_secs(30),
            },
        };
        Arc::new(JobStore::in_memory(options, Arc::new(SystemClock)))
    }

    fn registry() -> Arc<Registry> {
        let mut registry = Registry::new();
        registry
            .register("ok", |_: Payload| async { Ok::<_, JobError>(()) })
            .unwrap();
        registry
            .register("flaky", |_: Payload| async {
                Err::<(), _>(JobError::transient("upstream 503"))
            })
            .unwrap();
        registry
            .register("broken", |_: Payload| async {
                Err::<(), _>(JobError::permanent("no such user"))
            })
            .unwrap();
        registry
            .register("panics", |_: Payload| async {
                if true {
                    panic!("boom");
                }
                Ok::<_, JobError>(())
            })
            .unwrap();
        registry
            .register("stubborn", |_: Payload| async {
                // Blocks its thread outright; never yields to the runtime.
                std::thread::sleep(Duration::from_millis(500));
                Ok::<_, JobError>(())
            })
            .unwrap();
        Arc::new(registry)
    }

    async fn run(
        pool: &WorkerPool,
        store: &JobStore,
        job_type: &str,
    ) -> JobRecord {
        let id = store
            .enqueue("default", job_type, json!([]), Utc::now(), 3)
            .await
            .unwrap();
        let job = store.claim_next(&["default"]).await.unwrap().unwrap();
        assert_eq!(job.id, id);

        let slot = pool.reserve().await.unwrap();
        pool.spawn(job, slot).await.unwrap();

        store.status(id).await.unwrap()
    }

    #[tokio::test]
    async fn outcomes_reach_the_store() {
        let store = store();
        let pool = WorkerPool::new(
            store.clone(),
            registry(),
            2,
            Duration::from_secs(5),
        );

        assert_eq!(run(&pool, &store, "ok").await.state, JobState::Succeeded);

        let job = run(&pool, &store, "flaky").await;
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.last_error.as_deref(), Some("transient: upstream 503"));

        let job = run(&pool, &store, "broken").await;
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(job.attempts, 1);

        assert_eq!(run(&pool, &store, "panics").await.state, JobState::Dead);

        let job = run(&pool, &store, "unregistered").await;
        assert_eq!(job.state, JobState::Dead);
        assert_eq!(
            job.last_error.as_deref(),
            Some("no handler registered for job type \"unregistered\"")
        );

        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timeouts_free_the_slot_of_uncooperative_handlers() {
        let store = store();
        let pool = WorkerPool::new(
            store.clone(),
            registry(),
            1,
            Duration::from_millis(50),
        );

        let started = std::time::Instant::now();
        let job = run(&pool, &store, "stubborn").await;

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.last_error.as_deref(), Some("timed out after 50ms"));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn drain_waits_for_running_jobs() {
        let store = store();
        let mut registry = Registry::new();
        registry
            .register("slow", |_: Payload| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<_, JobError>(())
            })
            .unwrap();
        let pool = WorkerPool::new(
            store.clone(),
            Arc::new(registry),
            2,
            Duration::from_secs(5),
        );

        for _ in 0..2 {
            store
                .enqueue("default", "slow", json!([]), Utc::now(), 1)
                .await
                .unwrap();
            let job = store.claim_next(&["default"]).await.unwrap().unwrap();
            let slot = pool.reserve().await.unwrap();
            let _ = pool.spawn(job, slot);
        }
        assert_eq!(pool.available(), 0);

        pool.drain().await;
        assert_eq!(store.stats().await.by_state[&JobState::Succeeded], 2);
    }
}
