//! The control loop that moves eligible jobs from the store into free worker
//! slots.
use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::registry::Registry;
use crate::store::JobStore;
use crate::worker::WorkerPool;

pub struct Dispatcher {
    store: Arc<JobStore>,
    pool: WorkerPool,
    /// Highest priority first.
    queues: Vec<String>,
    poll_interval: Duration,
    retention: Duration,
    prune_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<JobStore>,
        registry: Arc<Registry>,
        config: &Config,
    ) -> Self {
        let pool = WorkerPool::new(
            Arc::clone(&store),
            registry,
            config.concurrency,
            config.job_timeout,
        );

        Self {
            store,
            pool,
            queues: config.queues.clone(),
            poll_interval: config.poll_interval,
            retention: config.retention,
            prune_interval: config.prune_interval,
        }
    }

    /// Runs until `cancel` fires, then waits for in-flight jobs to finish.
    ///
    /// Each pass takes a free slot, then asks the store for the next eligible
    /// job across the queues in priority order. Nothing eligible, or a store
    /// error, means a nap of one poll interval; a claimed job is handed to the
    /// pool and the loop carries straight on.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            queues = ?self.queues,
            concurrency = self.pool.concurrency(),
            poll_interval = ?self.poll_interval,
            "dispatcher started"
        );

        let mut next_prune = Instant::now() + self.prune_interval;

        loop {
            let slot = select! {
                slot = self.pool.reserve() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
                _ = cancel.cancelled() => break,
            };

            if Instant::now() >= next_prune {
                next_prune = Instant::now() + self.prune_interval;
                if let Err(error) = self.store.prune(self.retention).await {
                    error!(%error, "failed to prune finished jobs");
                }
            }

            match self.store.claim_next(&self.queues).await {
                Ok(Some(job)) => {
                    debug!(id = %job.id, "dispatching job");
                    let _ = self.pool.spawn(job, slot);
                    continue;
                },
                Ok(None) => {},
                Err(error) => error!(%error, "failed to claim next job"),
            }

            drop(slot);
            select! {
                _ = sleep(self.poll_interval) => {},
                _ = cancel.cancelled() => break,
            }
        }

        info!("dispatcher stopping, waiting for running jobs");
        self.pool.drain().await;
        info!("dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use serde_json::json;

    use super::*;
    use crate::clock::SystemClock;
    use crate::error::JobError;
    use crate::retry::Backoff;
    use crate::types::job::{EnqueueOptions, JobId, Payload};
    use crate::types::states::JobState;

    fn config(concurrency: usize) -> Config {
        Config {
            concurrency,
            poll_interval: Duration::from_millis(100),
            backoff: Backoff {
                base: Duration::ZERO,
                max: Duration::ZERO,
            },
            ..Config::default()
        }
    }

    fn memory_store(config: &Config) -> Arc<JobStore> {
        Arc::new(JobStore::in_memory(config.into(), Arc::new(SystemClock)))
    }

    async fn wait_for(store: &JobStore, ids: &[JobId], state: JobState) {
        loop {
            let mut done = true;
            for id in ids {
                done &= store.status(*id).await.unwrap().state == state;
            }
            if done {
                return;
            }
            sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_is_bounded() {
        let config = config(3);
        let store = memory_store(&config);

        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let (running, peak) = (running.clone(), peak.clone());
            registry
                .register("work", move |_: Payload| {
                    let (running, peak) = (running.clone(), peak.clone());
                    async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        sleep(Duration::from_secs(3)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok::<_, JobError>(())
                    }
                })
                .unwrap();
        }

        let mut ids = vec![];
        for n in 0..10 {
            ids.push(
                store
                    .submit(
                        "default",
                        "work",
                        json!([n]),
                        EnqueueOptions::default(),
                    )
                    .await
                    .unwrap(),
            );
        }

        let cancel = CancellationToken::new();
        let started = Instant::now();
        let dispatcher = tokio::spawn(
            Dispatcher::new(store.clone(), Arc::new(registry), &config)
                .run(cancel.clone()),
        );

        wait_for(&store, &ids, JobState::Succeeded).await;
        let elapsed = started.elapsed();

        // four batches of three seconds, not ten
        assert!(elapsed >= Duration::from_secs(12), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(13), "{elapsed:?}");
        assert_eq!(peak.load(Ordering::SeqCst), 3);

        cancel.cancel();
        dispatcher.await.unwrap();
    }

    #[tokio::test]
    async fn transient_failures_run_exactly_max_attempts_times() {
        let config = config(2);
        let store = memory_store(&config);

        let calls = Arc::new(AtomicUsize::new(0));
        let mut registry = Registry::new();
        {
            let calls = calls.clone();
            registry
                .register("flaky", move |_: Payload| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(JobError::transient("try again")) }
                })
                .unwrap();
            registry
                .register("invalid", |_: Payload| async {
                    Err::<(), _>(JobError::permanent("bad payload"))
                })
                .unwrap();
        }

        let flaky = store
            .submit(
                "default",
                "flaky",
                json!([]),
                EnqueueOptions::default().max_attempts(4),
            )
            .await
            .unwrap();
        let invalid = store
            .submit("default", "invalid", json!([]), EnqueueOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Dispatcher::new(store.clone(), Arc::new(registry), &config)
                .run(cancel.clone()),
        );

        wait_for(&store, &[flaky, invalid], JobState::Dead).await;
        // give a runaway retry a chance to show up
        sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        dispatcher.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(store.status(flaky).await.unwrap().attempts, 4);
        assert_eq!(store.status(invalid).await.unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn higher_priority_queues_go_first() {
        let config = Config {
            queues: vec!["critical".into(), "default".into()],
            ..config(1)
        };
        let store = memory_store(&config);

        let order = Arc::new(std::sync::Mutex::new(vec![]));
        let mut registry = Registry::new();
        {
            let order = order.clone();
            registry
                .register("record", move |payload: Payload| {
                    order.lock().unwrap().push(payload[0].as_u64().unwrap());
                    async { Ok::<_, JobError>(()) }
                })
                .unwrap();
        }

        let mut ids = vec![];
        let queues = ["default", "default", "critical", "default", "critical"];
        for (n, queue) in queues.into_iter().enumerate() {
            ids.push(
                store
                    .submit(
                        queue,
                        "record",
                        json!([n]),
                        EnqueueOptions::default(),
                    )
                    .await
                    .unwrap(),
            );
        }

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Dispatcher::new(store.clone(), Arc::new(registry), &config)
                .run(cancel.clone()),
        );
        wait_for(&store, &ids, JobState::Succeeded).await;
        cancel.cancel();
        dispatcher.await.unwrap();

        assert_eq!(*order.lock().unwrap(), [2, 4, 0, 1, 3]);
    }

    #[tokio::test]
    async fn crashed_jobs_are_run_again_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(1);

        let id = {
            let store = JobStore::open(
                dir.path(),
                (&config).into(),
                Arc::new(SystemClock),
            )
            .await
            .unwrap();
            let id = store
                .submit("default", "work", json!([]), EnqueueOptions::default())
                .await
                .unwrap();
            store.claim_next(&config.queues).await.unwrap().unwrap();
            id
        };

        let store = Arc::new(
            JobStore::open(
                dir.path(),
                (&config).into(),
                Arc::new(SystemClock),
            )
            .await
            .unwrap(),
        );
        assert_eq!(store.status(id).await.unwrap().state, JobState::Pending);

        let mut registry = Registry::new();
        registry
            .register("work", |_: Payload| async { Ok::<_, JobError>(()) })
            .unwrap();

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Dispatcher::new(store.clone(), Arc::new(registry), &config)
                .run(cancel.clone()),
        );
        wait_for(&store, &[id], JobState::Succeeded).await;
        cancel.cancel();
        dispatcher.await.unwrap();

        assert_eq!(store.status(id).await.unwrap().attempts, 2);
    }

    #[tokio::test]
    async fn delayed_job_runs_once_due() {
        let config = config(1);
        let store = memory_store(&config);

        let mut registry = Registry::new();
        registry
            .register("welcome_email", |_: Payload| async {
                Ok::<_, JobError>(())
            })
            .unwrap();

        let id = store
            .submit(
                "default",
                "welcome_email",
                json!({"user_id": 1}),
                EnqueueOptions::default().wait_until(
                    Utc::now() + chrono::Duration::milliseconds(300),
                ),
            )
            .await
            .unwrap();
        assert_eq!(store.status(id).await.unwrap().state, JobState::Scheduled);

        let cancel = CancellationToken::new();
        let dispatcher = tokio::spawn(
            Dispatcher::new(store.clone(), Arc::new(registry), &config)
                .run(cancel.clone()),
        );

        sleep(Duration::from_millis(100)).await;
        assert_eq!(store.status(id).await.unwrap().state, JobState::Scheduled);

        wait_for(&store, &[id], JobState::Succeeded).await;
        cancel.cancel();
        dispatcher.await.unwrap();
    }
}
