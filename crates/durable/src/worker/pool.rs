//! Queue worker
//!
//! Consumes one named queue with bounded concurrency, per-job lock
//! heartbeats, stalled-job reclamation and graceful shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::poller::JobPoller;
use crate::events::{publish_best_effort, queue_channel, EventEnvelope, EventPublisher};
use crate::job::{Job, JobError};
use crate::persistence::{FailureOutcome, JobStore, StoreError, WorkerInfo};
use crate::queue::{JobHandler, QueueConfig};
use crate::reliability::RateLimiter;

const WORKER_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const MIN_LOCK_HEARTBEAT: Duration = Duration::from_millis(10);

/// Worker status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Worker has been created but not started
    Idle,
    /// Worker is running and accepting jobs
    Running,
    /// Worker is draining (completing current jobs, not claiming new ones)
    Draining,
    /// Worker has stopped
    Stopped,
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,

    /// Worker was stopped and cannot be restarted
    #[error("worker has been stopped")]
    Stopped,

    /// Shutdown timeout
    #[error("graceful shutdown timed out with {0} jobs in flight")]
    ShutdownTimeout(usize),
}

/// State shared between the worker and its spawned tasks
struct WorkerShared {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    worker_id: String,
    handler: JobHandler,
    publisher: Arc<dyn EventPublisher>,
}

/// Consumer for a single queue
///
/// # Example
///
/// ```ignore
/// use conveyor_durable::prelude::*;
///
/// let mut registry = HandlerRegistry::new();
/// registry.register("email:send", |job| async move { Ok(job.payload) });
///
/// let worker = QueueWorker::new(
///     store,
///     QueueConfig::new("email:send").with_concurrency(4),
///     "worker-1",
///     registry.get("email:send").unwrap(),
///     publisher,
/// );
/// worker.start().await?;
/// // ...
/// worker.shutdown().await?;
/// ```
pub struct QueueWorker {
    shared: Arc<WorkerShared>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: RwLock<WorkerStatus>,
    active_jobs: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueWorker {
    /// Create a new worker for `config.name`
    pub fn new(
        store: Arc<dyn JobStore>,
        config: QueueConfig,
        worker_id: impl Into<String>,
        handler: JobHandler,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = config.concurrency.max(1);

        Self {
            shared: Arc::new(WorkerShared {
                store,
                config,
                worker_id: worker_id.into(),
                handler,
                publisher,
            }),
            shutdown_tx,
            shutdown_rx,
            status: RwLock::new(WorkerStatus::Idle),
            active_jobs: Arc::new(Semaphore::new(concurrency)),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.worker_id
    }

    pub fn status(&self) -> WorkerStatus {
        *self.status.read()
    }

    /// Jobs currently executing
    pub fn current_load(&self) -> usize {
        self.concurrency() - self.active_jobs.available_permits()
    }

    fn concurrency(&self) -> usize {
        self.shared.config.concurrency.max(1)
    }

    /// Start polling, heartbeat and reclaim loops
    #[instrument(skip(self), fields(queue = %self.queue_name(), worker_id = %self.worker_id()))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        match self.status() {
            WorkerStatus::Running => return Err(WorkerError::AlreadyRunning),
            WorkerStatus::Draining | WorkerStatus::Stopped => return Err(WorkerError::Stopped),
            WorkerStatus::Idle => {}
        }

        info!(
            concurrency = self.concurrency(),
            rate_limited = self.shared.config.rate_limiter.is_some(),
            "Starting queue worker"
        );

        let now = Utc::now();
        self.shared
            .store
            .register_worker(WorkerInfo {
                id: self.shared.worker_id.clone(),
                queue_name: self.shared.config.name.clone(),
                concurrency: self.concurrency() as u32,
                current_load: 0,
                started_at: now,
                last_heartbeat_at: now,
            })
            .await?;

        *self.status.write() = WorkerStatus::Running;

        let mut handles = self.handles.lock();
        handles.push(self.spawn_poll_loop());
        handles.push(self.spawn_heartbeat_loop());
        handles.push(self.spawn_reclaim_loop());
        Ok(())
    }

    /// Stop claiming, wait for in-flight jobs, then deregister
    #[instrument(skip(self), fields(queue = %self.queue_name(), worker_id = %self.worker_id()))]
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        if matches!(self.status(), WorkerStatus::Idle | WorkerStatus::Stopped) {
            *self.status.write() = WorkerStatus::Stopped;
            let _ = self.shutdown_tx.send(true);
            return Ok(());
        }

        info!("Initiating graceful shutdown");
        *self.status.write() = WorkerStatus::Draining;
        let _ = self.shutdown_tx.send(true);

        let deadline = tokio::time::Instant::now() + self.shared.config.shutdown_timeout;
        let mut result = Ok(());
        loop {
            let in_flight = self.current_load();
            if in_flight == 0 {
                debug!("All jobs completed");
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining_jobs = in_flight, "Shutdown timeout reached");
                result = Err(WorkerError::ShutdownTimeout(in_flight));
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        if let Err(e) = self.shared.store.deregister_worker(&self.shared.worker_id).await {
            warn!("Failed to deregister worker: {}", e);
        }

        *self.status.write() = WorkerStatus::Stopped;
        info!("Queue worker stopped");
        result
    }

    /// Claim and run one batch of available jobs to completion
    ///
    /// Returns the number of jobs processed. Ignores the rate limiter; used
    /// for deterministic draining and tests.
    pub async fn process_available(&self) -> Result<usize, WorkerError> {
        let jobs = self
            .shared
            .store
            .claim_jobs(
                &self.shared.config.name,
                &self.shared.worker_id,
                self.concurrency(),
                self.shared.config.lock_duration,
            )
            .await?;

        let count = jobs.len();
        let runs = jobs
            .into_iter()
            .map(|job| execute_job(Arc::clone(&self.shared), job, None));
        futures::future::join_all(runs).await;
        Ok(count)
    }

    /// Run `process_available` until the queue has nothing claimable
    pub async fn drain(&self) -> Result<usize, WorkerError> {
        let mut total = 0;
        loop {
            let processed = self.process_available().await?;
            if processed == 0 {
                return Ok(total);
            }
            total += processed;
        }
    }

    fn spawn_poll_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let active_jobs = Arc::clone(&self.active_jobs);
        let shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut poller = JobPoller::new(
                Arc::clone(&shared.store),
                shared.config.name.clone(),
                shared.worker_id.clone(),
                shared.config.lock_duration,
                shared.config.poller.clone(),
                shutdown_rx,
            );
            let mut limiter = shared.config.rate_limiter.map(RateLimiter::new);

            loop {
                if poller.is_shutdown() {
                    debug!("Poll loop: shutdown requested");
                    break;
                }

                let mut slots = active_jobs.available_permits();
                if let Some(limiter) = limiter.as_mut() {
                    let now = tokio::time::Instant::now();
                    let allowed = limiter.available(now);
                    if allowed == 0 {
                        let reset = limiter.time_until_reset(now);
                        debug!(wait_ms = reset.as_millis(), "Poll loop: rate limited");
                        if poller.wait_for(reset).await {
                            break;
                        }
                        continue;
                    }
                    slots = slots.min(allowed);
                }

                if slots == 0 {
                    if poller.wait().await {
                        break;
                    }
                    continue;
                }

                match poller.poll(slots).await {
                    Ok(jobs) => {
                        if let Some(limiter) = limiter.as_mut() {
                            limiter.consume(tokio::time::Instant::now(), jobs.len());
                        }
                        for job in jobs {
                            let Ok(permit) = Arc::clone(&active_jobs).acquire_owned().await else {
                                break;
                            };
                            tokio::spawn(execute_job(Arc::clone(&shared), job, Some(permit)));
                        }
                    }
                    Err(e) => {
                        error!("Poll error: {}", e);
                    }
                }

                if poller.wait().await {
                    break;
                }
            }

            debug!("Poll loop exited");
        })
    }

    fn spawn_heartbeat_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let active_jobs = Arc::clone(&self.active_jobs);
        let concurrency = self.concurrency();
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WORKER_HEARTBEAT_INTERVAL);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let load = (concurrency - active_jobs.available_permits()) as u32;
                        if let Err(e) = shared.store.worker_heartbeat(&shared.worker_id, load).await {
                            error!("Heartbeat failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Heartbeat loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_reclaim_loop(&self) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(shared.config.stalled_interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match shared.store.reclaim_stalled(&shared.config.name).await {
                            Ok(reclaimed) if !reclaimed.is_empty() => {
                                info!(count = reclaimed.len(), "Reclaimed stalled jobs");
                            }
                            Ok(_) => {}
                            Err(e) => error!("Stalled job reclamation failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        debug!("Reclaim loop: shutdown requested");
                        break;
                    }
                }
            }
        })
    }
}

/// Run one claimed job and record its outcome
async fn execute_job(shared: Arc<WorkerShared>, job: Job, permit: Option<OwnedSemaphorePermit>) {
    let job_id = job.id;
    let job_name = job.job_name.clone();
    let lock_heartbeat = spawn_lock_heartbeat(Arc::clone(&shared), job_id);

    let handler = Arc::clone(&shared.handler);
    let result = match tokio::spawn(async move { handler(job).await }).await {
        Ok(result) => result,
        Err(join_err) => Err(JobError::new(format!("handler panicked: {}", join_err))),
    };
    lock_heartbeat.abort();

    let queue = shared.config.name.as_str();
    match result {
        Ok(output) => match shared.store.complete_job(job_id, output).await {
            Ok(()) => {
                debug!(%job_id, queue, "job completed");
                publish_job_event(&shared, "job.completed", json!({
                    "jobId": job_id,
                    "jobName": job_name,
                }))
                .await;
            }
            Err(e) => warn!(%job_id, queue, "failed to complete job: {}", e),
        },
        Err(job_error) => {
            match shared
                .store
                .fail_job(job_id, &job_error.message, job_error.stack.as_deref())
                .await
            {
                Ok(FailureOutcome::Retrying {
                    attempts_made,
                    delay,
                }) => {
                    warn!(%job_id, queue, attempts_made, delay_ms = delay.as_millis() as u64,
                        "job failed, will retry: {}", job_error);
                    publish_job_event(&shared, "job.retrying", json!({
                        "jobId": job_id,
                        "jobName": job_name,
                        "attemptsMade": attempts_made,
                        "delayMs": delay.as_millis() as u64,
                        "error": job_error.message,
                    }))
                    .await;
                }
                Ok(FailureOutcome::DeadLettered {
                    entry_id,
                    attempts_made,
                }) => {
                    error!(%job_id, %entry_id, queue, attempts_made,
                        "job exhausted retries, moved to dead letters: {}", job_error);
                    publish_job_event(&shared, "job.dead_lettered", json!({
                        "jobId": job_id,
                        "jobName": job_name,
                        "entryId": entry_id,
                        "attemptsMade": attempts_made,
                        "error": job_error.message,
                    }))
                    .await;
                }
                Err(e) => warn!(%job_id, queue, "failed to record job failure: {}", e),
            }
        }
    }

    drop(permit);
}

/// Keep the job's visibility timeout ahead of a slow handler
fn spawn_lock_heartbeat(shared: Arc<WorkerShared>, job_id: uuid::Uuid) -> JoinHandle<()> {
    tokio::spawn(async move {
        let lock_duration = shared.config.lock_duration;
        let period = (lock_duration / 2).max(MIN_LOCK_HEARTBEAT);
        loop {
            tokio::time::sleep(period).await;
            match shared
                .store
                .extend_job_lock(job_id, &shared.worker_id, lock_duration)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    warn!(%job_id, "job lock lost; another worker may redeliver it");
                    break;
                }
                Err(e) => warn!(%job_id, "failed to extend job lock: {}", e),
            }
        }
    })
}

async fn publish_job_event(shared: &WorkerShared, event_type: &str, mut data: serde_json::Value) {
    if let Some(fields) = data.as_object_mut() {
        fields.insert("queue".to_string(), json!(shared.config.name));
    }
    let event = EventEnvelope::new(queue_channel(&shared.config.name), event_type, data);
    publish_best_effort(shared.publisher.as_ref(), event).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventPublisher;
    use crate::job::JobOptions;
    use crate::persistence::InMemoryJobStore;
    use crate::queue::HandlerRegistry;
    use crate::reliability::Backoff;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn worker_with(
        store: Arc<InMemoryJobStore>,
        config: QueueConfig,
        handler: JobHandler,
    ) -> (QueueWorker, Arc<BroadcastEventPublisher>) {
        let publisher = Arc::new(BroadcastEventPublisher::default());
        let worker = QueueWorker::new(store, config, "test-worker", handler, publisher.clone());
        (worker, publisher)
    }

    fn registry_handler<F, Fut>(f: F) -> JobHandler
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = crate::queue::JobResult> + Send + 'static,
    {
        let mut registry = HandlerRegistry::new();
        registry.register("q", f);
        registry.get("q").unwrap()
    }

    #[tokio::test]
    async fn test_process_available_completes_jobs() {
        let store = Arc::new(InMemoryJobStore::new());
        let (worker, publisher) = worker_with(
            store.clone(),
            QueueConfig::new("q"),
            registry_handler(|job: Job| async move { Ok(job.payload) }),
        );
        let mut events = publisher.subscribe();

        let job = store
            .add_job(Job::new("q", "echo", json!({"n": 1}), &JobOptions::default()))
            .await
            .unwrap();

        assert_eq!(worker.process_available().await.unwrap(), 1);
        let stats = store.queue_stats("q").await.unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.waiting, 0);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, "job.completed");
        assert_eq!(event.data["jobId"], json!(job.id));
        assert_eq!(event.data["queue"], json!("q"));
    }

    #[tokio::test]
    async fn test_failed_job_is_retried() {
        let store = Arc::new(InMemoryJobStore::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let (worker, _) = worker_with(
            store.clone(),
            QueueConfig::new("q"),
            registry_handler(move |_job: Job| {
                let counter = Arc::clone(&counter);
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(JobError::new("transient"))
                    } else {
                        Ok(json!(null))
                    }
                }
            }),
        );

        let options = JobOptions::new()
            .with_attempts(3)
            .with_backoff(Backoff::immediate());
        store
            .add_job(Job::new("q", "flaky", json!({}), &options))
            .await
            .unwrap();

        assert_eq!(worker.drain().await.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.queue_stats("q").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        let store = Arc::new(InMemoryJobStore::new());
        let (worker, _) = worker_with(
            store.clone(),
            QueueConfig::new("q"),
            registry_handler(|job: Job| async move {
                if job.attempts_made < u32::MAX {
                    panic!("boom");
                }
                Ok(json!(null))
            }),
        );

        store
            .add_job(Job::new("q", "j", json!({}), &JobOptions::new().with_attempts(1)))
            .await
            .unwrap();

        worker.process_available().await.unwrap();
        assert_eq!(store.dead_letter_count(), 1);
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = QueueConfig::new("q").with_concurrency(2).with_poller(
            crate::worker::PollerConfig::new()
                .with_min_interval(Duration::from_millis(10))
                .with_max_interval(Duration::from_millis(20)),
        );
        let (worker, _) = worker_with(
            store.clone(),
            config,
            registry_handler(|_job: Job| async move { Ok(json!(null)) }),
        );

        worker.start().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Running);
        assert!(matches!(worker.start().await, Err(WorkerError::AlreadyRunning)));
        assert_eq!(store.queue_stats("q").await.unwrap().workers, 1);

        store
            .add_job(Job::new("q", "j", json!({}), &JobOptions::default()))
            .await
            .unwrap();

        let mut completed = 0;
        for _ in 0..100 {
            completed = store.queue_stats("q").await.unwrap().completed;
            if completed == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(completed, 1);

        worker.shutdown().await.unwrap();
        assert_eq!(worker.status(), WorkerStatus::Stopped);
        assert_eq!(store.queue_stats("q").await.unwrap().workers, 0);
    }
}
