//! One worker per registered queue, plus housekeeping loops

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::pool::{QueueWorker, WorkerError};
use crate::events::EventPublisher;
use crate::idempotency::IdempotencyGuard;
use crate::persistence::JobStore;
use crate::queue::{HandlerRegistry, QueueConfig};

/// Owns the [`QueueWorker`] of every queue that has a registered handler
///
/// Queues with a handler but no explicit configuration run with
/// [`QueueConfig::new`] defaults. With an idempotency sweep configured, the
/// runtime also deletes expired idempotency keys on a fixed period.
pub struct QueueRuntime {
    workers: Vec<QueueWorker>,
    idempotency_sweep: Option<(Arc<dyn IdempotencyGuard>, Duration)>,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl QueueRuntime {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: &HandlerRegistry,
        configs: &[QueueConfig],
        publisher: Arc<dyn EventPublisher>,
        worker_id_prefix: &str,
    ) -> Self {
        let by_name: HashMap<&str, &QueueConfig> =
            configs.iter().map(|c| (c.name.as_str(), c)).collect();

        let workers = registry
            .queues()
            .into_iter()
            .filter_map(|queue| {
                let handler = registry.get(&queue)?;
                let config = by_name
                    .get(queue.as_str())
                    .map(|c| (*c).clone())
                    .unwrap_or_else(|| QueueConfig::new(queue.clone()));
                Some(QueueWorker::new(
                    Arc::clone(&store),
                    config,
                    format!("{}:{}", worker_id_prefix, queue),
                    handler,
                    Arc::clone(&publisher),
                ))
            })
            .collect();

        let (shutdown_tx, _) = watch::channel(false);
        Self {
            workers,
            idempotency_sweep: None,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Purge expired keys from `guard` every `interval` while running
    pub fn with_idempotency_sweep(
        mut self,
        guard: Arc<dyn IdempotencyGuard>,
        interval: Duration,
    ) -> Self {
        self.idempotency_sweep = Some((guard, interval));
        self
    }

    /// Start every worker
    pub async fn start(&self) -> Result<(), WorkerError> {
        for worker in &self.workers {
            worker.start().await?;
        }
        if let Some((guard, interval)) = &self.idempotency_sweep {
            let handle =
                spawn_idempotency_sweep(Arc::clone(guard), *interval, self.shutdown_tx.subscribe());
            self.handles.lock().push(handle);
        }
        info!(queues = self.workers.len(), "Queue runtime started");
        Ok(())
    }

    /// Shut down every worker, returning the first error after all have stopped
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            handle.abort();
        }

        let results = futures::future::join_all(self.workers.iter().map(|w| w.shutdown())).await;

        let mut first_err = None;
        for (worker, result) in self.workers.iter().zip(results) {
            if let Err(e) = result {
                warn!(queue = worker.queue_name(), "Worker shutdown failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn workers(&self) -> &[QueueWorker] {
        &self.workers
    }

    pub fn worker(&self, queue_name: &str) -> Option<&QueueWorker> {
        self.workers.iter().find(|w| w.queue_name() == queue_name)
    }
}

fn spawn_idempotency_sweep(
    guard: Arc<dyn IdempotencyGuard>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match guard.purge_expired().await {
                        Ok(0) => {}
                        Ok(purged) => debug!(purged, "Purged expired idempotency keys"),
                        Err(e) => error!("Idempotency key sweep failed: {}", e),
                    }
                }
                _ = shutdown_rx.changed() => {
                    debug!("Idempotency sweep: shutdown requested");
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopEventPublisher;
    use crate::idempotency::InMemoryIdempotencyGuard;
    use crate::job::{Job, JobOptions};
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    #[tokio::test]
    async fn test_one_worker_per_registered_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        let mut registry = HandlerRegistry::new();
        registry
            .register("email:send", |job: Job| async move { Ok(job.payload) })
            .register("unconfigured", |job: Job| async move { Ok(job.payload) });

        let runtime = QueueRuntime::new(
            store.clone(),
            &registry,
            &[
                QueueConfig::new("email:send").with_concurrency(3),
                QueueConfig::new("no-handler"),
            ],
            Arc::new(NoopEventPublisher),
            "node-1",
        );

        assert_eq!(runtime.workers().len(), 2);
        assert!(runtime.worker("no-handler").is_none());

        let email = runtime.worker("email:send").unwrap();
        assert_eq!(email.worker_id(), "node-1:email:send");

        store
            .add_job(Job::new("unconfigured", "j", json!({}), &JobOptions::default()))
            .await
            .unwrap();
        let worker = runtime.worker("unconfigured").unwrap();
        assert_eq!(worker.process_available().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_sweep_purges_expired_idempotency_keys() {
        let guard = Arc::new(InMemoryIdempotencyGuard::new());
        guard.check_and_record("run:a:0", Duration::ZERO).await.unwrap();
        guard
            .check_and_record("run:b:0", Duration::from_secs(60))
            .await
            .unwrap();

        let runtime = QueueRuntime::new(
            Arc::new(InMemoryJobStore::new()),
            &HandlerRegistry::new(),
            &[],
            Arc::new(NoopEventPublisher),
            "node-1",
        )
        .with_idempotency_sweep(guard.clone(), Duration::from_millis(10));
        runtime.start().await.unwrap();

        for _ in 0..100 {
            if guard.key_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(guard.key_count(), 1);

        runtime.shutdown().await.unwrap();
    }
}
