//! Job submission with idempotency suppression

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, instrument, warn};

use super::config::QueueConfig;
use crate::idempotency::{IdempotencyError, IdempotencyGuard, DEFAULT_IDEMPOTENCY_TTL};
use crate::job::{Job, JobEnvelope, JobOptions};
use crate::persistence::{JobStore, StoreError};

/// Errors from job submission
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("idempotency error: {0}")]
    Idempotency(#[from] IdempotencyError),

    #[error("invalid job: {0}")]
    InvalidJob(String),
}

/// Submits jobs to named queues
///
/// A keyed submission first records its key with the [`IdempotencyGuard`];
/// a key already seen within the TTL yields `Ok(None)` and no queue write.
/// `None` means "already submitted", not failure.
#[derive(Clone)]
pub struct JobProducer {
    store: Arc<dyn JobStore>,
    guard: Arc<dyn IdempotencyGuard>,
    idempotency_ttl: Duration,
    queue_defaults: HashMap<String, JobOptions>,
}

impl JobProducer {
    pub fn new(store: Arc<dyn JobStore>, guard: Arc<dyn IdempotencyGuard>) -> Self {
        Self {
            store,
            guard,
            idempotency_ttl: DEFAULT_IDEMPOTENCY_TTL,
            queue_defaults: HashMap::new(),
        }
    }

    pub fn with_idempotency_ttl(mut self, ttl: Duration) -> Self {
        self.idempotency_ttl = ttl;
        self
    }

    /// Use each queue's settings as the base options for envelopes
    pub fn with_queue_configs<'a>(mut self, configs: impl IntoIterator<Item = &'a QueueConfig>) -> Self {
        for config in configs {
            self.queue_defaults
                .insert(config.name.clone(), config.job_options());
        }
        self
    }

    /// Base options for a queue
    pub fn default_options(&self, queue_name: &str) -> JobOptions {
        self.queue_defaults
            .get(queue_name)
            .cloned()
            .unwrap_or_default()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Submit a job; `Ok(None)` when the idempotency key was already seen
    #[instrument(skip(self, payload, options), fields(queue = %queue_name, job_name = %job_name))]
    pub async fn enqueue(
        &self,
        queue_name: &str,
        job_name: &str,
        payload: serde_json::Value,
        options: JobOptions,
    ) -> Result<Option<Job>, QueueError> {
        if queue_name.trim().is_empty() || job_name.trim().is_empty() {
            return Err(QueueError::InvalidJob(
                "queue name and job name are required".to_string(),
            ));
        }

        if let Some(key) = options.idempotency_key.as_deref() {
            if !self.guard.check_and_record(key, self.idempotency_ttl).await? {
                debug!(idempotency_key = key, "duplicate submission suppressed");
                return Ok(None);
            }
        }

        let job = Job::new(queue_name, job_name, payload, &options);
        match self.store.add_job(job).await {
            Ok(job) => {
                debug!(job_id = %job.id, "enqueued job");
                Ok(Some(job))
            }
            Err(e) => {
                // Let a later retry of the same submission through
                if let Some(key) = options.idempotency_key.as_deref() {
                    if let Err(forget_err) = self.guard.forget(key).await {
                        warn!(idempotency_key = key, "failed to release key: {}", forget_err);
                    }
                }
                Err(e.into())
            }
        }
    }

    /// Submit a wire envelope, layering its options over the queue defaults
    pub async fn enqueue_envelope(&self, envelope: JobEnvelope) -> Result<Option<Job>, QueueError> {
        let base = self.default_options(&envelope.queue_name);
        let options = match &envelope.opts {
            Some(opts) => opts.apply_to(base),
            None => base,
        };

        self.enqueue(&envelope.queue_name, &envelope.job_name, envelope.data, options)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::idempotency::InMemoryIdempotencyGuard;
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    fn producer() -> (Arc<InMemoryJobStore>, JobProducer) {
        let store = Arc::new(InMemoryJobStore::new());
        let producer = JobProducer::new(store.clone(), Arc::new(InMemoryIdempotencyGuard::new()));
        (store, producer)
    }

    #[tokio::test]
    async fn test_duplicate_key_returns_none() {
        let (store, producer) = producer();
        let options = JobOptions::new().with_idempotency_key("order-7");

        let first = producer
            .enqueue("email:send", "receipt", json!({"order": 7}), options.clone())
            .await
            .unwrap();
        let second = producer
            .enqueue("email:send", "receipt", json!({"order": 7}), options)
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_unkeyed_jobs_are_not_deduplicated() {
        let (store, producer) = producer();

        for _ in 0..2 {
            producer
                .enqueue("email:send", "digest", json!({}), JobOptions::default())
                .await
                .unwrap();
        }
        assert_eq!(store.job_count(), 2);
    }

    #[tokio::test]
    async fn test_store_failure_releases_key() {
        let (store, producer) = producer();
        let options = JobOptions::new().with_idempotency_key("k");

        store.inject_enqueue_failures(1);
        assert!(producer
            .enqueue("q", "j", json!({}), options.clone())
            .await
            .is_err());

        let retried = producer.enqueue("q", "j", json!({}), options).await.unwrap();
        assert!(retried.is_some());
    }

    #[tokio::test]
    async fn test_envelope_uses_queue_defaults() {
        let (store, producer) = producer();
        let producer = producer
            .with_queue_configs(&[QueueConfig::new("webhooks:deliver").with_attempts(7)]);

        let envelope: JobEnvelope = serde_json::from_value(json!({
            "queueName": "webhooks:deliver",
            "jobName": "deliver",
            "data": {"url": "https://hooks.test/1"}
        }))
        .unwrap();
        let job = producer.enqueue_envelope(envelope).await.unwrap().unwrap();

        assert_eq!(job.max_attempts, 7);
        assert_eq!(store.jobs_in("webhooks:deliver").len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_empty_names() {
        let (_, producer) = producer();
        let result = producer
            .enqueue("", "j", json!({}), JobOptions::default())
            .await;
        assert!(matches!(result, Err(QueueError::InvalidJob(_))));
    }
}
