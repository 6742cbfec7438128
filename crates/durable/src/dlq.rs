//! Dead-letter inspection, replay and purge
//!
//! Operator-facing view over the dead letters a [`JobStore`] keeps. Replay
//! hands the original job name, payload and retry settings back to the origin
//! queue with a fresh attempt counter; the store performs the insert and the entry
//! removal as one operation, so a failed replay leaves the entry in place.

use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::events::{publish_best_effort, queue_channel, EventEnvelope, EventPublisher};
use crate::job::Job;
use crate::persistence::{DeadLetterEntry, DlqFilter, JobStore, Pagination, StoreError};
use crate::queue::dlq_name;

/// Errors from dead-letter operations
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("dead-letter entry not found: {0}")]
    NotFound(Uuid),

    #[error("store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for DlqError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DeadLetterNotFound(id) => Self::NotFound(id),
            other => Self::Store(other),
        }
    }
}

/// Result of a batch replay
///
/// The batch never aborts on a single failure.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReplayBatchResult {
    pub success: Vec<Uuid>,
    pub failed: Vec<ReplayFailure>,
}

/// One entry that could not be replayed
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ReplayFailure {
    pub id: Uuid,
    pub error: String,
}

/// Dead-letter manager
#[derive(Clone)]
pub struct DeadLetterManager {
    store: Arc<dyn JobStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl DeadLetterManager {
    pub fn new(store: Arc<dyn JobStore>, publisher: Arc<dyn EventPublisher>) -> Self {
        Self { store, publisher }
    }

    /// List the entries dead-lettered from `queue_name`, newest first
    pub async fn list(
        &self,
        queue_name: &str,
        filter: &DlqFilter,
        page: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, DlqError> {
        Ok(self
            .store
            .list_dead_letters(queue_name, filter, page)
            .await?)
    }

    pub async fn inspect(&self, entry_id: Uuid) -> Result<DeadLetterEntry, DlqError> {
        self.store
            .get_dead_letter(entry_id)
            .await?
            .ok_or(DlqError::NotFound(entry_id))
    }

    /// Re-submit an entry to its origin queue and remove it
    #[instrument(skip(self))]
    pub async fn replay(&self, entry_id: Uuid) -> Result<Job, DlqError> {
        let job = self.store.requeue_dead_letter(entry_id).await?;

        info!(%entry_id, job_id = %job.id, queue = %job.queue_name, "replayed dead letter");
        let event = EventEnvelope::new(
            queue_channel(&job.queue_name),
            "job.replayed",
            json!({
                "queue": job.queue_name,
                "entryId": entry_id,
                "jobId": job.id,
                "jobName": job.job_name,
            }),
        );
        publish_best_effort(self.publisher.as_ref(), event).await;

        Ok(job)
    }

    /// Replay each entry independently, collecting failures
    pub async fn replay_batch(&self, entry_ids: &[Uuid]) -> ReplayBatchResult {
        let mut result = ReplayBatchResult::default();
        for &id in entry_ids {
            match self.replay(id).await {
                Ok(_) => result.success.push(id),
                Err(e) => {
                    warn!(entry_id = %id, "replay failed: {}", e);
                    result.failed.push(ReplayFailure {
                        id,
                        error: e.to_string(),
                    });
                }
            }
        }
        result
    }

    /// Delete a single entry; false when it did not exist
    pub async fn delete(&self, entry_id: Uuid) -> Result<bool, DlqError> {
        Ok(self.store.delete_dead_letter(entry_id).await?)
    }

    /// Irrecoverably delete every entry for a queue
    #[instrument(skip(self))]
    pub async fn purge(&self, queue_name: &str) -> Result<u64, DlqError> {
        let purged = self.store.purge_dead_letters(queue_name).await?;

        info!(purged, dlq = %dlq_name(queue_name), "purged dead letters");
        let event = EventEnvelope::new(
            queue_channel(queue_name),
            "dlq.purged",
            json!({ "queue": queue_name, "purged": purged }),
        );
        publish_best_effort(self.publisher.as_ref(), event).await;

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventPublisher;
    use crate::job::{JobOptions, JobState};
    use crate::persistence::InMemoryJobStore;

    async fn dead_letter(store: &InMemoryJobStore, queue: &str, error: &str) -> Uuid {
        store
            .add_job(Job::new(queue, "j", json!({"q": queue}), &JobOptions::new().with_attempts(1)))
            .await
            .unwrap();
        let job = store
            .claim_jobs(queue, "w", 1, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        match store.fail_job(job.id, error, None).await.unwrap() {
            crate::persistence::FailureOutcome::DeadLettered { entry_id, .. } => entry_id,
            other => panic!("expected dead letter, got {:?}", other),
        }
    }

    fn manager(store: Arc<InMemoryJobStore>) -> (DeadLetterManager, Arc<BroadcastEventPublisher>) {
        let publisher = Arc::new(BroadcastEventPublisher::default());
        (DeadLetterManager::new(store, publisher.clone()), publisher)
    }

    #[tokio::test]
    async fn test_replay_moves_entry_back_to_origin() {
        let store = Arc::new(InMemoryJobStore::new());
        let entry_id = dead_letter(&store, "email:send", "smtp refused").await;
        let (dlq, publisher) = manager(store.clone());
        let mut events = publisher.subscribe();

        let job = dlq.replay(entry_id).await.unwrap();
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(store.dead_letter_count(), 0);
        assert_eq!(store.jobs_in("email:send").len(), 1);

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_type, "job.replayed");

        assert!(matches!(dlq.inspect(entry_id).await, Err(DlqError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_replay_keeps_origin_queue_retry_settings() {
        let store = Arc::new(InMemoryJobStore::new());
        let config = crate::queue::default_queues()
            .into_iter()
            .find(|q| q.name == crate::queue::WORKFLOW_RUN_QUEUE)
            .unwrap();

        // One failure away from exhausting the queue's attempt budget
        let mut job = Job::new(&config.name, "run", json!({}), &config.job_options());
        job.attempts_made = config.attempts - 1;
        store.add_job(job).await.unwrap();
        let claimed = store
            .claim_jobs(&config.name, "w", 1, std::time::Duration::from_secs(30))
            .await
            .unwrap()
            .remove(0);
        let entry_id = match store.fail_job(claimed.id, "boom", None).await.unwrap() {
            crate::persistence::FailureOutcome::DeadLettered { entry_id, .. } => entry_id,
            other => panic!("expected dead letter, got {:?}", other),
        };
        let (dlq, _) = manager(store);

        let replayed = dlq.replay(entry_id).await.unwrap();
        assert_eq!(replayed.attempts_made, 0);
        assert_eq!(replayed.max_attempts, config.attempts);
        assert_eq!(replayed.backoff, config.backoff);
        assert_eq!(replayed.remove_on_fail, config.remove_on_fail);
    }

    #[tokio::test]
    async fn test_replay_batch_collects_failures() {
        let store = Arc::new(InMemoryJobStore::new());
        let first = dead_letter(&store, "q", "a").await;
        let second = dead_letter(&store, "q", "b").await;
        let missing = Uuid::now_v7();
        let (dlq, _) = manager(store.clone());

        let result = dlq.replay_batch(&[first, missing, second]).await;
        assert_eq!(result.success, vec![first, second]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].id, missing);
    }

    #[tokio::test]
    async fn test_list_filters_by_error() {
        let store = Arc::new(InMemoryJobStore::new());
        dead_letter(&store, "q", "timeout talking to provider").await;
        dead_letter(&store, "q", "invalid address").await;
        dead_letter(&store, "other", "timeout").await;
        let (dlq, _) = manager(store);

        let filter = DlqFilter {
            error_contains: Some("TIMEOUT".to_string()),
            ..Default::default()
        };
        let entries = dlq.list("q", &filter, Pagination::default()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].original_queue, "q");
    }

    #[tokio::test]
    async fn test_purge_only_touches_one_queue() {
        let store = Arc::new(InMemoryJobStore::new());
        dead_letter(&store, "q", "x").await;
        dead_letter(&store, "q", "y").await;
        dead_letter(&store, "other", "z").await;
        let (dlq, _) = manager(store.clone());

        assert_eq!(dlq.purge("q").await.unwrap(), 2);
        assert_eq!(store.dead_letter_count(), 1);
        assert!(!dlq.delete(Uuid::now_v7()).await.unwrap());
    }
}
