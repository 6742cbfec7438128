//! In-memory implementation of JobStore for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::job::{Job, JobState};

/// Internal job state
struct JobRecord {
    job: Job,
    locked_by: Option<String>,
    lock_expires_at: Option<DateTime<Utc>>,
    error_history: Vec<String>,
    completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        matches!(self.job.state, JobState::Waiting | JobState::Delayed)
            && self.job.available_at <= now
    }
}

/// In-memory implementation of JobStore
///
/// This is primarily for testing. It provides the same claiming, retry and
/// dead-letter semantics as the PostgreSQL implementation.
///
/// # Example
///
/// ```
/// use conveyor_durable::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// assert_eq!(store.job_count(), 0);
/// ```
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<Uuid, JobRecord>>,
    dead_letters: RwLock<HashMap<Uuid, DeadLetterEntry>>,
    paused: RwLock<HashSet<String>>,
    workers: RwLock<HashMap<String, WorkerInfo>>,
    enqueue_failures: AtomicU32,
}

impl InMemoryJobStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            dead_letters: RwLock::new(HashMap::new()),
            paused: RwLock::new(HashSet::new()),
            workers: RwLock::new(HashMap::new()),
            enqueue_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` inserts fail with a database error
    pub fn inject_enqueue_failures(&self, n: u32) {
        self.enqueue_failures.store(n, Ordering::SeqCst);
    }

    /// Get the number of jobs (any state)
    pub fn job_count(&self) -> usize {
        self.jobs.read().len()
    }

    /// Get all jobs for a queue, oldest first
    pub fn jobs_in(&self, queue_name: &str) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .values()
            .filter(|r| r.job.queue_name == queue_name)
            .map(|r| r.job.clone())
            .collect();
        jobs.sort_by_key(|j| (j.created_at, j.id));
        jobs
    }

    /// Get the number of dead-letter entries across all queues
    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.read().len()
    }

    /// Force the lock of an active job to expire
    pub fn expire_lock(&self, job_id: Uuid) {
        if let Some(record) = self.jobs.write().get_mut(&job_id) {
            record.lock_expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().clear();
        self.dead_letters.write().clear();
        self.paused.write().clear();
        self.workers.write().clear();
    }

    fn take_injected_failure(&self) -> bool {
        self.enqueue_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn trim_completed(jobs: &mut HashMap<Uuid, JobRecord>, queue_name: &str, keep: u32) {
        let mut completed: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|r| r.job.queue_name == queue_name && r.job.state == JobState::Completed)
            .map(|r| (r.completed_at.unwrap_or(r.job.created_at), r.job.id))
            .collect();
        if completed.len() <= keep as usize {
            return;
        }
        completed.sort();
        let excess = completed.len() - keep as usize;
        for (_, id) in completed.into_iter().take(excess) {
            jobs.remove(&id);
        }
    }

    fn trim_dead_letters(
        dead_letters: &mut HashMap<Uuid, DeadLetterEntry>,
        queue_name: &str,
        keep: u32,
    ) {
        let mut entries: Vec<(DateTime<Utc>, Uuid)> = dead_letters
            .values()
            .filter(|e| e.original_queue == queue_name)
            .map(|e| (e.failed_at, e.id))
            .collect();
        if entries.len() <= keep as usize {
            return;
        }
        entries.sort();
        let excess = entries.len() - keep as usize;
        for (_, id) in entries.into_iter().take(excess) {
            dead_letters.remove(&id);
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn add_job(&self, job: Job) -> Result<Job, StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Database("injected enqueue failure".to_string()));
        }

        self.jobs.write().insert(
            job.id,
            JobRecord {
                job: job.clone(),
                locked_by: None,
                lock_expires_at: None,
                error_history: vec![],
                completed_at: None,
            },
        );
        Ok(job)
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(&job_id).map(|r| r.job.clone()))
    }

    async fn claim_jobs(
        &self,
        queue_name: &str,
        worker_id: &str,
        max_jobs: usize,
        lock_duration: Duration,
    ) -> Result<Vec<Job>, StoreError> {
        if max_jobs == 0 || self.paused.read().contains(queue_name) {
            return Ok(vec![]);
        }

        let now = Utc::now();
        let lock_until = now + chrono::Duration::from_std(lock_duration).unwrap_or_default();
        let mut jobs = self.jobs.write();

        let mut candidates: Vec<(DateTime<Utc>, Uuid)> = jobs
            .values()
            .filter(|r| r.job.queue_name == queue_name && r.is_claimable(now))
            .map(|r| (r.job.available_at, r.job.id))
            .collect();
        candidates.sort();

        let mut claimed = Vec::with_capacity(candidates.len().min(max_jobs));
        for (_, id) in candidates.into_iter().take(max_jobs) {
            if let Some(record) = jobs.get_mut(&id) {
                record.job.state = JobState::Active;
                record.locked_by = Some(worker_id.to_string());
                record.lock_expires_at = Some(lock_until);
                claimed.push(record.job.clone());
            }
        }

        Ok(claimed)
    }

    async fn extend_job_lock(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_duration: Duration,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write();
        let Some(record) = jobs.get_mut(&job_id) else {
            return Ok(false);
        };

        if record.job.state != JobState::Active || record.locked_by.as_deref() != Some(worker_id) {
            return Ok(false);
        }

        record.lock_expires_at =
            Some(Utc::now() + chrono::Duration::from_std(lock_duration).unwrap_or_default());
        Ok(true)
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        _result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let record = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        if record.job.state != JobState::Active {
            return Err(StoreError::NotActive {
                id: job_id,
                state: record.job.state.to_string(),
            });
        }

        record.job.state = JobState::Completed;
        record.locked_by = None;
        record.lock_expires_at = None;
        record.completed_at = Some(Utc::now());

        let queue_name = record.job.queue_name.clone();
        let remove_on_complete = record.job.remove_on_complete;
        if let Some(keep) = remove_on_complete {
            Self::trim_completed(&mut jobs, &queue_name, keep);
        }
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &str,
        stack: Option<&str>,
    ) -> Result<FailureOutcome, StoreError> {
        let mut jobs = self.jobs.write();
        let record = jobs
            .get_mut(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;

        if record.job.state != JobState::Active {
            return Err(StoreError::NotActive {
                id: job_id,
                state: record.job.state.to_string(),
            });
        }

        record.job.attempts_made += 1;
        record.job.last_error = Some(error.to_string());
        record.error_history.push(error.to_string());
        record.locked_by = None;
        record.lock_expires_at = None;

        let attempts_made = record.job.attempts_made;
        if attempts_made < record.job.max_attempts {
            let delay = record.job.backoff.delay_for(attempts_made);
            let now = Utc::now();
            record.job.available_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
            record.job.state = if delay.is_zero() {
                JobState::Waiting
            } else {
                JobState::Delayed
            };
            return Ok(FailureOutcome::Retrying {
                attempts_made,
                delay,
            });
        }

        let record = jobs
            .remove(&job_id)
            .ok_or(StoreError::JobNotFound(job_id))?;
        drop(jobs);

        let entry = DeadLetterEntry {
            id: Uuid::now_v7(),
            original_queue: record.job.queue_name.clone(),
            original_job_id: job_id,
            job_name: record.job.job_name.clone(),
            payload: record.job.payload.clone(),
            attempts_made,
            error: error.to_string(),
            stack: stack.map(str::to_string),
            error_history: record.error_history,
            failed_at: Utc::now(),
            max_attempts: record.job.max_attempts,
            backoff: record.job.backoff.clone(),
            remove_on_complete: record.job.remove_on_complete,
            remove_on_fail: record.job.remove_on_fail,
        };
        let entry_id = entry.id;

        let mut dead_letters = self.dead_letters.write();
        dead_letters.insert(entry_id, entry);
        if let Some(keep) = record.job.remove_on_fail {
            Self::trim_dead_letters(&mut dead_letters, &record.job.queue_name, keep);
        }

        Ok(FailureOutcome::DeadLettered {
            entry_id,
            attempts_made,
        })
    }

    async fn reclaim_stalled(&self, queue_name: &str) -> Result<Vec<Uuid>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let mut reclaimed = vec![];

        for record in jobs.values_mut() {
            let expired = record.lock_expires_at.is_some_and(|at| at <= now);
            if record.job.queue_name == queue_name && record.job.state == JobState::Active && expired
            {
                record.job.state = JobState::Waiting;
                record.job.available_at = now;
                record.locked_by = None;
                record.lock_expires_at = None;
                reclaimed.push(record.job.id);
            }
        }

        Ok(reclaimed)
    }

    async fn queue_stats(&self, queue_name: &str) -> Result<QueueStats, StoreError> {
        let now = Utc::now();
        let mut stats = QueueStats::default();

        for record in self.jobs.read().values() {
            if record.job.queue_name != queue_name {
                continue;
            }
            match record.job.state {
                JobState::Active => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::Waiting => stats.waiting += 1,
                JobState::Delayed if record.job.available_at <= now => stats.waiting += 1,
                JobState::Delayed => stats.delayed += 1,
            }
        }

        stats.failed = self
            .dead_letters
            .read()
            .values()
            .filter(|e| e.original_queue == queue_name)
            .count() as u64;
        stats.workers = self
            .workers
            .read()
            .values()
            .filter(|w| w.queue_name == queue_name)
            .count() as u64;
        stats.paused = self.paused.read().contains(queue_name);

        Ok(stats)
    }

    async fn pause_queue(&self, queue_name: &str) -> Result<(), StoreError> {
        self.paused.write().insert(queue_name.to_string());
        Ok(())
    }

    async fn resume_queue(&self, queue_name: &str) -> Result<(), StoreError> {
        self.paused.write().remove(queue_name);
        Ok(())
    }

    async fn is_paused(&self, queue_name: &str) -> Result<bool, StoreError> {
        Ok(self.paused.read().contains(queue_name))
    }

    async fn list_dead_letters(
        &self,
        queue_name: &str,
        filter: &DlqFilter,
        pagination: Pagination,
    ) -> Result<Vec<DeadLetterEntry>, StoreError> {
        let mut entries: Vec<DeadLetterEntry> = self
            .dead_letters
            .read()
            .values()
            .filter(|e| e.original_queue == queue_name && filter.matches(e))
            .cloned()
            .collect();
        entries.sort_by(|a, b| (b.failed_at, b.id).cmp(&(a.failed_at, a.id)));

        Ok(entries
            .into_iter()
            .skip(pagination.offset as usize)
            .take(pagination.limit as usize)
            .collect())
    }

    async fn get_dead_letter(&self, entry_id: Uuid) -> Result<Option<DeadLetterEntry>, StoreError> {
        Ok(self.dead_letters.read().get(&entry_id).cloned())
    }

    async fn requeue_dead_letter(&self, entry_id: Uuid) -> Result<Job, StoreError> {
        let mut dead_letters = self.dead_letters.write();
        let entry = dead_letters
            .get(&entry_id)
            .ok_or(StoreError::DeadLetterNotFound(entry_id))?;

        if self.take_injected_failure() {
            return Err(StoreError::Database("injected enqueue failure".to_string()));
        }

        let job = Job::new(
            entry.original_queue.clone(),
            entry.job_name.clone(),
            entry.payload.clone(),
            &entry.replay_options(),
        );
        self.jobs.write().insert(
            job.id,
            JobRecord {
                job: job.clone(),
                locked_by: None,
                lock_expires_at: None,
                error_history: vec![],
                completed_at: None,
            },
        );
        dead_letters.remove(&entry_id);

        Ok(job)
    }

    async fn delete_dead_letter(&self, entry_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.dead_letters.write().remove(&entry_id).is_some())
    }

    async fn purge_dead_letters(&self, queue_name: &str) -> Result<u64, StoreError> {
        let mut dead_letters = self.dead_letters.write();
        let before = dead_letters.len();
        dead_letters.retain(|_, e| e.original_queue != queue_name);
        Ok((before - dead_letters.len()) as u64)
    }

    async fn register_worker(&self, worker: WorkerInfo) -> Result<(), StoreError> {
        self.workers.write().insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn worker_heartbeat(&self, worker_id: &str, current_load: u32) -> Result<(), StoreError> {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.current_load = current_load;
            worker.last_heartbeat_at = Utc::now();
        }
        Ok(())
    }

    async fn deregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        self.workers.write().remove(worker_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::reliability::Backoff;
    use serde_json::json;

    fn options(attempts: u32) -> JobOptions {
        JobOptions::new()
            .with_attempts(attempts)
            .with_backoff(Backoff::immediate())
    }

    const LOCK: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_claim_marks_active_and_hides_job() {
        let store = InMemoryJobStore::new();
        let job = store
            .add_job(Job::new("email:send", "welcome", json!({}), &options(3)))
            .await
            .unwrap();

        let claimed = store.claim_jobs("email:send", "w1", 10, LOCK).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, job.id);
        assert_eq!(claimed[0].state, JobState::Active);

        let again = store.claim_jobs("email:send", "w2", 10, LOCK).await.unwrap();
        assert!(again.is_empty());
    }

    #[tokio::test]
    async fn test_claim_respects_queue_and_limit() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            store
                .add_job(Job::new("a", "j", json!({}), &options(1)))
                .await
                .unwrap();
        }
        store
            .add_job(Job::new("b", "j", json!({}), &options(1)))
            .await
            .unwrap();

        let claimed = store.claim_jobs("a", "w1", 2, LOCK).await.unwrap();
        assert_eq!(claimed.len(), 2);
        assert!(claimed.iter().all(|j| j.queue_name == "a"));
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable() {
        let store = InMemoryJobStore::new();
        store
            .add_job(Job::new(
                "q",
                "j",
                json!({}),
                &options(1).with_delay(Duration::from_secs(60)),
            ))
            .await
            .unwrap();

        assert!(store.claim_jobs("q", "w1", 1, LOCK).await.unwrap().is_empty());
        assert_eq!(store.queue_stats("q").await.unwrap().delayed, 1);
    }

    #[tokio::test]
    async fn test_fail_retries_then_dead_letters() {
        let store = InMemoryJobStore::new();
        let job = store
            .add_job(Job::new("q", "j", json!({"n": 1}), &options(2)))
            .await
            .unwrap();

        store.claim_jobs("q", "w1", 1, LOCK).await.unwrap();
        let first = store.fail_job(job.id, "boom", None).await.unwrap();
        assert!(matches!(
            first,
            FailureOutcome::Retrying {
                attempts_made: 1,
                ..
            }
        ));

        store.claim_jobs("q", "w1", 1, LOCK).await.unwrap();
        let second = store.fail_job(job.id, "boom again", Some("trace")).await.unwrap();
        let FailureOutcome::DeadLettered {
            entry_id,
            attempts_made,
        } = second
        else {
            panic!("expected dead letter, got {:?}", second);
        };
        assert_eq!(attempts_made, 2);

        assert!(store.get_job(job.id).await.unwrap().is_none());
        let entry = store.get_dead_letter(entry_id).await.unwrap().unwrap();
        assert_eq!(entry.original_job_id, job.id);
        assert_eq!(entry.error, "boom again");
        assert_eq!(entry.stack.as_deref(), Some("trace"));
        assert_eq!(entry.error_history, vec!["boom", "boom again"]);
    }

    #[tokio::test]
    async fn test_fail_requires_active() {
        let store = InMemoryJobStore::new();
        let job = store
            .add_job(Job::new("q", "j", json!({}), &options(1)))
            .await
            .unwrap();

        let err = store.fail_job(job.id, "x", None).await.unwrap_err();
        assert!(matches!(err, StoreError::NotActive { .. }));
    }

    #[tokio::test]
    async fn test_reclaim_stalled_keeps_attempts() {
        let store = InMemoryJobStore::new();
        let job = store
            .add_job(Job::new("q", "j", json!({}), &options(3)))
            .await
            .unwrap();
        store.claim_jobs("q", "w1", 1, LOCK).await.unwrap();

        assert!(store.reclaim_stalled("q").await.unwrap().is_empty());

        store.expire_lock(job.id);
        assert_eq!(store.reclaim_stalled("q").await.unwrap(), vec![job.id]);

        let reclaimed = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(reclaimed.state, JobState::Waiting);
        assert_eq!(reclaimed.attempts_made, 0);
        assert!(!store.extend_job_lock(job.id, "w1", LOCK).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_on_complete_trims_history() {
        let store = InMemoryJobStore::new();
        for _ in 0..3 {
            let job = store
                .add_job(Job::new(
                    "q",
                    "j",
                    json!({}),
                    &options(1).with_remove_on_complete(1),
                ))
                .await
                .unwrap();
            store.claim_jobs("q", "w1", 1, LOCK).await.unwrap();
            store.complete_job(job.id, json!(null)).await.unwrap();
        }

        assert_eq!(store.queue_stats("q").await.unwrap().completed, 1);
    }

    #[tokio::test]
    async fn test_paused_queue_hands_out_nothing() {
        let store = InMemoryJobStore::new();
        store
            .add_job(Job::new("q", "j", json!({}), &options(1)))
            .await
            .unwrap();

        store.pause_queue("q").await.unwrap();
        assert!(store.claim_jobs("q", "w1", 1, LOCK).await.unwrap().is_empty());
        assert!(store.queue_stats("q").await.unwrap().paused);

        store.resume_queue("q").await.unwrap();
        assert_eq!(store.claim_jobs("q", "w1", 1, LOCK).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_requeue_failure_leaves_entry() {
        let store = InMemoryJobStore::new();
        let job = store
            .add_job(Job::new("q", "j", json!({"k": "v"}), &options(1)))
            .await
            .unwrap();
        store.claim_jobs("q", "w1", 1, LOCK).await.unwrap();
        let FailureOutcome::DeadLettered { entry_id, .. } =
            store.fail_job(job.id, "dead", None).await.unwrap()
        else {
            panic!("expected dead letter");
        };

        store.inject_enqueue_failures(1);
        assert!(store.requeue_dead_letter(entry_id).await.is_err());
        assert!(store.get_dead_letter(entry_id).await.unwrap().is_some());

        let requeued = store.requeue_dead_letter(entry_id).await.unwrap();
        assert_eq!(requeued.attempts_made, 0);
        assert_eq!(requeued.payload, json!({"k": "v"}));
        assert!(store.get_dead_letter(entry_id).await.unwrap().is_none());
    }
}
