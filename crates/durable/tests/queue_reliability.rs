//! Queue reliability properties against the in-memory backends

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::json;

use conveyor_durable::{
    default_queues, instance_lock_key, Backoff, DeadLetterManager, DlqFilter, HandlerRegistry,
    InMemoryIdempotencyGuard, InMemoryJobStore, InMemoryLockManager, Job, JobError, JobOptions,
    JobProducer, JobStore, LockManager, NoopEventPublisher, Pagination, QueueConfig, QueueRuntime,
    QueueWorker,
};

fn worker_for(
    store: Arc<InMemoryJobStore>,
    config: QueueConfig,
    registry: &HandlerRegistry,
) -> QueueWorker {
    let handler = registry
        .get(&config.name)
        .expect("handler registered for queue");
    QueueWorker::new(store, config, "it-worker", handler, Arc::new(NoopEventPublisher))
}

fn always_failing(registry: &mut HandlerRegistry, queue: &str, seen: Arc<Mutex<Vec<u32>>>) {
    registry.register(queue, move |job: Job| {
        let seen = Arc::clone(&seen);
        async move {
            seen.lock().push(job.attempts_made + 1);
            Err(JobError::new("downstream unavailable").with_stack("at deliver()"))
        }
    });
}

#[test_log::test(tokio::test)]
async fn test_duplicate_submission_yields_one_job() {
    let store = Arc::new(InMemoryJobStore::new());
    let producer = JobProducer::new(store.clone(), Arc::new(InMemoryIdempotencyGuard::new()));
    let options = JobOptions::new().with_idempotency_key("run:abc:0");

    let first = producer
        .enqueue("workflows:run", "run", json!({"stepIndex": 0}), options.clone())
        .await
        .unwrap();
    let second = producer
        .enqueue("workflows:run", "run", json!({"stepIndex": 0}), options)
        .await
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert_eq!(store.jobs_in("workflows:run").len(), 1);
}

#[test_log::test(tokio::test)]
async fn test_always_failing_handler_is_attempted_max_attempts_times() {
    let store = Arc::new(InMemoryJobStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    always_failing(&mut registry, "webhooks:deliver", Arc::clone(&seen));

    let config = QueueConfig::new("webhooks:deliver")
        .with_attempts(4)
        .with_backoff(Backoff::immediate());
    let worker = worker_for(store.clone(), config.clone(), &registry);

    let job = store
        .add_job(Job::new("webhooks:deliver", "deliver", json!({"url": "x"}), &config.job_options()))
        .await
        .unwrap();

    worker.drain().await.unwrap();

    assert_eq!(*seen.lock(), vec![1, 2, 3, 4]);
    assert!(store.get_job(job.id).await.unwrap().is_none());

    let entries = store
        .list_dead_letters("webhooks:deliver", &DlqFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].original_job_id, job.id);
    assert_eq!(entries[0].attempts_made, 4);
    assert_eq!(entries[0].stack.as_deref(), Some("at deliver()"));
}

#[test_log::test(tokio::test)]
async fn test_replay_restores_liveness() {
    let store = Arc::new(InMemoryJobStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    always_failing(&mut registry, "ai:content", seen);

    let config = QueueConfig::new("ai:content")
        .with_attempts(1)
        .with_backoff(Backoff::immediate());
    let worker = worker_for(store.clone(), config.clone(), &registry);
    store
        .add_job(Job::new("ai:content", "generate", json!({"prompt": "p"}), &config.job_options()))
        .await
        .unwrap();
    worker.drain().await.unwrap();

    let dlq = DeadLetterManager::new(store.clone(), Arc::new(NoopEventPublisher));
    let entry = dlq
        .list("ai:content", &DlqFilter::default(), Pagination::default())
        .await
        .unwrap()
        .remove(0);

    // A failing re-enqueue leaves the entry intact
    store.inject_enqueue_failures(1);
    assert!(dlq.replay(entry.id).await.is_err());
    assert!(dlq.inspect(entry.id).await.is_ok());
    assert!(store.jobs_in("ai:content").is_empty());

    let job = dlq.replay(entry.id).await.unwrap();
    assert_eq!(job.attempts_made, 0);
    assert_eq!(job.payload, json!({"prompt": "p"}));
    assert_eq!(store.jobs_in("ai:content").len(), 1);
    assert_eq!(store.dead_letter_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_purge_after_exhausting_three_jobs() {
    let store = Arc::new(InMemoryJobStore::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    always_failing(&mut registry, "email:send", seen);

    let config = default_queues()
        .into_iter()
        .find(|q| q.name == "email:send")
        .unwrap()
        .with_backoff(Backoff::immediate());
    let worker = worker_for(store.clone(), config.clone(), &registry);

    for n in 0..3 {
        store
            .add_job(Job::new("email:send", "send", json!({"n": n}), &config.job_options()))
            .await
            .unwrap();
    }
    worker.drain().await.unwrap();

    let dlq = DeadLetterManager::new(store.clone(), Arc::new(NoopEventPublisher));
    assert_eq!(dlq.purge("email:send").await.unwrap(), 3);
    assert!(dlq
        .list("email:send", &DlqFilter::default(), Pagination::default())
        .await
        .unwrap()
        .is_empty());
}

#[test_log::test(tokio::test)]
async fn test_stalled_job_is_redelivered() {
    let store = Arc::new(InMemoryJobStore::new());
    let job = store
        .add_job(Job::new("q", "j", json!({}), &JobOptions::default()))
        .await
        .unwrap();

    store
        .claim_jobs("q", "crashed-worker", 1, Duration::from_secs(30))
        .await
        .unwrap();
    store.expire_lock(job.id);

    assert_eq!(store.reclaim_stalled("q").await.unwrap(), vec![job.id]);
    let redelivered = store
        .claim_jobs("q", "healthy-worker", 1, Duration::from_secs(30))
        .await
        .unwrap();
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].attempts_made, 0);
}

#[test_log::test(tokio::test)]
async fn test_runtime_processes_submitted_jobs() {
    let store = Arc::new(InMemoryJobStore::new());
    let processed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&processed);

    let mut registry = HandlerRegistry::new();
    registry.register("email:send", move |job: Job| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock().push(job.payload["n"].clone());
            Ok(json!(null))
        }
    });

    let config = QueueConfig::new("email:send").with_poller(
        conveyor_durable::PollerConfig::new()
            .with_min_interval(Duration::from_millis(5))
            .with_max_interval(Duration::from_millis(20)),
    );
    let runtime = QueueRuntime::new(
        store.clone(),
        &registry,
        &[config],
        Arc::new(NoopEventPublisher),
        "it",
    );
    runtime.start().await.unwrap();

    let producer = JobProducer::new(store.clone(), Arc::new(InMemoryIdempotencyGuard::new()));
    for n in 0..5 {
        producer
            .enqueue("email:send", "send", json!({"n": n}), JobOptions::default())
            .await
            .unwrap();
    }

    for _ in 0..200 {
        if processed.lock().len() == 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    runtime.shutdown().await.unwrap();

    assert_eq!(processed.lock().len(), 5);
    assert_eq!(store.queue_stats("email:send").await.unwrap().completed, 5);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lock_mutual_exclusion() {
    let locks = Arc::new(InMemoryLockManager::new());
    let key = instance_lock_key(uuid::Uuid::now_v7());

    let (a, b) = tokio::join!(
        {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            async move { locks.acquire(&key, Duration::from_secs(60)).await.unwrap() }
        },
        {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            async move { locks.acquire(&key, Duration::from_secs(60)).await.unwrap() }
        }
    );

    let winners: Vec<_> = [a, b].into_iter().flatten().collect();
    assert_eq!(winners.len(), 1);

    assert!(locks.release(&winners[0]).await.unwrap());
    assert!(locks
        .acquire(&key, Duration::from_secs(60))
        .await
        .unwrap()
        .is_some());
}
