//! Job polling with exponential backoff
//!
//! Implements job claiming with adaptive polling intervals.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, instrument, trace};

use crate::job::Job;
use crate::persistence::{JobStore, StoreError};
use crate::reliability::duration_millis;

/// Polling configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PollerConfig {
    /// Minimum poll interval (when jobs are available)
    #[serde(rename = "min_interval_ms", with = "duration_millis")]
    pub min_interval: Duration,

    /// Maximum poll interval (when idle)
    #[serde(rename = "max_interval_ms", with = "duration_millis")]
    pub max_interval: Duration,

    /// Backoff multiplier when no jobs found
    pub backoff_multiplier: f64,

    /// Maximum jobs to claim per poll
    pub batch_size: usize,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(100),
            max_interval: Duration::from_secs(5),
            backoff_multiplier: 1.5,
            batch_size: 10,
        }
    }
}

impl PollerConfig {
    /// Create a new poller configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set minimum poll interval
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Set maximum poll interval
    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    /// Set backoff multiplier
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self
    }

    /// Set batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }
}

/// Job poller with adaptive backoff
///
/// Backs off exponentially while the queue is empty and resets to the
/// minimum interval as soon as a poll claims something.
pub struct JobPoller {
    store: Arc<dyn JobStore>,
    queue_name: String,
    worker_id: String,
    lock_duration: Duration,
    config: PollerConfig,
    current_interval: Duration,
    shutdown_rx: watch::Receiver<bool>,
}

impl JobPoller {
    /// Create a new job poller
    pub fn new(
        store: Arc<dyn JobStore>,
        queue_name: String,
        worker_id: String,
        lock_duration: Duration,
        config: PollerConfig,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            queue_name,
            worker_id,
            lock_duration,
            current_interval: config.min_interval,
            config,
            shutdown_rx,
        }
    }

    /// Claim up to `max_jobs` jobs and update the backoff state
    #[instrument(skip(self), fields(queue = %self.queue_name, worker_id = %self.worker_id))]
    pub async fn poll(&mut self, max_jobs: usize) -> Result<Vec<Job>, StoreError> {
        if self.is_shutdown() {
            debug!("Poller shutdown requested");
            return Ok(vec![]);
        }

        let batch_size = max_jobs.min(self.config.batch_size);
        let jobs = self
            .store
            .claim_jobs(&self.queue_name, &self.worker_id, batch_size, self.lock_duration)
            .await?;

        if jobs.is_empty() {
            self.increase_backoff();
            trace!(
                interval_ms = self.current_interval.as_millis(),
                "No jobs found, backing off"
            );
        } else {
            self.reset_backoff();
            debug!(count = jobs.len(), "Claimed jobs");
        }

        Ok(jobs)
    }

    /// Wait for the current backoff interval
    ///
    /// Returns true if shutdown was signaled while waiting.
    pub async fn wait(&mut self) -> bool {
        let interval = self.current_interval;
        self.wait_for(interval).await
    }

    /// Wait for `duration`, returning true on shutdown
    pub async fn wait_for(&mut self, duration: Duration) -> bool {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = shutdown_rx.changed() => {
                debug!("Shutdown signal received during wait");
                true
            }
        }
    }

    /// Get the current poll interval
    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    /// Check if shutdown has been requested
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    fn reset_backoff(&mut self) {
        self.current_interval = self.config.min_interval;
    }

    fn increase_backoff(&mut self) {
        let next = Duration::from_secs_f64(
            self.current_interval.as_secs_f64() * self.config.backoff_multiplier,
        );
        self.current_interval = next.min(self.config.max_interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobOptions;
    use crate::persistence::InMemoryJobStore;
    use serde_json::json;

    #[test]
    fn test_default_config() {
        let config = PollerConfig::default();
        assert_eq!(config.min_interval, Duration::from_millis(100));
        assert_eq!(config.max_interval, Duration::from_secs(5));
        assert_eq!(config.backoff_multiplier, 1.5);
        assert_eq!(config.batch_size, 10);
    }

    #[test]
    fn test_config_builder() {
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(10))
            .with_backoff_multiplier(0.5)
            .with_batch_size(0);

        assert_eq!(config.min_interval, Duration::from_millis(50));
        assert_eq!(config.max_interval, Duration::from_secs(10));
        assert_eq!(config.backoff_multiplier, 1.0);
        assert_eq!(config.batch_size, 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_then_resets() {
        let store = Arc::new(InMemoryJobStore::new());
        let (_tx, rx) = watch::channel(false);
        let config = PollerConfig::new()
            .with_min_interval(Duration::from_millis(100))
            .with_max_interval(Duration::from_millis(300))
            .with_backoff_multiplier(2.0);
        let mut poller = JobPoller::new(
            store.clone(),
            "q".to_string(),
            "w1".to_string(),
            Duration::from_secs(30),
            config,
            rx,
        );

        poller.poll(5).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(200));
        poller.poll(5).await.unwrap();
        assert_eq!(poller.current_interval(), Duration::from_millis(300));

        store
            .add_job(Job::new("q", "j", json!({}), &JobOptions::default()))
            .await
            .unwrap();
        assert_eq!(poller.poll(5).await.unwrap().len(), 1);
        assert_eq!(poller.current_interval(), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_returns_on_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let (tx, rx) = watch::channel(false);
        let mut poller = JobPoller::new(
            store,
            "q".to_string(),
            "w1".to_string(),
            Duration::from_secs(30),
            PollerConfig::default(),
            rx,
        );

        tx.send(true).unwrap();
        assert!(poller.wait_for(Duration::from_secs(60)).await);
        assert!(poller.is_shutdown());
        assert!(poller.poll(1).await.unwrap().is_empty());
    }
}
