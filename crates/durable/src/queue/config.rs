//! Per-queue settings

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::job::JobOptions;
use crate::reliability::{duration_millis, Backoff, RateLimiterConfig};
use crate::worker::PollerConfig;

/// Queue that drives workflow step execution
pub const WORKFLOW_RUN_QUEUE: &str = "workflows:run";

/// Name of the dead-letter queue derived from an origin queue
pub fn dlq_name(queue_name: &str) -> String {
    format!("{}:dlq", queue_name)
}

/// Settings for one named queue
///
/// Deserializes from TOML/JSON with every field except `name` optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    pub name: String,

    /// Jobs processed concurrently by one worker
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Default attempt budget for jobs on this queue
    #[serde(default = "default_attempts")]
    pub attempts: u32,

    #[serde(default)]
    pub backoff: Backoff,

    /// Visibility timeout of a claimed job
    #[serde(
        rename = "lock_duration_ms",
        with = "duration_millis",
        default = "default_lock_duration"
    )]
    pub lock_duration: Duration,

    /// How often expired claims are returned to the queue
    #[serde(
        rename = "stalled_interval_ms",
        with = "duration_millis",
        default = "default_stalled_interval"
    )]
    pub stalled_interval: Duration,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limiter: Option<RateLimiterConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<u32>,

    #[serde(default)]
    pub poller: PollerConfig,

    /// Drain timeout on shutdown
    #[serde(
        rename = "shutdown_timeout_ms",
        with = "duration_millis",
        default = "default_shutdown_timeout"
    )]
    pub shutdown_timeout: Duration,
}

fn default_concurrency() -> usize {
    5
}

fn default_attempts() -> u32 {
    3
}

fn default_lock_duration() -> Duration {
    Duration::from_secs(30)
}

fn default_stalled_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: default_concurrency(),
            attempts: default_attempts(),
            backoff: Backoff::default(),
            lock_duration: default_lock_duration(),
            stalled_interval: default_stalled_interval(),
            rate_limiter: None,
            remove_on_complete: None,
            remove_on_fail: None,
            poller: PollerConfig::default(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    pub fn with_stalled_interval(mut self, interval: Duration) -> Self {
        self.stalled_interval = interval;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_remove_on_complete(mut self, keep: u32) -> Self {
        self.remove_on_complete = Some(keep);
        self
    }

    pub fn with_remove_on_fail(mut self, keep: u32) -> Self {
        self.remove_on_fail = Some(keep);
        self
    }

    pub fn with_poller(mut self, poller: PollerConfig) -> Self {
        self.poller = poller;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Default submission options for jobs on this queue
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            idempotency_key: None,
            attempts: self.attempts.max(1),
            backoff: self.backoff.clone(),
            delay: None,
            remove_on_complete: self.remove_on_complete,
            remove_on_fail: self.remove_on_fail,
        }
    }
}

/// Built-in queues used when no queue file is configured
pub fn default_queues() -> Vec<QueueConfig> {
    vec![
        QueueConfig::new(WORKFLOW_RUN_QUEUE)
            .with_concurrency(10)
            .with_attempts(5)
            .with_backoff(Backoff::exponential(Duration::from_secs(2)))
            .with_lock_duration(Duration::from_secs(60))
            .with_remove_on_complete(1000)
            .with_remove_on_fail(5000),
        QueueConfig::new("webhooks:deliver")
            .with_concurrency(5)
            .with_attempts(5)
            .with_backoff(Backoff::exponential(Duration::from_secs(1)))
            .with_rate_limiter(RateLimiterConfig::new(50, Duration::from_secs(1))),
        QueueConfig::new("ai:content")
            .with_concurrency(2)
            .with_attempts(3)
            .with_backoff(Backoff::exponential(Duration::from_secs(5)))
            .with_lock_duration(Duration::from_secs(300))
            .with_rate_limiter(RateLimiterConfig::new(10, Duration::from_secs(60))),
        QueueConfig::new("email:send")
            .with_concurrency(5)
            .with_attempts(3)
            .with_backoff(Backoff::fixed(Duration::from_secs(30)))
            .with_rate_limiter(RateLimiterConfig::new(100, Duration::from_secs(1))),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::BackoffKind;

    #[test]
    fn test_dlq_name() {
        assert_eq!(dlq_name("email:send"), "email:send:dlq");
    }

    #[test]
    fn test_minimal_toml() {
        let config: QueueConfig = toml::from_str(r#"name = "reports:build""#).unwrap();

        assert_eq!(config, QueueConfig::new("reports:build"));
    }

    #[test]
    fn test_full_toml() {
        let config: QueueConfig = toml::from_str(
            r#"
            name = "webhooks:deliver"
            concurrency = 8
            attempts = 4
            lock_duration_ms = 45000
            stalled_interval_ms = 15000
            remove_on_fail = 100

            [backoff]
            type = "fixed"
            delay_ms = 2500

            [rate_limiter]
            max = 20
            duration_ms = 1000
            "#,
        )
        .unwrap();

        assert_eq!(config.concurrency, 8);
        assert_eq!(config.backoff.kind, BackoffKind::Fixed);
        assert_eq!(config.backoff.delay, Duration::from_millis(2500));
        assert_eq!(config.lock_duration, Duration::from_secs(45));
        assert_eq!(config.rate_limiter.map(|r| r.max), Some(20));

        let options = config.job_options();
        assert_eq!(options.attempts, 4);
        assert_eq!(options.remove_on_fail, Some(100));
    }

    #[test]
    fn test_default_queues() {
        let names: Vec<_> = default_queues().into_iter().map(|q| q.name).collect();
        assert_eq!(
            names,
            vec!["workflows:run", "webhooks:deliver", "ai:content", "email:send"]
        );
    }
}
