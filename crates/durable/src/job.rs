//! Job model and submission options

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reliability::Backoff;

/// Lifecycle state of a job inside its origin queue
///
/// Jobs that exhaust their attempts leave the queue and become
/// dead-letter entries, so there is no `Failed` state here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be claimed
    Waiting,
    /// Scheduled for later (initial delay or retry backoff)
    Delayed,
    /// Claimed by a worker
    Active,
    /// Handler succeeded
    Completed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Delayed => write!(f, "delayed"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "delayed" => Ok(Self::Delayed),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            other => Err(format!("unknown job state: {}", other)),
        }
    }
}

/// A unit of queued work
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub id: Uuid,
    pub queue_name: String,
    pub job_name: String,
    pub payload: serde_json::Value,
    /// Failed attempts so far
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub idempotency_key: Option<String>,
    pub state: JobState,
    pub created_at: DateTime<Utc>,
    /// Earliest time the job may be claimed
    pub available_at: DateTime<Utc>,
    pub last_error: Option<String>,
    /// Keep at most this many completed jobs for the queue
    pub remove_on_complete: Option<u32>,
    /// Keep at most this many dead-letter entries for the queue
    pub remove_on_fail: Option<u32>,
}

impl Job {
    /// Build a fresh job from submission options
    pub fn new(
        queue_name: impl Into<String>,
        job_name: impl Into<String>,
        payload: serde_json::Value,
        options: &JobOptions,
    ) -> Self {
        let now = Utc::now();
        let (state, available_at) = match options.delay {
            Some(delay) if !delay.is_zero() => (
                JobState::Delayed,
                now + chrono::Duration::from_std(delay).unwrap_or_default(),
            ),
            _ => (JobState::Waiting, now),
        };

        Self {
            id: Uuid::now_v7(),
            queue_name: queue_name.into(),
            job_name: job_name.into(),
            payload,
            attempts_made: 0,
            max_attempts: options.attempts.max(1),
            backoff: options.backoff.clone(),
            idempotency_key: options.idempotency_key.clone(),
            state,
            created_at: now,
            available_at,
            last_error: None,
            remove_on_complete: options.remove_on_complete,
            remove_on_fail: options.remove_on_fail,
        }
    }

    /// Whether another failure would exhaust the attempt budget
    pub fn is_last_attempt(&self) -> bool {
        self.attempts_made + 1 >= self.max_attempts
    }

    /// Deserialize the payload into a typed value
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Options accepted by [`JobProducer::enqueue`](crate::queue::JobProducer::enqueue)
#[derive(Debug, Clone, PartialEq)]
pub struct JobOptions {
    /// Deduplication token (see [`IdempotencyGuard`](crate::idempotency::IdempotencyGuard))
    pub idempotency_key: Option<String>,

    /// Maximum attempts including the first
    pub attempts: u32,

    pub backoff: Backoff,

    /// Initial delay before the job becomes claimable
    pub delay: Option<Duration>,

    pub remove_on_complete: Option<u32>,

    pub remove_on_fail: Option<u32>,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            idempotency_key: None,
            attempts: 3,
            backoff: Backoff::default(),
            delay: None,
            remove_on_complete: None,
            remove_on_fail: None,
        }
    }
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
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

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
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
}

/// Generic submission envelope as accepted from external callers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct JobEnvelope {
    pub queue_name: String,
    pub job_name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opts: Option<EnvelopeOptions>,
}

/// Optional overrides carried in a [`JobEnvelope`]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_complete: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remove_on_fail: Option<u32>,
}

impl EnvelopeOptions {
    /// Layer these overrides on top of queue defaults
    pub fn apply_to(&self, mut options: JobOptions) -> JobOptions {
        if let Some(key) = &self.idempotency_key {
            options.idempotency_key = Some(key.clone());
        }
        if let Some(attempts) = self.attempts {
            options.attempts = attempts.max(1);
        }
        if let Some(backoff) = &self.backoff {
            options.backoff = backoff.clone();
        }
        if self.remove_on_complete.is_some() {
            options.remove_on_complete = self.remove_on_complete;
        }
        if self.remove_on_fail.is_some() {
            options.remove_on_fail = self.remove_on_fail;
        }
        options
    }
}

/// Error returned by a job handler
///
/// Every handler error is retried according to the job's backoff until
/// `max_attempts` is reached, after which the job is dead-lettered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobError {
    pub message: String,
    pub stack: Option<String>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
        }
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for JobError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliability::BackoffKind;
    use serde_json::json;

    #[test]
    fn test_new_job_defaults() {
        let job = Job::new("email:send", "welcome", json!({"to": 7}), &JobOptions::default());

        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.max_attempts, 3);
        assert!(job.available_at <= Utc::now());
    }

    #[test]
    fn test_delayed_job() {
        let options = JobOptions::new().with_delay(Duration::from_secs(30));
        let job = Job::new("email:send", "digest", json!({}), &options);

        assert_eq!(job.state, JobState::Delayed);
        assert!(job.available_at > job.created_at);
    }

    #[test]
    fn test_last_attempt() {
        let mut job = Job::new("q", "j", json!({}), &JobOptions::new().with_attempts(2));
        assert!(!job.is_last_attempt());
        job.attempts_made = 1;
        assert!(job.is_last_attempt());
    }

    #[test]
    fn test_envelope_overrides() {
        let envelope: JobEnvelope = serde_json::from_value(json!({
            "queueName": "webhooks:deliver",
            "jobName": "deliver",
            "data": {"url": "https://example.test"},
            "opts": {
                "idempotencyKey": "hook-1",
                "attempts": 5,
                "backoff": {"type": "fixed", "delayMs": 2000}
            }
        }))
        .unwrap();

        let options = envelope
            .opts
            .as_ref()
            .unwrap()
            .apply_to(JobOptions::default());

        assert_eq!(options.idempotency_key.as_deref(), Some("hook-1"));
        assert_eq!(options.attempts, 5);
        assert_eq!(options.backoff.kind, BackoffKind::Fixed);
        assert_eq!(options.backoff.delay, Duration::from_secs(2));
    }
}
