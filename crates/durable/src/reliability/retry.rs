//! Backoff policy for job retries

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Same delay before every retry
    Fixed,

    /// `delay * 2^(attempts_made - 1)`, capped at `max_delay`
    Exponential,
}

/// Retry delay configuration for a job
///
/// # Example
///
/// ```
/// use conveyor_durable::Backoff;
/// use std::time::Duration;
///
/// let backoff = Backoff::exponential(Duration::from_secs(1))
///     .with_max_delay(Duration::from_secs(60));
///
/// // First retry after 1 second
/// // Second retry after 2 seconds
/// // Third retry after 4 seconds
/// assert_eq!(backoff.delay_for(3), Duration::from_secs(4));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Backoff {
    /// Growth strategy
    #[serde(rename = "type")]
    pub kind: BackoffKind,

    /// Base delay
    #[serde(rename = "delayMs", alias = "delay_ms", with = "duration_millis")]
    pub delay: Duration,

    /// Upper bound for exponential growth
    #[serde(
        rename = "maxDelayMs",
        alias = "max_delay_ms",
        with = "duration_millis",
        default = "default_max_delay"
    )]
    pub max_delay: Duration,

    /// Jitter factor (0.0-1.0)
    ///
    /// A value of 0.1 means ±10% randomness. Defaults to none.
    #[serde(default)]
    pub jitter: f64,
}

fn default_max_delay() -> Duration {
    Duration::from_secs(3600)
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(Duration::from_secs(1))
    }
}

impl Backoff {
    /// Exponential backoff starting at `delay`
    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
            max_delay: default_max_delay(),
            jitter: 0.0,
        }
    }

    /// Constant delay between attempts
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
            max_delay: delay,
            jitter: 0.0,
        }
    }

    /// Retry immediately (tests, draining)
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Set the maximum delay
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the jitter factor (0.0-1.0)
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the next attempt, given the number of failed attempts so far
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        if attempts_made == 0 {
            return Duration::ZERO;
        }

        let base = match self.kind {
            BackoffKind::Fixed => self.delay.as_secs_f64(),
            BackoffKind::Exponential => {
                let exponent = (attempts_made - 1).min(62) as i32;
                (self.delay.as_secs_f64() * 2f64.powi(exponent))
                    .min(self.max_delay.as_secs_f64())
            }
        };

        let jittered = if self.jitter > 0.0 && base > 0.0 {
            let mut rng = rand::thread_rng();
            let jitter_range = base * self.jitter;
            let jitter_offset = rng.gen_range(-jitter_range..jitter_range);
            (base + jitter_offset).max(0.0)
        } else {
            base
        };

        Duration::from_secs_f64(jittered)
    }
}

/// Serde support for Duration as milliseconds
pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
