//! Fixed-window rate limiting for latency-sensitive queues

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::retry::duration_millis;

/// At most `max` jobs are started per `duration` window
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Jobs allowed per window
    pub max: u32,

    /// Window length
    #[serde(rename = "duration_ms", with = "duration_millis")]
    pub duration: Duration,
}

impl RateLimiterConfig {
    pub fn new(max: u32, duration: Duration) -> Self {
        Self {
            max: max.max(1),
            duration,
        }
    }
}

/// Window counter owned by a single poll loop
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    window_start: Instant,
    used: u32,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            window_start: Instant::now(),
            used: 0,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= self.config.duration {
            self.window_start = now;
            self.used = 0;
        }
    }

    /// Slots left in the current window
    pub fn available(&mut self, now: Instant) -> usize {
        self.roll(now);
        self.config.max.saturating_sub(self.used) as usize
    }

    /// Consume `n` slots (callers claim at most `available()`)
    pub fn consume(&mut self, now: Instant, n: usize) {
        self.roll(now);
        self.used = self.used.saturating_add(n as u32).min(self.config.max);
    }

    /// Time until the current window resets
    pub fn time_until_reset(&self, now: Instant) -> Duration {
        self.config
            .duration
            .saturating_sub(now.duration_since(self.window_start))
    }
}
