//! Reliability patterns for job processing
//!
//! This module provides:
//! - [`Backoff`] - Fixed or exponential retry delays
//! - [`RateLimiter`] - Per-queue start rate limiting

mod rate_limit;
mod retry;

pub use rate_limit::{RateLimiter, RateLimiterConfig};
pub use retry::{Backoff, BackoffKind};

pub(crate) use retry::duration_millis;
