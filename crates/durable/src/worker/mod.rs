//! Queue consumers
//!
//! This module provides:
//! - [`QueueWorker`] - Bounded-concurrency consumer for one queue
//! - [`QueueRuntime`] - One worker per registered handler
//! - [`JobPoller`] - Job claiming with exponential idle backoff
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       QueueWorker                            │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────┐  │
//! │  │  JobPoller  │  │  Heartbeat  │  │  Stalled Reclaimer  │  │
//! │  │ (+ limiter) │  │   (5s)      │  │  (stalled_interval) │  │
//! │  └──────┬──────┘  └─────────────┘  └─────────────────────┘  │
//! │         │                                                    │
//! │         ▼                                                    │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │         Job Executor (Semaphore-limited)            │    │
//! │  │  [Job 1] [Job 2] ... [Job N]  + lock extension      │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

mod poller;
mod pool;
mod runtime;

pub use poller::{JobPoller, PollerConfig};
pub use pool::{QueueWorker, WorkerError, WorkerStatus};
pub use runtime::QueueRuntime;
