//! Distributed lock manager
//!
//! This module provides:
//! - [`LockManager`] trait with token-checked release
//! - [`InMemoryLockManager`] and [`PostgresLockManager`] backends
//! - [`HeldLock`] guard that heartbeats the TTL while work is in flight

mod guard;
mod manager;
mod memory;
mod postgres;

pub use guard::HeldLock;
pub use manager::{instance_lock_key, LockError, LockLease, LockManager};
pub use memory::InMemoryLockManager;
pub use postgres::PostgresLockManager;
