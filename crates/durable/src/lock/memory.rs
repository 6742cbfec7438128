//! In-memory lock manager (for testing and single-process deployments)

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::manager::{validate_key, LockError, LockLease, LockManager};

/// In-memory lock manager
///
/// Expired locks stay in the map until the next acquire on the same key
/// replaces them.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: DashMap<String, LockLease>,
}

impl InMemoryLockManager {
    /// Create a new in-memory lock manager
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries, including expired ones
    pub fn entry_count(&self) -> usize {
        self.locks.len()
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockLease>, LockError> {
        validate_key(key)?;
        let now = Utc::now();

        match self.locks.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(None);
                }
                let lease = LockLease::new(key, ttl);
                occupied.insert(lease.clone());
                Ok(Some(lease))
            }
            Entry::Vacant(vacant) => {
                let lease = LockLease::new(key, ttl);
                vacant.insert(lease.clone());
                Ok(Some(lease))
            }
        }
    }

    async fn release(&self, lease: &LockLease) -> Result<bool, LockError> {
        let removed = self
            .locks
            .remove_if(&lease.key, |_, held| held.token == lease.token);
        Ok(removed.is_some())
    }

    async fn extend(&self, lease: &LockLease, ttl: Duration) -> Result<bool, LockError> {
        let now = Utc::now();
        let Some(mut held) = self.locks.get_mut(&lease.key) else {
            return Ok(false);
        };

        if held.token != lease.token || held.expires_at <= now {
            return Ok(false);
        }

        held.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();
        Ok(true)
    }

    async fn is_locked(&self, key: &str) -> Result<bool, LockError> {
        let now = Utc::now();
        Ok(self
            .locks
            .get(key)
            .is_some_and(|held| held.expires_at > now))
    }
}
