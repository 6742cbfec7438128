use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{IdempotencyError, IdempotencyGuard};

/// In-memory idempotency guard with expiring entries
#[derive(Default)]
pub struct InMemoryIdempotencyGuard {
    keys: DashMap<String, DateTime<Utc>>,
}

impl InMemoryIdempotencyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded keys, including expired ones
    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

#[async_trait]
impl IdempotencyGuard for InMemoryIdempotencyGuard {
    async fn check_and_record(&self, key: &str, ttl: Duration) -> Result<bool, IdempotencyError> {
        let now = Utc::now();
        let expires_at = now + chrono::Duration::from_std(ttl).unwrap_or_default();

        match self.keys.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if *occupied.get() > now {
                    return Ok(false);
                }
                occupied.insert(expires_at);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(expires_at);
                Ok(true)
            }
        }
    }

    async fn forget(&self, key: &str) -> Result<(), IdempotencyError> {
        self.keys.remove(key);
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64, IdempotencyError> {
        let now = Utc::now();
        let before = self.keys.len();
        self.keys.retain(|_, expires_at| *expires_at > now);
        Ok(before.saturating_sub(self.keys.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_check_within_ttl_is_duplicate() {
        let guard = InMemoryIdempotencyGuard::new();
        let ttl = Duration::from_secs(60);

        assert!(guard.check_and_record("k1", ttl).await.unwrap());
        assert!(!guard.check_and_record("k1", ttl).await.unwrap());
        assert!(guard.check_and_record("k2", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_key_is_fresh_again() {
        let guard = InMemoryIdempotencyGuard::new();

        assert!(guard.check_and_record("k", Duration::ZERO).await.unwrap());
        assert!(guard
            .check_and_record("k", Duration::from_secs(60))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_forget_releases_key() {
        let guard = InMemoryIdempotencyGuard::new();
        let ttl = Duration::from_secs(60);

        guard.check_and_record("k", ttl).await.unwrap();
        guard.forget("k").await.unwrap();
        assert!(guard.check_and_record("k", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let guard = InMemoryIdempotencyGuard::new();
        guard.check_and_record("old", Duration::ZERO).await.unwrap();
        guard
            .check_and_record("live", Duration::from_secs(60))
            .await
            .unwrap();

        assert_eq!(guard.purge_expired().await.unwrap(), 1);
        assert_eq!(guard.key_count(), 1);
        assert!(!guard
            .check_and_record("live", Duration::from_secs(60))
            .await
            .unwrap());
    }
}
