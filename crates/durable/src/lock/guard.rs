//! Held lock with TTL heartbeat

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::manager::{LockError, LockLease, LockManager};

const MIN_HEARTBEAT: Duration = Duration::from_millis(10);

/// A lock held for the duration of a unit of work
///
/// While held, a background task extends the TTL every `ttl / 3` so a long
/// step cannot outlive the lock. Call [`HeldLock::release`] on every exit
/// path; dropping without releasing schedules a best-effort release on the
/// current runtime.
///
/// Before committing work done under the lock, call [`HeldLock::confirm`]:
/// the heartbeat only notices a lapsed lease on its next tick.
pub struct HeldLock {
    manager: Arc<dyn LockManager>,
    lease: LockLease,
    ttl: Duration,
    lost: Arc<AtomicBool>,
    heartbeat: Option<JoinHandle<()>>,
    released: bool,
}

impl HeldLock {
    /// Try to acquire `key`; `None` on contention
    pub async fn acquire(
        manager: Arc<dyn LockManager>,
        key: &str,
        ttl: Duration,
    ) -> Result<Option<Self>, LockError> {
        let Some(lease) = manager.acquire(key, ttl).await? else {
            return Ok(None);
        };

        let lost = Arc::new(AtomicBool::new(false));
        let heartbeat = tokio::spawn(heartbeat_loop(
            Arc::clone(&manager),
            lease.clone(),
            ttl,
            Arc::clone(&lost),
        ));

        Ok(Some(Self {
            manager,
            lease,
            ttl,
            lost,
            heartbeat: Some(heartbeat),
            released: false,
        }))
    }

    pub fn lease(&self) -> &LockLease {
        &self.lease
    }

    /// Whether a heartbeat found the lock taken over or lapsed
    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    /// Check with the lock manager that the lease is still ours
    ///
    /// Extends the TTL as a side effect. A lease found expired or taken over
    /// marks the lock lost for good.
    pub async fn confirm(&self) -> Result<bool, LockError> {
        if self.is_lost() {
            return Ok(false);
        }
        if self.manager.extend(&self.lease, self.ttl).await? {
            return Ok(true);
        }
        self.lost.store(true, Ordering::SeqCst);
        warn!(key = %self.lease.key, "lock no longer held");
        Ok(false)
    }

    /// Stop the heartbeat and release the lock
    pub async fn release(mut self) -> Result<(), LockError> {
        self.stop_heartbeat();
        self.released = true;

        if !self.manager.release(&self.lease).await? {
            warn!(key = %self.lease.key, "lock expired or was taken over before release");
        }
        Ok(())
    }

    fn stop_heartbeat(&mut self) {
        if let Some(handle) = self.heartbeat.take() {
            handle.abort();
        }
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        self.stop_heartbeat();
        if self.released {
            return;
        }

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(key = %self.lease.key, "lock dropped outside a runtime; left to expire");
            return;
        };

        let manager = Arc::clone(&self.manager);
        let lease = self.lease.clone();
        runtime.spawn(async move {
            if let Err(e) = manager.release(&lease).await {
                warn!(key = %lease.key, "release on drop failed: {}", e);
            }
        });
    }
}

async fn heartbeat_loop(
    manager: Arc<dyn LockManager>,
    lease: LockLease,
    ttl: Duration,
    lost: Arc<AtomicBool>,
) {
    let period = (ttl / 3).max(MIN_HEARTBEAT);
    let mut extended_at = Instant::now();
    loop {
        tokio::time::sleep(period).await;
        match manager.extend(&lease, ttl).await {
            Ok(true) => {
                extended_at = Instant::now();
                debug!(key = %lease.key, "extended lock");
            }
            Ok(false) => {
                lost.store(true, Ordering::SeqCst);
                warn!(key = %lease.key, "lock lost during heartbeat");
                break;
            }
            // Failed extensions cannot keep the lease alive past its TTL
            Err(e) if extended_at.elapsed() >= ttl => {
                lost.store(true, Ordering::SeqCst);
                warn!(key = %lease.key, "lock lapsed after failed heartbeats: {}", e);
                break;
            }
            Err(e) => warn!(key = %lease.key, "lock heartbeat failed: {}", e),
        }
    }
}
