//! Distributed mutual exclusion per stock key.
//!
//! A lock is a lease: it carries a random holder token and a TTL, and only the
//! holder of the token can release or extend it. Once the TTL lapses anyone may
//! take it, so callers must never treat the lock as their only guard; the
//! inventory version check is what keeps writes correct.

mod backoff;
mod in_memory;
#[cfg(feature = "redis")]
mod redis_lease;
mod unavailable;

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

pub use backoff::LockBackoff;
pub use in_memory::InMemoryLockManager;
#[cfg(feature = "redis")]
pub use redis_lease::RedisLockManager;
pub use unavailable::UnavailableLockManager;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// Nobody released the lock within the wait budget.
    #[error("timed out after {waited:?} waiting for lock {key}")]
    Timeout { key: String, waited: Duration },

    /// The lease lapsed or passed to another holder.
    #[error("lock {key} expired or is held by another owner")]
    Expired { key: String },

    /// The lock service could not be reached.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// Result of a release call. Releasing is idempotent and never fails on a
/// lease that is no longer ours.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    AlreadyReleased,
}

/// Proof of holding a lease.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    key: String,
    token: Uuid,
    acquired_at: Instant,
    ttl: Duration,
}

impl LockToken {
    pub(crate) fn issue(key: &str, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            token: Uuid::now_v7(),
            acquired_at: Instant::now(),
            ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> Uuid {
        self.token
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Local estimate: the lease may already be gone server-side when this
    /// says false, never the other way round.
    pub fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.ttl
    }

    pub(crate) fn renewed(&self, ttl: Duration) -> Self {
        Self {
            acquired_at: Instant::now(),
            ttl,
            ..self.clone()
        }
    }
}

/// Lease-based lock service.
///
/// Implementations provide a single non-blocking attempt; [`LockManager::acquire`]
/// layers the bounded wait with backoff on top.
pub trait LockManager: Send + Sync {
    /// One attempt. `Ok(None)` means someone else holds the lease.
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError>;

    /// Drop the lease if `token` still owns it.
    fn release(&self, token: &LockToken) -> Result<ReleaseOutcome, LockError>;

    /// Push the lease out to `ttl` from now, only for the current owner.
    fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, LockError>;

    /// Retry `try_acquire` with backoff until it succeeds or `wait` runs out.
    ///
    /// A zero `wait` makes exactly one attempt. Backend errors are retried
    /// like contention; if the last attempt failed on the backend, that error
    /// is returned instead of a timeout.
    fn acquire(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
        backoff: &LockBackoff,
    ) -> Result<LockToken, LockError> {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let last_error = match self.try_acquire(key, ttl) {
                Ok(Some(token)) => {
                    if attempt > 0 {
                        debug!(key, attempt, waited_ms = crate::config::millis(started.elapsed()), "lock acquired after contention");
                    }
                    return Ok(token);
                }
                Ok(None) => None,
                Err(e) => {
                    warn!(key, attempt, error = %e, "lock attempt failed");
                    Some(e)
                }
            };

            let waited = started.elapsed();
            if waited >= wait {
                return Err(last_error.unwrap_or_else(|| LockError::Timeout {
                    key: key.to_string(),
                    waited,
                }));
            }

            thread::sleep(backoff.delay_for_attempt(attempt).min(wait - waited));
            attempt = attempt.saturating_add(1);
        }
    }
}

impl<L> LockManager for std::sync::Arc<L>
where
    L: LockManager + ?Sized,
{
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        (**self).try_acquire(key, ttl)
    }

    fn release(&self, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        (**self).release(token)
    }

    fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, LockError> {
        (**self).extend(token, ttl)
    }
}
