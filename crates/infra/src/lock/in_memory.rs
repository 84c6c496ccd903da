use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;
use uuid::Uuid;

use super::{LockError, LockManager, LockToken, ReleaseOutcome};

#[derive(Debug, Clone, Copy)]
struct Lease {
    token: Uuid,
    expires_at: Instant,
}

impl Lease {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local lock service with real lease semantics.
///
/// Good for tests and single-process deployments. Leases expire on their own
/// and a lapsed lease is simply taken over by the next caller.
#[derive(Debug, Default)]
pub struct InMemoryLockManager {
    leases: Mutex<HashMap<String, Lease>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token currently holding a live lease on `key`, if any.
    pub fn holder(&self, key: &str) -> Option<Uuid> {
        let leases = self.leases.lock().ok()?;
        leases
            .get(key)
            .filter(|l| l.is_live(Instant::now()))
            .map(|l| l.token)
    }

    fn leases(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Lease>>, LockError> {
        self.leases
            .lock()
            .map_err(|_| LockError::Backend("in-memory lock table poisoned".to_string()))
    }
}

impl LockManager for InMemoryLockManager {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let now = Instant::now();
        let mut leases = self.leases()?;

        if leases.get(key).is_some_and(|l| l.is_live(now)) {
            return Ok(None);
        }

        let token = LockToken::issue(key, ttl);
        leases.insert(
            key.to_string(),
            Lease {
                token: token.token(),
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    fn release(&self, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        let mut leases = self.leases()?;

        match leases.get(token.key()) {
            Some(lease) if lease.token == token.token() => {
                leases.remove(token.key());
                Ok(ReleaseOutcome::Released)
            }
            _ => {
                debug!(key = token.key(), "release ignored, lease not owned by token");
                Ok(ReleaseOutcome::AlreadyReleased)
            }
        }
    }

    fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, LockError> {
        let now = Instant::now();
        let mut leases = self.leases()?;

        match leases.get_mut(token.key()) {
            Some(lease) if lease.token == token.token() && lease.is_live(now) => {
                lease.expires_at = now + ttl;
                Ok(token.renewed(ttl))
            }
            _ => Err(LockError::Expired {
                key: token.key().to_string(),
            }),
        }
    }
}
