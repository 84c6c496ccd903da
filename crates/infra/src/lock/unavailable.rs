use std::time::Duration;

use super::{LockError, LockManager, LockToken, ReleaseOutcome};

/// A lock service that never grants a lease.
///
/// Stands in for a lock backend that is down; useful to exercise the engine's
/// `BestEffort` path, where writes must still be correct without any lock.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableLockManager;

impl LockManager for UnavailableLockManager {
    fn try_acquire(&self, _key: &str, _ttl: Duration) -> Result<Option<LockToken>, LockError> {
        Ok(None)
    }

    fn release(&self, _token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        Ok(ReleaseOutcome::AlreadyReleased)
    }

    fn extend(&self, token: &LockToken, _ttl: Duration) -> Result<LockToken, LockError> {
        Err(LockError::Expired {
            key: token.key().to_string(),
        })
    }
}
