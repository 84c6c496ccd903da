//! Redis-backed lease lock (optional).
//!
//! Acquire is `SET key token NX PX ttl`. Release and extend run as Lua scripts
//! so the ownership check and the write happen atomically on the server.

use std::time::Duration;

use tracing::debug;

use super::{LockError, LockManager, LockToken, ReleaseOutcome};

const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("PEXPIRE", KEYS[1], ARGV[2])
else
    return 0
end
"#;

#[derive(Debug, Clone)]
pub struct RedisLockManager {
    client: redis::Client,
}

impl RedisLockManager {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, LockError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(backend)?;
        Ok(Self { client })
    }

    pub fn from_client(client: redis::Client) -> Self {
        Self { client }
    }

    fn connection(&self) -> Result<redis::Connection, LockError> {
        self.client.get_connection().map_err(backend)
    }
}

impl LockManager for RedisLockManager {
    fn try_acquire(&self, key: &str, ttl: Duration) -> Result<Option<LockToken>, LockError> {
        let token = LockToken::issue(key, ttl);
        let mut conn = self.connection()?;

        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token.token().to_string())
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query(&mut conn)
            .map_err(backend)?;

        Ok(reply.map(|_| token))
    }

    fn release(&self, token: &LockToken) -> Result<ReleaseOutcome, LockError> {
        let mut conn = self.connection()?;

        let removed: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(token.key())
            .arg(token.token().to_string())
            .invoke(&mut conn)
            .map_err(backend)?;

        if removed == 1 {
            Ok(ReleaseOutcome::Released)
        } else {
            debug!(key = token.key(), "release ignored, lease not owned by token");
            Ok(ReleaseOutcome::AlreadyReleased)
        }
    }

    fn extend(&self, token: &LockToken, ttl: Duration) -> Result<LockToken, LockError> {
        let mut conn = self.connection()?;

        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(token.key())
            .arg(token.token().to_string())
            .arg(ttl_millis(ttl))
            .invoke(&mut conn)
            .map_err(backend)?;

        if extended == 1 {
            Ok(token.renewed(ttl))
        } else {
            Err(LockError::Expired {
                key: token.key().to_string(),
            })
        }
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    crate::config::millis(ttl).max(1)
}

fn backend(e: redis::RedisError) -> LockError {
    LockError::Backend(e.to_string())
}
