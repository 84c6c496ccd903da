use std::time::Duration;

use rand::Rng;

/// Exponential backoff with random jitter for lock contention.
///
/// Attempt 0 waits `base`, each later attempt doubles, capped at `cap`. The
/// result is then moved by up to `jitter * delay` in either direction so that
/// contenders woken by the same release do not retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LockBackoff {
    pub base: Duration,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for LockBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(20),
            cap: Duration::from_millis(500),
            jitter: 0.2,
        }
    }
}

impl LockBackoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
        }
    }

    /// Delay before attempt `attempt + 1`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as f64;
        let cap_ms = self.cap.as_millis() as f64;

        let exp = 2_f64.powi(attempt.min(30) as i32);
        let delay_ms = (base_ms * exp).min(cap_ms);

        let spread = delay_ms * self.jitter;
        let offset = if spread > 0.0 {
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };

        Duration::from_millis((delay_ms + offset).max(0.0) as u64)
    }
}
