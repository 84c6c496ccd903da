//! Engine configuration.
//!
//! Every knob has a default that works for a single-process deployment.
//! `EngineConfig::from_env` overlays `STOCKGUARD_*` variables on top of the
//! defaults; durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Topic inventory events are published on unless configured otherwise.
pub const DEFAULT_TOPIC: &str = "inventory_events";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    InvalidVar { var: String, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the engine treats the distributed lock.
///
/// The lock only narrows the contention window; correctness rests on the
/// version check, so running without it stays safe.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockPolicy {
    /// Fail with `LOCK_UNAVAILABLE` when the lock cannot be taken in time.
    #[default]
    Required,
    /// Try the lock, fall back to version-check-only when it is unavailable.
    BestEffort,
    /// Never touch the lock service.
    Disabled,
}

impl FromStr for LockPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "required" => Ok(LockPolicy::Required),
            "best_effort" | "besteffort" => Ok(LockPolicy::BestEffort),
            "disabled" | "off" => Ok(LockPolicy::Disabled),
            other => Err(ConfigError::InvalidVar {
                var: "STOCKGUARD_LOCK_POLICY".to_string(),
                reason: format!("unknown policy '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(with = "duration_ms")]
    pub lock_ttl: Duration,
    #[serde(with = "duration_ms")]
    pub lock_wait: Duration,
    #[serde(with = "duration_ms")]
    pub lock_backoff_base: Duration,
    #[serde(with = "duration_ms")]
    pub lock_backoff_cap: Duration,
    /// Fraction of each backoff delay randomized either way (0.0..=1.0).
    pub lock_backoff_jitter: f64,
    pub lock_policy: LockPolicy,
    #[serde(with = "duration_ms")]
    pub reservation_ttl: Duration,
    /// Version-conflict retries after the first attempt.
    pub max_conflict_retries: u32,
    #[serde(with = "duration_ms")]
    pub reaper_poll_interval: Duration,
    pub reaper_batch_size: usize,
    pub topic: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(2),
            lock_backoff_base: Duration::from_millis(20),
            lock_backoff_cap: Duration::from_millis(500),
            lock_backoff_jitter: 0.2,
            lock_policy: LockPolicy::Required,
            reservation_ttl: Duration::from_secs(15 * 60),
            max_conflict_retries: 3,
            reaper_poll_interval: Duration::from_secs(5),
            reaper_batch_size: 100,
            topic: DEFAULT_TOPIC.to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with whatever `STOCKGUARD_*` variables are set.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Same as [`EngineConfig::from_env`] but reading from any source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = read_ms(&lookup, "STOCKGUARD_LOCK_TTL_MS")? {
            cfg.lock_ttl = v;
        }
        if let Some(v) = read_ms(&lookup, "STOCKGUARD_LOCK_WAIT_MS")? {
            cfg.lock_wait = v;
        }
        if let Some(v) = read_ms(&lookup, "STOCKGUARD_LOCK_BACKOFF_BASE_MS")? {
            cfg.lock_backoff_base = v;
        }
        if let Some(v) = read_ms(&lookup, "STOCKGUARD_LOCK_BACKOFF_CAP_MS")? {
            cfg.lock_backoff_cap = v;
        }
        if let Some(v) = read_parsed(&lookup, "STOCKGUARD_LOCK_BACKOFF_JITTER")? {
            cfg.lock_backoff_jitter = v;
        }
        if let Some(raw) = lookup("STOCKGUARD_LOCK_POLICY") {
            cfg.lock_policy = raw.parse()?;
        }
        if let Some(v) = read_ms(&lookup, "STOCKGUARD_RESERVATION_TTL_MS")? {
            cfg.reservation_ttl = v;
        }
        if let Some(v) = read_parsed(&lookup, "STOCKGUARD_MAX_CONFLICT_RETRIES")? {
            cfg.max_conflict_retries = v;
        }
        if let Some(v) = read_ms(&lookup, "STOCKGUARD_REAPER_POLL_INTERVAL_MS")? {
            cfg.reaper_poll_interval = v;
        }
        if let Some(v) = read_parsed(&lookup, "STOCKGUARD_REAPER_BATCH_SIZE")? {
            cfg.reaper_batch_size = v;
        }
        if let Some(v) = lookup("STOCKGUARD_TOPIC") {
            cfg.topic = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("lock_ttl", self.lock_ttl),
            ("lock_backoff_base", self.lock_backoff_base),
            ("reservation_ttl", self.reservation_ttl),
            ("reaper_poll_interval", self.reaper_poll_interval),
        ];
        for (name, value) in positive {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be positive")));
            }
        }
        if self.lock_backoff_cap < self.lock_backoff_base {
            return Err(ConfigError::Invalid(
                "lock_backoff_cap must be >= lock_backoff_base".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.lock_backoff_jitter) {
            return Err(ConfigError::Invalid(
                "lock_backoff_jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        if self.reaper_batch_size == 0 {
            return Err(ConfigError::Invalid("reaper_batch_size must be positive".to_string()));
        }
        if self.topic.trim().is_empty() {
            return Err(ConfigError::Invalid("topic cannot be empty".to_string()));
        }
        Ok(())
    }
}

fn read_parsed<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: core::fmt::Display,
{
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidVar {
                var: var.to_string(),
                reason: e.to_string(),
            }),
    }
}

fn read_ms<F>(lookup: &F, var: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(read_parsed::<F, u64>(lookup, var)?.map(Duration::from_millis))
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub(crate) fn millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(super::millis(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
