//! Infrastructure event bus implementations.
//!
//! The bus abstraction and the in-memory transport live in `stockguard-events`.
//! This module adds network-backed transports.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubEventBus};
