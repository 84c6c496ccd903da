//! Redis pub/sub-backed event bus (optional).
//!
//! Pub/sub is not durable: subscribers that are offline miss messages and
//! see the hole as a sequence gap. There is no replay, so every subscription
//! starts from now regardless of the requested start point.

use std::marker::PhantomData;
use std::sync::mpsc;
use std::thread;

use redis::Commands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use stockguard_events::{EventBus, Sequenced, StartFrom, Subscription};

#[derive(Debug, Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),

    #[error("serialization error: {0}")]
    Serialize(String),
}

/// Redis pub/sub bus for JSON-encoded messages; topics map to channels.
pub struct RedisPubSubEventBus<M> {
    client: redis::Client,
    _message: PhantomData<fn() -> M>,
}

impl<M> core::fmt::Debug for RedisPubSubEventBus<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RedisPubSubEventBus").finish_non_exhaustive()
    }
}

impl<M> Clone for RedisPubSubEventBus<M> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            _message: PhantomData,
        }
    }
}

impl<M> RedisPubSubEventBus<M> {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;
        Ok(Self {
            client,
            _message: PhantomData,
        })
    }
}

impl<M> EventBus<M> for RedisPubSubEventBus<M>
where
    M: Sequenced + Serialize + DeserializeOwned + Send + 'static,
{
    type Error = RedisBusError;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        let payload =
            serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;

        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let receivers: i64 = conn
            .publish(topic, payload)
            .map_err(|e| RedisBusError::Redis(e.to_string()))?;

        debug!(topic, receivers, "published to redis channel");
        Ok(())
    }

    fn subscribe(&self, topic: &str, start: StartFrom<M::Key>) -> Subscription<M> {
        if start.is_replay() {
            warn!(topic, "redis pub/sub cannot replay; subscribing from now");
        }

        let (tx, rx) = mpsc::channel();
        let client = self.client.clone();
        let channel = topic.to_string();

        // Forwards pub/sub messages until the receiver is dropped or the
        // connection fails; either way the subscription then disconnects.
        thread::spawn(move || {
            let mut conn = match client.get_connection() {
                Ok(c) => c,
                Err(e) => {
                    warn!(channel, error = %e, "redis subscribe connection failed");
                    return;
                }
            };

            let mut pubsub = conn.as_pubsub();
            if let Err(e) = pubsub.subscribe(&channel) {
                warn!(channel, error = %e, "redis subscribe failed");
                return;
            }

            loop {
                let msg = match pubsub.get_message() {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(channel, error = %e, "redis pub/sub connection lost");
                        return;
                    }
                };

                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(_) => continue,
                };

                let message: M = match serde_json::from_str(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        warn!(channel, error = %e, "skipping undecodable message");
                        continue;
                    }
                };

                if tx.send(message).is_err() {
                    return;
                }
            }
        });

        Subscription::new(rx)
    }
}
