//! Event publishing/subscription abstraction (mechanics only).
//!
//! This module provides the **event bus pattern** - a topic-based pub/sub
//! mechanism for distributing inventory-change notifications to downstream
//! consumers (aggregate views, caches, other services).
//!
//! ## Design Philosophy
//!
//! The event bus is intentionally **narrow** and makes minimal assumptions:
//!
//! - **Transport-agnostic**: in-memory channels, Redis pub/sub, a log-based broker
//! - **At-least-once delivery**: messages may be delivered more than once
//! - **No cross-key ordering**: only the per-key sequence carried by each
//!   message orders events; the transport promises nothing
//! - **Fire-and-forget publish**: producers never wait for subscriber acknowledgement
//!
//! Consumers must be idempotent. [`crate::SequenceCursor`] gives them the
//! bookkeeping for that.

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use crate::cursor::SequenceCursor;
use crate::sequenced::Sequenced;

/// Where a new subscription starts reading.
#[derive(Debug, Clone)]
pub enum StartFrom<K> {
    /// Only messages published after subscribing.
    Now,
    /// Everything the transport still retains, then live messages.
    Beginning,
    /// Retained messages whose sequence lies beyond the cursor, then live messages.
    After(SequenceCursor<K>),
}

impl<K> StartFrom<K> {
    pub fn is_replay(&self) -> bool {
        !matches!(self, StartFrom::Now)
    }
}

/// A subscription to a topic.
///
/// A subscription is a lazy, potentially infinite sequence of messages. It
/// ends only when the bus (or the transport thread feeding it) goes away.
///
/// ## Usage Pattern
///
/// ```ignore
/// let subscription = bus.subscribe("inventory_events", StartFrom::Now);
///
/// loop {
///     match subscription.recv_timeout(Duration::from_secs(1)) {
///         Ok(event) => view.apply(&event),
///         Err(RecvTimeoutError::Timeout) => continue,  // Check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,  // Bus closed
///     }
/// }
/// ```
///
/// Subscriptions are designed for single-threaded consumption.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, std::sync::mpsc::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, std::sync::mpsc::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, std::sync::mpsc::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

impl<M> Iterator for Subscription<M> {
    type Item = M;

    fn next(&mut self) -> Option<M> {
        self.receiver.recv().ok()
    }
}

/// Topic-based, transport-agnostic event bus.
///
/// ## Delivery Guarantees
///
/// The bus provides **at-least-once delivery** at best:
/// - Messages may be delivered multiple times (retries, replays)
/// - Messages may be delivered out of order across keys
/// - Transports without durability (Redis pub/sub) may drop messages for
///   subscribers that are offline; the consumer sees this as a sequence gap
///
/// ## Replay
///
/// Transports that retain messages report [`EventBus::supports_replay`] and
/// honour [`StartFrom::Beginning`] / [`StartFrom::After`]. Others downgrade
/// every subscription to [`StartFrom::Now`].
///
/// ## Error Handling
///
/// `publish()` can fail (network error, closed channel). The producer decides
/// what a failure means; the reservation engine records it as a delivery gap
/// and never rolls back the committed inventory write.
pub trait EventBus<M>: Send + Sync
where
    M: Sequenced,
{
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self, topic: &str, start: StartFrom<M::Key>) -> Subscription<M>;

    fn supports_replay(&self) -> bool {
        false
    }
}

impl<M, B> EventBus<M> for Arc<B>
where
    M: Sequenced,
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        (**self).publish(topic, message)
    }

    fn subscribe(&self, topic: &str, start: StartFrom<M::Key>) -> Subscription<M> {
        (**self).subscribe(topic, start)
    }

    fn supports_replay(&self) -> bool {
        (**self).supports_replay()
    }
}
