//! In-memory event bus for tests/dev and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, mpsc};

use thiserror::Error;
use tracing::debug;

use crate::bus::{EventBus, StartFrom, Subscription};
use crate::sequenced::Sequenced;

/// Messages retained per topic for replay when no capacity is given.
pub const DEFAULT_RETAINED_PER_TOPIC: usize = 10_000;

#[derive(Debug, Error)]
pub enum InMemoryBusError {
    /// Publish failed due to internal lock poisoning.
    #[error("in-memory bus lock poisoned")]
    Poisoned,
}

#[derive(Debug)]
struct Topic<M> {
    subscribers: Vec<mpsc::Sender<M>>,
    retained: VecDeque<M>,
}

impl<M> Default for Topic<M> {
    fn default() -> Self {
        Self {
            subscribers: Vec::new(),
            retained: VecDeque::new(),
        }
    }
}

/// In-memory pub/sub bus.
///
/// - No IO / no async
/// - Best-effort fan-out per topic
/// - Bounded retained log per topic, so subscribers can resume from a cursor
#[derive(Debug)]
pub struct InMemoryEventBus<M> {
    topics: Mutex<HashMap<String, Topic<M>>>,
    retain: usize,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_TOPIC)
    }

    /// Keep at most `retain` messages per topic for replay (0 disables replay).
    pub fn with_retention(retain: usize) -> Self {
        Self {
            topics: Mutex::new(HashMap::new()),
            retain,
        }
    }

    /// Number of messages currently retained for `topic`.
    pub fn retained(&self, topic: &str) -> usize {
        self.topics
            .lock()
            .map(|topics| topics.get(topic).map(|t| t.retained.len()).unwrap_or(0))
            .unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Sequenced + Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, topic: &str, message: M) -> Result<(), Self::Error> {
        let mut topics = self.topics.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let entry = topics.entry(topic.to_string()).or_default();

        if self.retain > 0 {
            if entry.retained.len() == self.retain {
                entry.retained.pop_front();
            }
            entry.retained.push_back(message.clone());
        }

        // Drop any dead subscribers while publishing.
        entry.subscribers.retain(|tx| tx.send(message.clone()).is_ok());

        Ok(())
    }

    fn subscribe(&self, topic: &str, start: StartFrom<M::Key>) -> Subscription<M> {
        let (tx, rx) = mpsc::channel();

        // Replay and registration happen under the same lock, so no message
        // published concurrently can fall between the two.
        if let Ok(mut topics) = self.topics.lock() {
            let entry = topics.entry(topic.to_string()).or_default();

            let replayed = match &start {
                StartFrom::Now => 0,
                StartFrom::Beginning => {
                    for m in &entry.retained {
                        let _ = tx.send(m.clone());
                    }
                    entry.retained.len()
                }
                StartFrom::After(cursor) => {
                    let mut n = 0;
                    for m in entry.retained.iter().filter(|m| cursor.is_ahead(*m)) {
                        let _ = tx.send(m.clone());
                        n += 1;
                    }
                    n
                }
            };

            if replayed > 0 {
                debug!(topic, replayed, "replayed retained messages to new subscriber");
            }

            entry.subscribers.push(tx);
        }

        Subscription::new(rx)
    }

    fn supports_replay(&self) -> bool {
        self.retain > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::SequenceCursor;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Msg {
        key: &'static str,
        seq: u64,
    }

    impl Sequenced for Msg {
        type Key = &'static str;

        fn stream_key(&self) -> Self::Key {
            self.key
        }

        fn sequence(&self) -> u64 {
            self.seq
        }
    }

    fn msg(key: &'static str, seq: u64) -> Msg {
        Msg { key, seq }
    }

    #[test]
    fn live_subscribers_receive_published_messages() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe("t", StartFrom::Now);

        bus.publish("t", msg("a", 1)).unwrap();

        assert_eq!(sub.try_recv().unwrap(), msg("a", 1));
    }

    #[test]
    fn topics_are_isolated() {
        let bus = InMemoryEventBus::new();
        let sub = bus.subscribe("t1", StartFrom::Now);

        bus.publish("t2", msg("a", 1)).unwrap();

        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn subscribe_now_skips_history() {
        let bus = InMemoryEventBus::new();
        bus.publish("t", msg("a", 1)).unwrap();

        let sub = bus.subscribe("t", StartFrom::Now);
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn resume_after_cursor_replays_only_unseen_messages() {
        let bus = InMemoryEventBus::new();
        for seq in 1..=3 {
            bus.publish("t", msg("a", seq)).unwrap();
        }
        bus.publish("t", msg("b", 1)).unwrap();

        let mut cursor = SequenceCursor::new();
        cursor.observe(&"a", 2);

        let sub = bus.subscribe("t", StartFrom::After(cursor));
        assert_eq!(sub.try_recv().unwrap(), msg("a", 3));
        assert_eq!(sub.try_recv().unwrap(), msg("b", 1));
        assert!(sub.try_recv().is_err());
    }

    #[test]
    fn retention_is_bounded() {
        let bus = InMemoryEventBus::with_retention(2);
        for seq in 1..=5 {
            bus.publish("t", msg("a", seq)).unwrap();
        }
        assert_eq!(bus.retained("t"), 2);

        let sub = bus.subscribe("t", StartFrom::Beginning);
        assert_eq!(sub.try_recv().unwrap().seq, 4);
        assert_eq!(sub.try_recv().unwrap().seq, 5);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = InMemoryEventBus::new();
        drop(bus.subscribe("t", StartFrom::Now));

        assert!(bus.publish("t", msg("a", 1)).is_ok());
    }
}
