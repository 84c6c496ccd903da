//! Consumer-side sequence tracking.
//!
//! Delivery is at-least-once and unordered across subscribers, so every
//! consumer keeps the last sequence it accepted per stream key. The same
//! cursor doubles as the resume point when subscribing to a bus that can
//! replay.

use std::collections::HashMap;
use std::hash::Hash;

use crate::sequenced::Sequenced;

/// Classification of an incoming message against the cursor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Next expected sequence for the key (or the first one seen).
    Fresh,
    /// Already seen (or older); safe to ignore.
    Duplicate,
    /// Newer than expected; messages in between were lost or are late.
    Gap { expected: u64, found: u64 },
}

impl Delivery {
    /// Whether the message should be applied by a snapshot-style consumer.
    pub fn is_applicable(self) -> bool {
        !matches!(self, Delivery::Duplicate)
    }
}

/// Last accepted sequence per stream key.
#[derive(Debug, Clone)]
pub struct SequenceCursor<K> {
    positions: HashMap<K, u64>,
}

impl<K> Default for SequenceCursor<K> {
    fn default() -> Self {
        Self {
            positions: HashMap::new(),
        }
    }
}

impl<K> SequenceCursor<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_seen(&self, key: &K) -> Option<u64> {
        self.positions.get(key).copied()
    }

    /// Classify without advancing.
    pub fn classify(&self, key: &K, sequence: u64) -> Delivery {
        match self.positions.get(key) {
            None => Delivery::Fresh,
            Some(&last) if sequence <= last => Delivery::Duplicate,
            Some(&last) if sequence == last + 1 => Delivery::Fresh,
            Some(&last) => Delivery::Gap {
                expected: last + 1,
                found: sequence,
            },
        }
    }

    /// Classify and advance past `sequence` unless it is a duplicate.
    pub fn observe(&mut self, key: &K, sequence: u64) -> Delivery {
        let delivery = self.classify(key, sequence);
        if delivery.is_applicable() {
            self.positions.insert(key.clone(), sequence);
        }
        delivery
    }

    pub fn observe_message<M>(&mut self, message: &M) -> Delivery
    where
        M: Sequenced<Key = K>,
    {
        self.observe(&message.stream_key(), message.sequence())
    }

    /// Whether a replayed message lies beyond this cursor.
    pub fn is_ahead<M>(&self, message: &M) -> bool
    where
        M: Sequenced<Key = K>,
    {
        match self.last_seen(&message.stream_key()) {
            None => true,
            Some(last) => message.sequence() > last,
        }
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn clear(&mut self) {
        self.positions.clear();
    }
}
