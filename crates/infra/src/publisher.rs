//! Post-commit event publication.
//!
//! Publishing happens after the write is durable and is never rolled back.
//! A failed publish becomes a [`DeliveryGap`]: it is logged, handed to a
//! [`DeliveryGapSink`], and the originating operation still succeeds.
//! Consumers notice the hole through the per-key sequence.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, error};

use stockguard_events::{EventBus, EventEnvelope};
use stockguard_inventory::InventoryEvent;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("publish to {topic} failed: {reason}")]
pub struct PublishError {
    pub topic: String,
    pub reason: String,
}

/// An event that was committed but never reached the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryGap {
    pub topic: String,
    pub event: InventoryEvent,
    pub reason: String,
    pub detected_at: DateTime<Utc>,
}

/// Receives delivery gaps for later redelivery or alerting.
pub trait DeliveryGapSink: Send + Sync {
    fn record(&self, gap: DeliveryGap);
}

/// Drops gaps after they have been logged.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogOnlyGapSink;

impl DeliveryGapSink for LogOnlyGapSink {
    fn record(&self, _gap: DeliveryGap) {}
}

/// Keeps gaps in memory until someone drains them.
#[derive(Debug, Default)]
pub struct InMemoryGapRecorder {
    gaps: Mutex<Vec<DeliveryGap>>,
}

impl InMemoryGapRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.gaps.lock().map(|g| g.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<DeliveryGap> {
        self.gaps.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn drain(&self) -> Vec<DeliveryGap> {
        self.gaps
            .lock()
            .map(|mut g| std::mem::take(&mut *g))
            .unwrap_or_default()
    }
}

impl DeliveryGapSink for InMemoryGapRecorder {
    fn record(&self, gap: DeliveryGap) {
        if let Ok(mut gaps) = self.gaps.lock() {
            gaps.push(gap);
        }
    }
}

impl<S: DeliveryGapSink + ?Sized> DeliveryGapSink for Arc<S> {
    fn record(&self, gap: DeliveryGap) {
        (**self).record(gap)
    }
}

/// Wraps inventory events in envelopes and pushes them to one topic.
pub struct EventPublisher<B> {
    bus: B,
    topic: String,
    gaps: Arc<dyn DeliveryGapSink>,
}

impl<B> core::fmt::Debug for EventPublisher<B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("topic", &self.topic)
            .finish_non_exhaustive()
    }
}

impl<B> EventPublisher<B>
where
    B: EventBus<EventEnvelope<InventoryEvent>>,
{
    pub fn new(bus: B, topic: impl Into<String>, gaps: Arc<dyn DeliveryGapSink>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            gaps,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Publish once; on failure log and record the gap.
    pub fn publish(&self, event: InventoryEvent) -> Result<(), PublishError> {
        match self.send(event.clone()) {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(
                    topic = %self.topic,
                    event_type = event.event_type.as_str(),
                    key = %event.key(),
                    sequence = event.sequence,
                    reason = %err.reason,
                    "event publish failed; consumers will see a sequence gap"
                );
                self.gaps.record(DeliveryGap {
                    topic: self.topic.clone(),
                    event,
                    reason: err.reason.clone(),
                    detected_at: Utc::now(),
                });
                Err(err)
            }
        }
    }

    /// Publish without recording a new gap; used when replaying an old one.
    pub fn send(&self, event: InventoryEvent) -> Result<(), PublishError> {
        let event_type = event.event_type.as_str();
        let sequence = event.sequence;

        self.bus
            .publish(&self.topic, EventEnvelope::wrap(event))
            .map_err(|e| PublishError {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?;

        debug!(topic = %self.topic, event_type, sequence, "event published");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockguard_core::{ProductId, StoreId};
    use stockguard_events::{InMemoryEventBus, StartFrom, Sequenced, Subscription};
    use stockguard_inventory::{InventoryEventType, InventoryRecord, StockKey};

    struct DownBus;

    impl EventBus<EventEnvelope<InventoryEvent>> for DownBus {
        type Error = String;

        fn publish(&self, _topic: &str, _message: EventEnvelope<InventoryEvent>) -> Result<(), String> {
            Err("connection refused".to_string())
        }

        fn subscribe(
            &self,
            _topic: &str,
            _start: StartFrom<StockKey>,
        ) -> Subscription<EventEnvelope<InventoryEvent>> {
            let (_tx, rx) = std::sync::mpsc::channel();
            Subscription::new(rx)
        }
    }

    fn event() -> InventoryEvent {
        let rec = InventoryRecord::new(StockKey::new(StoreId::new(), ProductId::new()), 3, Utc::now());
        InventoryEvent::committed(InventoryEventType::StockUpdated, &rec, 3, None)
    }

    #[test]
    fn failed_publish_is_recorded_as_a_gap() {
        let gaps = Arc::new(InMemoryGapRecorder::new());
        let publisher = EventPublisher::new(DownBus, "inventory_events", gaps.clone());

        let ev = event();
        let err = publisher.publish(ev.clone()).unwrap_err();

        assert_eq!(err.topic, "inventory_events");
        let recorded = gaps.drain();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].event, ev);
        assert!(gaps.is_empty());
    }

    #[test]
    fn successful_publish_reaches_subscribers() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<InventoryEvent>>> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe("inventory_events", StartFrom::Now);
        let gaps = Arc::new(InMemoryGapRecorder::new());
        let publisher = EventPublisher::new(bus, "inventory_events", gaps.clone());

        let ev = event();
        publisher.publish(ev.clone()).unwrap();

        let got = sub.try_recv().unwrap();
        assert_eq!(got.payload(), &ev);
        assert_eq!(got.sequence(), ev.sequence);
        assert!(gaps.is_empty());
    }
}
