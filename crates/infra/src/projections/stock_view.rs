use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::io;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use stockguard_core::AggregateRoot;
use stockguard_events::{Delivery, EventBus, EventEnvelope, SequenceCursor, StartFrom};
use stockguard_inventory::{InventoryEvent, InventoryRecord, StockKey};

use crate::workers::{ProjectionWorker, WorkerHandle};

/// Latest known quantities for one stock key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockSnapshot {
    pub key: StockKey,
    pub on_hand: u64,
    pub reserved: u64,
    pub sequence: u64,
    pub updated_at: DateTime<Utc>,
}

impl StockSnapshot {
    pub fn available(&self) -> u64 {
        self.on_hand.saturating_sub(self.reserved)
    }
}

/// A hole in the delivered sequence for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceGap {
    pub key: StockKey,
    pub expected: u64,
    pub found: u64,
}

/// Gaps kept between rebuilds; older ones are dropped first.
pub const DEFAULT_GAP_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct ViewState {
    rows: HashMap<StockKey, StockSnapshot>,
    cursor: SequenceCursor<StockKey>,
    gaps: VecDeque<SequenceGap>,
}

/// Downstream aggregate view of stock levels.
///
/// Every event carries a full post-write snapshot, so the view applies the
/// newest one it sees and drops anything at or below its cursor. Gaps are
/// applied too (the snapshot is still the latest truth) but remembered, so an
/// operator can reconcile with [`StockView::rebuild`].
#[derive(Debug)]
pub struct StockView {
    state: RwLock<ViewState>,
    gap_capacity: usize,
}

impl Default for StockView {
    fn default() -> Self {
        Self::with_gap_capacity(DEFAULT_GAP_CAPACITY)
    }
}

impl StockView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_gap_capacity(gap_capacity: usize) -> Self {
        Self {
            state: RwLock::new(ViewState::default()),
            gap_capacity: gap_capacity.max(1),
        }
    }

    pub fn apply(&self, event: &InventoryEvent) -> Delivery {
        let Ok(mut state) = self.state.write() else {
            warn!("stock view lock poisoned; event dropped");
            return Delivery::Duplicate;
        };

        let key = event.key();
        let delivery = state.cursor.observe(&key, event.sequence);

        match delivery {
            Delivery::Duplicate => {
                debug!(%key, sequence = event.sequence, "duplicate event ignored");
                return delivery;
            }
            Delivery::Gap { expected, found } => {
                warn!(%key, expected, found, "sequence gap; applying newer snapshot");
                if state.gaps.len() == self.gap_capacity {
                    state.gaps.pop_front();
                }
                state.gaps.push_back(SequenceGap { key, expected, found });
            }
            Delivery::Fresh => {}
        }

        state.rows.insert(
            key,
            StockSnapshot {
                key,
                on_hand: event.quantity_on_hand,
                reserved: event.quantity_reserved,
                sequence: event.sequence,
                updated_at: event.timestamp,
            },
        );
        delivery
    }

    pub fn apply_envelope(&self, envelope: &EventEnvelope<InventoryEvent>) -> Delivery {
        self.apply(envelope.payload())
    }

    pub fn get(&self, key: &StockKey) -> Option<StockSnapshot> {
        self.state.read().ok()?.rows.get(key).cloned()
    }

    pub fn list(&self) -> Vec<StockSnapshot> {
        let mut rows: Vec<_> = self
            .state
            .read()
            .map(|s| s.rows.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by_key(|r| r.key);
        rows
    }

    /// Resume point for a replaying subscription.
    pub fn cursor(&self) -> SequenceCursor<StockKey> {
        self.state
            .read()
            .map(|s| s.cursor.clone())
            .unwrap_or_default()
    }

    pub fn gaps(&self) -> Vec<SequenceGap> {
        self.state
            .read()
            .map(|s| s.gaps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the whole view with authoritative rows.
    ///
    /// Clears recorded gaps; events at or below each row's version that are
    /// still in flight will be dropped as duplicates.
    pub fn rebuild(&self, records: &[InventoryRecord]) {
        let Ok(mut state) = self.state.write() else {
            warn!("stock view lock poisoned; rebuild skipped");
            return;
        };

        state.rows.clear();
        state.cursor.clear();
        state.gaps.clear();

        for record in records {
            let key = record.key();
            state.cursor.observe(&key, record.version());
            state.rows.insert(
                key,
                StockSnapshot {
                    key,
                    on_hand: record.on_hand(),
                    reserved: record.reserved(),
                    sequence: record.version(),
                    updated_at: record.updated_at(),
                },
            );
        }
        debug!(rows = records.len(), "stock view rebuilt");
    }
}

/// Feed `view` from `topic` on a background thread.
///
/// Resumes after the view's cursor when the bus can replay; otherwise only
/// live events are consumed.
pub fn spawn_stock_view_worker<B>(bus: &B, topic: &str, view: Arc<StockView>) -> io::Result<WorkerHandle>
where
    B: EventBus<EventEnvelope<InventoryEvent>>,
{
    let start = if bus.supports_replay() {
        StartFrom::After(view.cursor())
    } else {
        StartFrom::Now
    };
    let subscription = bus.subscribe(topic, start);

    ProjectionWorker::spawn("stock-view", subscription, move |envelope| {
        view.apply_envelope(&envelope);
        Ok::<(), Infallible>(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockguard_core::{ProductId, StoreId};
    use stockguard_inventory::InventoryEventType;

    fn event(key: StockKey, sequence: u64, on_hand: u64, reserved: u64) -> InventoryEvent {
        InventoryEvent {
            event_type: InventoryEventType::StockReserved,
            store_id: key.store_id,
            product_id: key.product_id,
            sequence,
            quantity_delta: 1,
            quantity_on_hand: on_hand,
            quantity_reserved: reserved,
            timestamp: Utc::now(),
            order_id: None,
            reason: None,
            reference_id: None,
        }
    }

    fn key() -> StockKey {
        StockKey::new(StoreId::new(), ProductId::new())
    }

    #[test]
    fn duplicates_and_stale_events_are_ignored() {
        let view = StockView::new();
        let k = key();

        assert_eq!(view.apply(&event(k, 1, 10, 1)), Delivery::Fresh);
        assert_eq!(view.apply(&event(k, 2, 10, 2)), Delivery::Fresh);
        assert_eq!(view.apply(&event(k, 2, 10, 2)), Delivery::Duplicate);
        assert_eq!(view.apply(&event(k, 1, 10, 1)), Delivery::Duplicate);

        let snap = view.get(&k).unwrap();
        assert_eq!((snap.reserved, snap.sequence), (2, 2));
    }

    #[test]
    fn gaps_apply_the_newer_snapshot_and_are_recorded() {
        let view = StockView::new();
        let k = key();
        view.apply(&event(k, 1, 10, 1));

        assert_eq!(
            view.apply(&event(k, 4, 10, 3)),
            Delivery::Gap {
                expected: 2,
                found: 4
            }
        );
        assert_eq!(view.get(&k).unwrap().reserved, 3);
        assert_eq!(view.gaps(), vec![SequenceGap { key: k, expected: 2, found: 4 }]);

        // The late event from inside the gap is now stale.
        assert_eq!(view.apply(&event(k, 3, 10, 2)), Delivery::Duplicate);
        assert_eq!(view.get(&k).unwrap().reserved, 3);
    }

    #[test]
    fn gap_log_keeps_only_the_newest_entries() {
        let view = StockView::with_gap_capacity(2);
        let k = key();
        view.apply(&event(k, 1, 10, 1));
        view.apply(&event(k, 3, 10, 1));
        view.apply(&event(k, 5, 10, 1));
        view.apply(&event(k, 7, 10, 1));

        let found: Vec<_> = view.gaps().iter().map(|g| g.found).collect();
        assert_eq!(found, vec![5, 7]);
    }

    #[test]
    fn rebuild_resets_rows_cursor_and_gaps() {
        let view = StockView::new();
        let k = key();
        view.apply(&event(k, 1, 10, 1));
        view.apply(&event(k, 5, 10, 4));

        let record = InventoryRecord::from_parts(k, 8, 2, 6, Utc::now()).unwrap();
        view.rebuild(&[record]);

        assert!(view.gaps().is_empty());
        assert_eq!(view.get(&k).unwrap().on_hand, 8);
        assert_eq!(view.cursor().last_seen(&k), Some(6));
        assert_eq!(view.apply(&event(k, 6, 10, 4)), Delivery::Duplicate);
        assert_eq!(view.apply(&event(k, 7, 8, 3)), Delivery::Fresh);
    }
}
