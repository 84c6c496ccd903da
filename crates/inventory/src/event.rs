use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockguard_core::{AggregateRoot, OrderId, ProductId, StoreId};
use stockguard_events::{Event, Sequenced};

use crate::record::{InventoryRecord, StockKey};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InventoryEventType {
    StockReserved,
    StockReleased,
    StockUpdated,
    ReservationConfirmed,
    ReservationCancelled,
    ReservationExpired,
}

impl InventoryEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            InventoryEventType::StockReserved => "stock_reserved",
            InventoryEventType::StockReleased => "stock_released",
            InventoryEventType::StockUpdated => "stock_updated",
            InventoryEventType::ReservationConfirmed => "reservation_confirmed",
            InventoryEventType::ReservationCancelled => "reservation_cancelled",
            InventoryEventType::ReservationExpired => "reservation_expired",
        }
    }
}

/// Notification of one committed inventory mutation.
///
/// `sequence` is the record version the mutation produced, so it is strictly
/// increasing per (store, product) and a consumer holding the last one it
/// applied can drop duplicates and spot gaps. The quantity fields are the
/// post-mutation snapshot; applying the newest snapshot is always correct
/// even after a gap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEvent {
    pub event_type: InventoryEventType,
    pub store_id: StoreId,
    pub product_id: ProductId,
    pub sequence: u64,
    /// Signed change applied by this mutation: to `quantity_reserved` for
    /// reservation events, to `quantity_on_hand` for stock events.
    pub quantity_delta: i64,
    pub quantity_on_hand: u64,
    pub quantity_reserved: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<OrderId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Caller's document id for manual adjustments (delivery note, audit).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference_id: Option<String>,
}

impl InventoryEvent {
    /// Describe the mutation that produced `after`.
    pub fn committed(
        event_type: InventoryEventType,
        after: &InventoryRecord,
        quantity_delta: i64,
        order_id: Option<OrderId>,
    ) -> Self {
        let key = after.key();
        Self {
            event_type,
            store_id: key.store_id,
            product_id: key.product_id,
            sequence: after.version(),
            quantity_delta,
            quantity_on_hand: after.on_hand(),
            quantity_reserved: after.reserved(),
            timestamp: after.updated_at(),
            order_id,
            reason: None,
            reference_id: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn key(&self) -> StockKey {
        StockKey::new(self.store_id, self.product_id)
    }
}

impl Event for InventoryEvent {
    fn event_type(&self) -> &'static str {
        self.event_type.as_str()
    }

    fn version(&self) -> u32 {
        1
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl Sequenced for InventoryEvent {
    type Key = StockKey;

    fn stream_key(&self) -> Self::Key {
        self.key()
    }

    fn sequence(&self) -> u64 {
        self.sequence
    }
}
