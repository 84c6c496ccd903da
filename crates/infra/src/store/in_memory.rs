use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use stockguard_core::{AggregateRoot, ExpectedVersion, OrderId};
use stockguard_inventory::{InventoryRecord, Reservation, ReservationStatus, StockChange, StockKey};

use super::{ReservationStore, StoreError, VersionedStore};

fn poisoned() -> StoreError {
    StoreError::Unavailable("in-memory store lock poisoned".to_string())
}

/// In-memory inventory table.
///
/// The version check and the write happen under one write lock, which gives
/// the same atomicity a conditional `UPDATE ... WHERE version = $n` has.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    rows: RwLock<HashMap<StockKey, InventoryRecord>>,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<StockKey, InventoryRecord>>, StoreError> {
        self.rows.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<StockKey, InventoryRecord>>, StoreError> {
        self.rows.write().map_err(|_| poisoned())
    }
}

impl VersionedStore for InMemoryInventoryStore {
    fn get(&self, key: &StockKey) -> Result<Option<InventoryRecord>, StoreError> {
        Ok(self.read()?.get(key).cloned())
    }

    fn compare_and_swap(
        &self,
        key: &StockKey,
        expected_version: u64,
        change: StockChange,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if change.reserved > change.on_hand {
            return Err(StoreError::Corrupt(format!(
                "rejected write for {key}: reserved {} > on hand {}",
                change.reserved, change.on_hand
            )));
        }

        let mut rows = self.write()?;
        match rows.get_mut(key) {
            Some(current) if ExpectedVersion::Exact(expected_version).matches(current.version()) => {
                *current = current.with_change(change, at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn insert(&self, record: InventoryRecord) -> Result<(), StoreError> {
        let mut rows = self.write()?;
        let key = record.key();
        if rows.contains_key(&key) {
            return Err(StoreError::AlreadyExists(format!("inventory {key}")));
        }
        rows.insert(key, record);
        Ok(())
    }

    fn list(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        let mut all: Vec<_> = self.read()?.values().cloned().collect();
        all.sort_by_key(|r| r.key());
        Ok(all)
    }
}

/// In-memory reservation table.
#[derive(Debug, Default)]
pub struct InMemoryReservationStore {
    rows: RwLock<HashMap<OrderId, Reservation>>,
}

impl InMemoryReservationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn insert(&self, reservation: Reservation) -> Result<(), StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        if rows.contains_key(&reservation.order_id) {
            return Err(StoreError::AlreadyExists(format!(
                "reservation {}",
                reservation.order_id
            )));
        }
        rows.insert(reservation.order_id.clone(), reservation);
        Ok(())
    }

    fn get(&self, order_id: &OrderId) -> Result<Option<Reservation>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        Ok(rows.get(order_id).cloned())
    }

    fn transition(
        &self,
        order_id: &OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut rows = self.rows.write().map_err(|_| poisoned())?;
        match rows.get_mut(order_id) {
            Some(r) if r.status == from => {
                r.status = to;
                r.finalized_at = to.is_terminal().then_some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, StoreError> {
        let rows = self.rows.read().map_err(|_| poisoned())?;
        let mut due: Vec<Reservation> = rows
            .values()
            .filter(|r| r.is_expirable(now))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.expires_at.cmp(&b.expires_at));
        due.truncate(limit);
        Ok(due)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use stockguard_core::{ProductId, StoreId};

    fn key() -> StockKey {
        StockKey::new(StoreId::new(), ProductId::new())
    }

    #[test]
    fn cas_only_applies_at_the_expected_version() {
        let store = InMemoryInventoryStore::new();
        let k = key();
        store.insert(InventoryRecord::new(k, 10, Utc::now())).unwrap();

        let change = StockChange {
            on_hand: 10,
            reserved: 3,
        };
        assert!(store.compare_and_swap(&k, 0, change, Utc::now()).unwrap());
        assert!(!store.compare_and_swap(&k, 0, change, Utc::now()).unwrap());

        let row = store.get(&k).unwrap().unwrap();
        assert_eq!(row.version(), 1);
        assert_eq!(row.reserved(), 3);
    }

    #[test]
    fn cas_on_missing_row_reports_mismatch() {
        let store = InMemoryInventoryStore::new();
        let change = StockChange {
            on_hand: 1,
            reserved: 0,
        };
        assert!(!store.compare_and_swap(&key(), 0, change, Utc::now()).unwrap());
    }

    #[test]
    fn cas_refuses_rows_that_break_the_invariant() {
        let store = InMemoryInventoryStore::new();
        let k = key();
        store.insert(InventoryRecord::new(k, 1, Utc::now())).unwrap();
        let bad = StockChange {
            on_hand: 1,
            reserved: 2,
        };
        assert!(matches!(
            store.compare_and_swap(&k, 0, bad, Utc::now()),
            Err(StoreError::Corrupt(_))
        ));
    }

    #[test]
    fn duplicate_insert_is_rejected() {
        let store = InMemoryInventoryStore::new();
        let k = key();
        store.insert(InventoryRecord::new(k, 1, Utc::now())).unwrap();
        assert!(matches!(
            store.insert(InventoryRecord::new(k, 5, Utc::now())),
            Err(StoreError::AlreadyExists(_))
        ));
    }

    fn reservation(id: &str, created: DateTime<Utc>, ttl_secs: u64) -> Reservation {
        Reservation::pending(
            OrderId::parse(id).unwrap(),
            key(),
            1,
            created,
            StdDuration::from_secs(ttl_secs),
        )
        .unwrap()
    }

    #[test]
    fn transition_is_conditional_on_current_status() {
        let store = InMemoryReservationStore::new();
        let r = reservation("o-1", Utc::now(), 60);
        let id = r.order_id.clone();
        store.insert(r).unwrap();

        let now = Utc::now();
        assert!(store
            .transition(&id, ReservationStatus::Pending, ReservationStatus::Cancelled, now)
            .unwrap());
        assert!(!store
            .transition(&id, ReservationStatus::Pending, ReservationStatus::Expired, now)
            .unwrap());

        let stored = store.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, ReservationStatus::Cancelled);
        assert_eq!(stored.finalized_at, Some(now));

        assert!(store
            .transition(&id, ReservationStatus::Cancelled, ReservationStatus::Pending, now)
            .unwrap());
        assert_eq!(store.get(&id).unwrap().unwrap().finalized_at, None);
    }

    #[test]
    fn list_expired_returns_oldest_pending_first() {
        let store = InMemoryReservationStore::new();
        let t0 = Utc::now() - Duration::minutes(10);
        store.insert(reservation("late", t0 + Duration::seconds(30), 1)).unwrap();
        store.insert(reservation("early", t0, 1)).unwrap();
        store.insert(reservation("fresh", Utc::now(), 600)).unwrap();

        let due = store.list_expired(Utc::now(), 10).unwrap();
        let ids: Vec<_> = due.iter().map(|r| r.order_id.as_str()).collect();
        assert_eq!(ids, vec!["early", "late"]);

        assert_eq!(store.list_expired(Utc::now(), 1).unwrap().len(), 1);
    }
}
