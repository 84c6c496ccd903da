//! Persistence for inventory rows and reservations.
//!
//! Both stores expose conditional writes only: an inventory row changes only
//! if its version still matches, a reservation changes status only if it is
//! still in the status the caller saw. Everything else in the engine is built
//! on those two primitives.

mod in_memory;
#[cfg(feature = "postgres")]
mod postgres;

use chrono::{DateTime, Utc};
use thiserror::Error;

use stockguard_core::OrderId;
use stockguard_inventory::{InventoryRecord, Reservation, ReservationStatus, StockChange, StockKey};

pub use in_memory::{InMemoryInventoryStore, InMemoryReservationStore};
#[cfg(feature = "postgres")]
pub use postgres::{PostgresInventoryStore, PostgresReservationStore, SCHEMA};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Insert of a row whose identity is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Transient backend failure; the operation may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored row failed to decode or violates an invariant.
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Inventory rows with optimistic versioning.
pub trait VersionedStore: Send + Sync {
    fn get(&self, key: &StockKey) -> Result<Option<InventoryRecord>, StoreError>;

    /// Write `change` and bump the version by one, only if the row is still at
    /// `expected_version`. Returns `false` on a version mismatch or a missing row.
    fn compare_and_swap(
        &self,
        key: &StockKey,
        expected_version: u64,
        change: StockChange,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Create a row. Fails with [`StoreError::AlreadyExists`] if the key is taken.
    fn insert(&self, record: InventoryRecord) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<InventoryRecord>, StoreError>;
}

/// Reservations keyed by order id.
pub trait ReservationStore: Send + Sync {
    /// Fails with [`StoreError::AlreadyExists`] if the order id is taken.
    fn insert(&self, reservation: Reservation) -> Result<(), StoreError>;

    fn get(&self, order_id: &OrderId) -> Result<Option<Reservation>, StoreError>;

    /// Move `order_id` from `from` to `to`, only if it is still in `from`.
    ///
    /// `finalized_at` becomes `at` for a terminal `to` and is cleared when
    /// moving back to PENDING.
    fn transition(
        &self,
        order_id: &OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// PENDING reservations with `expires_at < now`, oldest deadline first.
    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, StoreError>;
}

impl<S: VersionedStore + ?Sized> VersionedStore for std::sync::Arc<S> {
    fn get(&self, key: &StockKey) -> Result<Option<InventoryRecord>, StoreError> {
        (**self).get(key)
    }

    fn compare_and_swap(
        &self,
        key: &StockKey,
        expected_version: u64,
        change: StockChange,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).compare_and_swap(key, expected_version, change, at)
    }

    fn insert(&self, record: InventoryRecord) -> Result<(), StoreError> {
        (**self).insert(record)
    }

    fn list(&self) -> Result<Vec<InventoryRecord>, StoreError> {
        (**self).list()
    }
}

impl<S: ReservationStore + ?Sized> ReservationStore for std::sync::Arc<S> {
    fn insert(&self, reservation: Reservation) -> Result<(), StoreError> {
        (**self).insert(reservation)
    }

    fn get(&self, order_id: &OrderId) -> Result<Option<Reservation>, StoreError> {
        (**self).get(order_id)
    }

    fn transition(
        &self,
        order_id: &OrderId,
        from: ReservationStatus,
        to: ReservationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        (**self).transition(order_id, from, to, at)
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Reservation>, StoreError> {
        (**self).list_expired(now, limit)
    }
}
