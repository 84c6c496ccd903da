//! Infrastructure layer: locks, stores, transports, and the reservation
//! engine that composes them.

pub mod config;
pub mod engine;
pub mod error;
pub mod event_bus;
pub mod lock;
pub mod projections;
pub mod publisher;
pub mod reaper;
pub mod store;
pub mod workers;

pub use config::{ConfigError, EngineConfig, LockPolicy};
pub use engine::{Finalized, ReservationEngine, ReserveRequest, StockAdjustment};
pub use error::ReservationError;
pub use lock::{
    InMemoryLockManager, LockBackoff, LockError, LockManager, LockToken, ReleaseOutcome, UnavailableLockManager,
};
pub use publisher::{DeliveryGap, DeliveryGapSink, EventPublisher, InMemoryGapRecorder, LogOnlyGapSink, PublishError};
pub use reaper::{ExpiryReaper, ReaperHandle, SweepReport};
pub use store::{InMemoryInventoryStore, InMemoryReservationStore, ReservationStore, StoreError, VersionedStore};

#[cfg(test)]
mod integration_tests;
