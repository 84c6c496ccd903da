//! Inventory reservation domain.
//!
//! This crate contains business rules for per-store stock and reservations,
//! implemented purely as deterministic domain logic (no IO, no locking, no
//! storage). The infrastructure crate decides *when* a rule runs; this crate
//! decides *what* the outcome is.

pub mod event;
pub mod record;
pub mod reservation;

pub use event::{InventoryEvent, InventoryEventType};
pub use record::{InventoryRecord, StockChange, StockKey};
pub use reservation::{Finalize, Reservation, ReservationStatus, TransitionDecision};
