//! Event contract and pub/sub mechanics.
//!
//! Domain crates define concrete event payloads; this crate only knows that
//! an event belongs to a keyed stream and carries a per-stream sequence
//! number. Transports (in-memory here, Redis in `stockguard-infra`) implement
//! [`EventBus`].

pub mod bus;
pub mod cursor;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod sequenced;

pub use bus::{EventBus, StartFrom, Subscription};
pub use cursor::{Delivery, SequenceCursor};
pub use envelope::{EventEnvelope, DEFAULT_SOURCE};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use sequenced::Sequenced;
