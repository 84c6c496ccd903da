//! Reservation engine (application-level orchestration).
//!
//! Composes the lock service, the versioned inventory store, the reservation
//! store and the event publisher into the reserve / confirm / cancel / expire
//! operations.
//!
//! ## Write path
//!
//! ```text
//! request
//!   ↓
//! 1. Acquire the per-key lock (policy-dependent, bounded wait)
//!   ↓
//! 2. Read the inventory row, plan the change, compare-and-swap on version
//!   ↓   (conflict → re-read and retry, bounded)
//! 3. Record the reservation / claim its transition
//!   ↓
//! 4. Release the lock (ownership-checked)
//!   ↓
//! 5. Publish the event (failure = delivery gap, never a rollback)
//! ```
//!
//! ## Finalization
//!
//! Confirm, cancel and expire first *claim* the reservation with a
//! conditional PENDING → FINALIZING transition and only then touch inventory.
//! Whoever loses the claim does nothing, so two finalizers racing on the same
//! reservation (a cancel against the reaper, two overlapping sweeps) can never
//! both return the same stock. Once the stock write lands the claim becomes the
//! terminal status; if it fails the claim goes back to PENDING. Readers never
//! see a terminal status that could still be undone.
//!
//! The lock is an optimization: with `LockPolicy::BestEffort` or `Disabled`
//! the version check alone still keeps every invariant.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, instrument, warn};

use stockguard_core::{AggregateRoot, Clock, DomainError, OrderId, SystemClock};
use stockguard_events::{EventBus, EventEnvelope};
use stockguard_inventory::{
    Finalize, InventoryEvent, InventoryEventType, InventoryRecord, Reservation, ReservationStatus,
    StockChange, StockKey, TransitionDecision,
};

use crate::config::{EngineConfig, LockPolicy};
use crate::error::ReservationError;
use crate::lock::{LockBackoff, LockManager, LockToken};
use crate::publisher::{DeliveryGap, EventPublisher};
use crate::store::{ReservationStore, StoreError, VersionedStore};

/// Input to [`ReservationEngine::reserve`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub key: StockKey,
    pub order_id: OrderId,
    pub quantity: u64,
    /// Falls back to `EngineConfig::reservation_ttl`.
    pub ttl: Option<Duration>,
    pub deadline: Option<Instant>,
}

impl ReserveRequest {
    pub fn new(key: StockKey, order_id: OrderId, quantity: u64) -> Self {
        Self {
            key,
            order_id,
            quantity,
            ttl: None,
            deadline: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Input to [`ReservationEngine::adjust_stock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockAdjustment {
    pub key: StockKey,
    /// Positive receives stock, negative writes it off.
    pub delta: i64,
    pub reason: Option<String>,
    pub reference_id: Option<String>,
    pub deadline: Option<Instant>,
}

impl StockAdjustment {
    pub fn new(key: StockKey, delta: i64) -> Self {
        Self {
            key,
            delta,
            reason: None,
            reference_id: None,
            deadline: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_reference(mut self, reference_id: impl Into<String>) -> Self {
        self.reference_id = Some(reference_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of a finalize call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finalized {
    pub reservation: Reservation,
    /// `false` when the call was a no-op replay of an earlier transition.
    pub applied: bool,
}

enum Placement {
    Placed(InventoryRecord),
    Duplicate { compensation: Option<InventoryRecord> },
    Failed {
        error: ReservationError,
        compensation: Option<InventoryRecord>,
    },
}

struct Claim {
    reservation: Reservation,
    after: Option<InventoryRecord>,
    /// Outcome of the FINALIZING → target flip after the stock write.
    settled: Result<(), ReservationError>,
}

pub struct ReservationEngine<V, R, L, B> {
    inventory: V,
    reservations: R,
    locks: L,
    publisher: EventPublisher<B>,
    clock: Arc<dyn Clock>,
    backoff: LockBackoff,
    config: EngineConfig,
}

impl<V, R, L, B> core::fmt::Debug for ReservationEngine<V, R, L, B> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ReservationEngine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<V, R, L, B> ReservationEngine<V, R, L, B>
where
    V: VersionedStore,
    R: ReservationStore,
    L: LockManager,
    B: EventBus<EventEnvelope<InventoryEvent>>,
{
    pub fn new(
        inventory: V,
        reservations: R,
        locks: L,
        publisher: EventPublisher<B>,
        config: EngineConfig,
    ) -> Self {
        let backoff = LockBackoff::new(
            config.lock_backoff_base,
            config.lock_backoff_cap,
            config.lock_backoff_jitter,
        );
        Self {
            inventory,
            reservations,
            locks,
            publisher,
            clock: Arc::new(SystemClock),
            backoff,
            config,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn reservations(&self) -> &R {
        &self.reservations
    }

    pub fn inventory(&self) -> &V {
        &self.inventory
    }

    pub fn publisher(&self) -> &EventPublisher<B> {
        &self.publisher
    }

    /// Create the inventory row for `key` at version 0.
    #[instrument(skip(self, key), fields(key = %key), err)]
    pub fn register_inventory(&self, key: StockKey, on_hand: u64) -> Result<InventoryRecord, ReservationError> {
        let record = InventoryRecord::new(key, on_hand, self.clock.now());
        match self.inventory.insert(record.clone()) {
            Ok(()) => {}
            Err(StoreError::AlreadyExists(_)) => {
                return Err(ReservationError::InvalidRequest(format!(
                    "inventory {key} is already registered"
                )));
            }
            Err(e) => return Err(e.into()),
        }

        info!(on_hand, "inventory registered");
        self.emit(
            InventoryEvent::committed(InventoryEventType::StockUpdated, &record, signed(on_hand), None)
                .with_reason("registered"),
        );
        Ok(record)
    }

    /// Hold `quantity` units for `order_id`.
    ///
    /// Repeating a request with the same order id, key and quantity returns the
    /// existing reservation; the same order id with other parameters is rejected.
    #[instrument(
        skip(self, request),
        fields(order_id = %request.order_id, key = %request.key, quantity = request.quantity),
        err
    )]
    pub fn reserve(&self, request: ReserveRequest) -> Result<Reservation, ReservationError> {
        let ReserveRequest {
            key,
            order_id,
            quantity,
            ttl,
            deadline,
        } = request;

        if quantity == 0 {
            return Err(ReservationError::InvalidRequest("quantity must be positive".to_string()));
        }
        let ttl = ttl.unwrap_or(self.config.reservation_ttl);
        remaining(deadline, "reserve")?;

        if let Some(existing) = self.reservations.get(&order_id)? {
            return replayed(existing, key, quantity);
        }

        let reservation = Reservation::pending(order_id.clone(), key, quantity, self.clock.now(), ttl)?;

        let token = self.lock(&key, deadline)?;
        let placement = self.place(&reservation, deadline);
        self.unlock(token);

        match placement? {
            Placement::Placed(after) => {
                info!(version = after.version(), available = after.available(), "stock reserved");
                self.emit(InventoryEvent::committed(
                    InventoryEventType::StockReserved,
                    &after,
                    signed(quantity),
                    Some(order_id),
                ));
                Ok(reservation)
            }
            Placement::Duplicate { compensation } => {
                self.emit_compensation(compensation, quantity, &order_id);
                let existing = self
                    .reservations
                    .get(&order_id)?
                    .ok_or_else(|| ReservationError::NotFound(format!("reservation {order_id}")))?;
                replayed(existing, key, quantity)
            }
            Placement::Failed { error, compensation } => {
                self.emit_compensation(compensation, quantity, &order_id);
                Err(error)
            }
        }
    }

    /// Ship a PENDING reservation: its units leave both `on_hand` and `reserved`.
    pub fn confirm(&self, order_id: &OrderId) -> Result<Reservation, ReservationError> {
        self.confirm_within(order_id, None)
    }

    #[instrument(skip(self, order_id, deadline), fields(order_id = %order_id), err)]
    pub fn confirm_within(
        &self,
        order_id: &OrderId,
        deadline: Option<Instant>,
    ) -> Result<Reservation, ReservationError> {
        self.finalize(order_id, Finalize::Confirm, deadline)
            .map(|f| f.reservation)
    }

    /// Return a PENDING reservation's units to availability.
    pub fn cancel(&self, order_id: &OrderId) -> Result<Reservation, ReservationError> {
        self.cancel_within(order_id, None)
    }

    #[instrument(skip(self, order_id, deadline), fields(order_id = %order_id), err)]
    pub fn cancel_within(
        &self,
        order_id: &OrderId,
        deadline: Option<Instant>,
    ) -> Result<Reservation, ReservationError> {
        self.finalize(order_id, Finalize::Cancel, deadline)
            .map(|f| f.reservation)
    }

    /// Expire a PENDING reservation whose ttl has elapsed.
    #[instrument(skip(self, order_id), fields(order_id = %order_id), err)]
    pub fn expire(&self, order_id: &OrderId) -> Result<Finalized, ReservationError> {
        self.finalize(order_id, Finalize::Expire, None)
    }

    pub fn get_status(&self, order_id: &OrderId) -> Result<Reservation, ReservationError> {
        self.reservations
            .get(order_id)?
            .ok_or_else(|| ReservationError::NotFound(format!("reservation {order_id}")))
    }

    /// Receive or write off unreserved stock.
    ///
    /// A positive delta publishes `stock_updated`, a negative one `stock_released`.
    #[instrument(
        skip(self, adjustment),
        fields(key = %adjustment.key, delta = adjustment.delta),
        err
    )]
    pub fn adjust_stock(&self, adjustment: StockAdjustment) -> Result<InventoryRecord, ReservationError> {
        let StockAdjustment {
            key,
            delta,
            reason,
            reference_id,
            deadline,
        } = adjustment;

        if delta == 0 {
            return Err(ReservationError::InvalidRequest("delta cannot be zero".to_string()));
        }
        remaining(deadline, "adjust_stock")?;

        let token = self.lock(&key, deadline)?;
        let written = self.write_with_retry(&key, deadline, |r| r.plan_adjust(delta));
        self.unlock(token);
        let after = written?;

        info!(version = after.version(), on_hand = after.on_hand(), "stock adjusted");
        let event_type = if delta < 0 {
            InventoryEventType::StockReleased
        } else {
            InventoryEventType::StockUpdated
        };
        let mut event = InventoryEvent::committed(event_type, &after, delta, None);
        event.reason = reason;
        event.reference_id = reference_id;
        self.emit(event);
        Ok(after)
    }

    pub fn get_stock_level(&self, key: &StockKey) -> Result<InventoryRecord, ReservationError> {
        self.inventory
            .get(key)?
            .ok_or_else(|| ReservationError::NotFound(format!("inventory {key}")))
    }

    pub fn list_inventory(&self) -> Result<Vec<InventoryRecord>, ReservationError> {
        Ok(self.inventory.list()?)
    }

    /// Publish a previously recorded gap again.
    ///
    /// The event keeps its original sequence, so consumers that already got it
    /// through another path drop it as a duplicate.
    #[instrument(skip(self, gap), fields(key = %gap.event.key(), sequence = gap.event.sequence), err)]
    pub fn redeliver(&self, gap: &DeliveryGap) -> Result<(), ReservationError> {
        self.publisher.send(gap.event.clone())?;
        info!("delivery gap redelivered");
        Ok(())
    }

    fn finalize(
        &self,
        order_id: &OrderId,
        action: Finalize,
        deadline: Option<Instant>,
    ) -> Result<Finalized, ReservationError> {
        remaining(deadline, "finalize")?;

        let current = self.get_status(order_id)?;
        match current.decide(action, self.clock.now())? {
            TransitionDecision::AlreadyDone => {
                debug!(status = %current.status, ?action, "finalize replay, nothing to do");
                Ok(Finalized {
                    reservation: current,
                    applied: false,
                })
            }
            TransitionDecision::ExpireInstead => {
                if let Err(e) = self.apply(current, Finalize::Expire, deadline) {
                    warn!(error = %e, "inline expiry failed; the reaper will pick it up");
                }
                Err(ReservationError::InvalidStateTransition(format!(
                    "reservation {order_id} expired before it was confirmed"
                )))
            }
            TransitionDecision::Apply => self.apply(current, action, deadline),
        }
    }

    fn apply(
        &self,
        current: Reservation,
        action: Finalize,
        deadline: Option<Instant>,
    ) -> Result<Finalized, ReservationError> {
        let token = self.lock(&current.key, deadline)?;
        let claim = self.claim_and_write(&current, action, deadline);
        self.unlock(token);
        let Claim {
            reservation,
            after,
            settled,
        } = claim?;

        let Some(after) = after else {
            return Ok(Finalized {
                reservation,
                applied: false,
            });
        };

        info!(
            status = %reservation.status,
            version = after.version(),
            available = after.available(),
            "reservation finalized"
        );
        self.emit(InventoryEvent::committed(
            action.event_type(),
            &after,
            -signed(reservation.quantity),
            Some(reservation.order_id.clone()),
        ));
        settled?;
        Ok(Finalized {
            reservation,
            applied: true,
        })
    }

    fn claim_and_write(
        &self,
        current: &Reservation,
        action: Finalize,
        deadline: Option<Instant>,
    ) -> Result<Claim, ReservationError> {
        let order_id = &current.order_id;
        let target = action.target();
        let now = self.clock.now();

        if !self
            .reservations
            .transition(order_id, ReservationStatus::Pending, ReservationStatus::Finalizing, now)?
        {
            let latest = self.get_status(order_id)?;
            debug!(status = %latest.status, ?action, "lost finalize claim");
            return match latest.decide(action, now)? {
                TransitionDecision::AlreadyDone => Ok(Claim {
                    reservation: latest,
                    after: None,
                    settled: Ok(()),
                }),
                _ => Err(ReservationError::ConcurrentModification {
                    key: order_id.to_string(),
                    attempts: 1,
                }),
            };
        }

        let quantity = current.quantity;
        let written = match action {
            Finalize::Confirm => self.write_with_retry(&current.key, deadline, |r| r.plan_commit(quantity)),
            Finalize::Cancel | Finalize::Expire => {
                self.write_with_retry(&current.key, deadline, |r| r.plan_release(quantity))
            }
        };

        let after = match written {
            Ok(after) => after,
            Err(err) => {
                match self.reservations.transition(
                    order_id,
                    ReservationStatus::Finalizing,
                    ReservationStatus::Pending,
                    now,
                ) {
                    Ok(true) => debug!("finalize claim reverted"),
                    Ok(false) => error!("finalize claim vanished before revert"),
                    Err(e) => error!(error = %e, "failed to revert finalize claim"),
                }
                return Err(err);
            }
        };

        // The stock change is committed; only the status flip remains.
        let settled = match self
            .reservations
            .transition(order_id, ReservationStatus::Finalizing, target, now)
        {
            Ok(true) => Ok(()),
            Ok(false) => Err(ReservationError::Storage(format!(
                "reservation {order_id} lost its finalize claim"
            ))),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = &settled {
            error!(status = %target, error = %e, "stock written but reservation not settled; needs reconciliation");
        }

        Ok(Claim {
            reservation: current.finalized(action, now),
            after: Some(after),
            settled,
        })
    }

    /// Hold stock for `reservation`, then record it.
    fn place(&self, reservation: &Reservation, deadline: Option<Instant>) -> Result<Placement, ReservationError> {
        let key = reservation.key;
        let quantity = reservation.quantity;

        let after = self.write_with_retry(&key, deadline, |r| r.plan_reserve(quantity))?;

        match self.reservations.insert(reservation.clone()) {
            Ok(()) => Ok(Placement::Placed(after)),
            Err(StoreError::AlreadyExists(_)) => {
                debug!("order id claimed concurrently; returning held stock");
                Ok(Placement::Duplicate {
                    compensation: self.compensate(&key, quantity),
                })
            }
            Err(e) => Ok(Placement::Failed {
                error: e.into(),
                compensation: self.compensate(&key, quantity),
            }),
        }
    }

    fn compensate(&self, key: &StockKey, quantity: u64) -> Option<InventoryRecord> {
        match self.write_with_retry(key, None, |r| r.plan_release(quantity)) {
            Ok(after) => Some(after),
            Err(e) => {
                error!(%key, quantity, error = %e, "held stock could not be returned; needs reconciliation");
                None
            }
        }
    }

    fn emit_compensation(&self, after: Option<InventoryRecord>, quantity: u64, order_id: &OrderId) {
        if let Some(after) = after {
            self.emit(
                InventoryEvent::committed(
                    InventoryEventType::StockReleased,
                    &after,
                    -signed(quantity),
                    Some(order_id.clone()),
                )
                .with_reason("reservation not recorded"),
            );
        }
    }

    /// Version-checked read-modify-write with bounded retries.
    fn write_with_retry<F>(
        &self,
        key: &StockKey,
        deadline: Option<Instant>,
        plan: F,
    ) -> Result<InventoryRecord, ReservationError>
    where
        F: Fn(&InventoryRecord) -> Result<StockChange, DomainError>,
    {
        let attempts = self.config.max_conflict_retries.saturating_add(1);
        let mut last_store_error: Option<StoreError> = None;

        for attempt in 1..=attempts {
            remaining(deadline, "version check")?;

            let current = match self.inventory.get(key) {
                Ok(Some(record)) => record,
                Ok(None) => return Err(ReservationError::NotFound(format!("inventory {key}"))),
                Err(e) if e.is_transient() => {
                    warn!(%key, attempt, error = %e, "inventory read failed, retrying");
                    last_store_error = Some(e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let change = plan(&current)?;
            let at = self.clock.now();

            // A failed swap may or may not have applied, so it is never retried.
            if self.inventory.compare_and_swap(key, current.version(), change, at)? {
                return Ok(current.with_change(change, at));
            }

            last_store_error = None;
            debug!(%key, attempt, version = current.version(), "version conflict");
        }

        Err(match last_store_error {
            Some(e) => e.into(),
            None => ReservationError::ConcurrentModification {
                key: key.to_string(),
                attempts,
            },
        })
    }

    fn lock(&self, key: &StockKey, deadline: Option<Instant>) -> Result<Option<LockToken>, ReservationError> {
        if self.config.lock_policy == LockPolicy::Disabled {
            return Ok(None);
        }

        let wait = match remaining(deadline, "lock")? {
            Some(left) => left.min(self.config.lock_wait),
            None => self.config.lock_wait,
        };
        let name = key.lock_name();

        match self.locks.acquire(&name, self.config.lock_ttl, wait, &self.backoff) {
            Ok(token) => Ok(Some(token)),
            Err(e) if self.config.lock_policy == LockPolicy::BestEffort => {
                warn!(lock = %name, error = %e, "lock unavailable, continuing on version check alone");
                Ok(None)
            }
            Err(e) => {
                remaining(deadline, "lock")?;
                Err(e.into())
            }
        }
    }

    fn unlock(&self, token: Option<LockToken>) {
        let Some(token) = token else { return };

        if token.is_expired() {
            warn!(lock = token.key(), ttl_ms = crate::config::millis(token.ttl()), "critical section outlived lock ttl");
        }
        if let Err(e) = self.locks.release(&token) {
            warn!(lock = token.key(), error = %e, "lock release failed; lease will lapse on its own");
        }
    }

    fn emit(&self, event: InventoryEvent) {
        // Failures are logged and recorded as delivery gaps by the publisher.
        let _ = self.publisher.publish(event);
    }
}

fn replayed(existing: Reservation, key: StockKey, quantity: u64) -> Result<Reservation, ReservationError> {
    if existing.matches_request(key, quantity) {
        debug!(status = %existing.status, "reserve replay, returning existing reservation");
        Ok(existing)
    } else {
        Err(ReservationError::InvalidStateTransition(format!(
            "order {} already holds a reservation for different stock",
            existing.order_id
        )))
    }
}

/// Time left before `deadline`, or `DEADLINE_EXCEEDED` once it has passed.
fn remaining(deadline: Option<Instant>, stage: &str) -> Result<Option<Duration>, ReservationError> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let now = Instant::now();
            if now >= d {
                Err(ReservationError::DeadlineExceeded(format!("deadline passed before {stage}")))
            } else {
                Ok(Some(d - now))
            }
        }
    }
}

fn signed(quantity: u64) -> i64 {
    i64::try_from(quantity).unwrap_or(i64::MAX)
}
