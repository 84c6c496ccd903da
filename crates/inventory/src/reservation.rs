use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stockguard_core::{DomainError, OrderId};

use crate::event::InventoryEventType;
use crate::record::StockKey;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Pending,
    /// Claimed by a finalizer whose stock write has not landed yet.
    Finalizing,
    Confirmed,
    Cancelled,
    Expired,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ReservationStatus::Confirmed | ReservationStatus::Cancelled | ReservationStatus::Expired
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "PENDING",
            ReservationStatus::Finalizing => "FINALIZING",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Cancelled => "CANCELLED",
            ReservationStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(value: &str) -> Result<Self, DomainError> {
        match value {
            "PENDING" => Ok(ReservationStatus::Pending),
            "FINALIZING" => Ok(ReservationStatus::Finalizing),
            "CONFIRMED" => Ok(ReservationStatus::Confirmed),
            "CANCELLED" => Ok(ReservationStatus::Cancelled),
            "EXPIRED" => Ok(ReservationStatus::Expired),
            other => Err(DomainError::validation(format!(
                "unknown reservation status '{other}'"
            ))),
        }
    }
}

impl core::fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ways a PENDING reservation can end.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Finalize {
    Confirm,
    Cancel,
    Expire,
}

impl Finalize {
    pub fn target(self) -> ReservationStatus {
        match self {
            Finalize::Confirm => ReservationStatus::Confirmed,
            Finalize::Cancel => ReservationStatus::Cancelled,
            Finalize::Expire => ReservationStatus::Expired,
        }
    }

    pub fn event_type(self) -> InventoryEventType {
        match self {
            Finalize::Confirm => InventoryEventType::ReservationConfirmed,
            Finalize::Cancel => InventoryEventType::ReservationCancelled,
            Finalize::Expire => InventoryEventType::ReservationExpired,
        }
    }
}

/// What the engine should do with a finalize request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TransitionDecision {
    /// Claim the reservation and write the stock change.
    Apply,
    /// Replay of a transition that already happened; return current state.
    AlreadyDone,
    /// The reservation outlived its ttl; expire it instead and reject the request.
    ExpireInstead,
}

/// Aggregate: Reservation.
///
/// Created PENDING by a successful reserve. CONFIRMED, CANCELLED and EXPIRED
/// are terminal. FINALIZING is held only while a finalizer's stock write is in
/// flight; it ends in the target status or falls back to PENDING.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub order_id: OrderId,
    pub key: StockKey,
    pub quantity: u64,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl Reservation {
    pub fn pending(
        order_id: OrderId,
        key: StockKey,
        quantity: u64,
        created_at: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Result<Self, DomainError> {
        if quantity == 0 {
            return Err(DomainError::validation("quantity must be positive"));
        }
        if ttl.is_zero() {
            return Err(DomainError::validation("ttl must be positive"));
        }
        let expires_at = Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| created_at.checked_add_signed(ttl))
            .ok_or_else(|| DomainError::validation("ttl out of range"))?;

        Ok(Self {
            order_id,
            key,
            quantity,
            status: ReservationStatus::Pending,
            created_at,
            expires_at,
            finalized_at: None,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.expires_at - self.created_at
    }

    /// Strictly after `created_at + ttl`.
    pub fn is_elapsed(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// PENDING and past its ttl: what the reaper looks for.
    pub fn is_expirable(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Pending && self.is_elapsed(now)
    }

    /// Whether a reserve request is a retry of the one that created `self`.
    pub fn matches_request(&self, key: StockKey, quantity: u64) -> bool {
        self.key == key && self.quantity == quantity
    }

    /// Decide how a finalize request applies to the current state.
    ///
    /// Same-outcome replays are no-ops. Cancelling an expired reservation is a
    /// no-op too: the stock is already back. Anything that would flip one
    /// terminal outcome into another is rejected. A reservation another
    /// finalizer is working on reports a conflict; its outcome is not known yet.
    pub fn decide(&self, action: Finalize, now: DateTime<Utc>) -> Result<TransitionDecision, DomainError> {
        use ReservationStatus::*;

        match (self.status, action) {
            (Finalizing, _) => Err(DomainError::conflict(format!(
                "reservation {} is being finalized",
                self.order_id
            ))),

            (Pending, Finalize::Confirm) if self.is_elapsed(now) => Ok(TransitionDecision::ExpireInstead),
            (Pending, Finalize::Expire) if !self.is_elapsed(now) => Err(DomainError::invalid_transition(
                format!("reservation {} has not reached its ttl", self.order_id),
            )),
            (Pending, _) => Ok(TransitionDecision::Apply),

            (Confirmed, Finalize::Confirm | Finalize::Expire) => Ok(TransitionDecision::AlreadyDone),
            (Cancelled | Expired, Finalize::Cancel | Finalize::Expire) => Ok(TransitionDecision::AlreadyDone),

            (status, action) => Err(DomainError::invalid_transition(format!(
                "cannot {action:?} reservation {} in state {status}",
                self.order_id
            ))),
        }
    }

    /// The reservation after a claimed transition.
    pub fn finalized(&self, action: Finalize, at: DateTime<Utc>) -> Self {
        Self {
            status: action.target(),
            finalized_at: Some(at),
            ..self.clone()
        }
    }
}
