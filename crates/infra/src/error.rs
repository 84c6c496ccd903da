//! Error taxonomy returned by the reservation engine.
//!
//! Every variant maps to one stable code string that callers can branch on
//! without parsing messages.

use thiserror::Error;

use stockguard_core::DomainError;

use crate::lock::LockError;
use crate::publisher::PublishError;
use crate::store::StoreError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReservationError {
    /// The lock could not be taken within the wait budget.
    #[error("lock unavailable for {key}: {reason}")]
    LockUnavailable { key: String, reason: String },

    #[error("insufficient stock (available: {available}, requested: {requested})")]
    InsufficientStock { available: u64, requested: u64 },

    /// Every version-checked attempt lost to a concurrent writer.
    #[error("concurrent modification of {key} after {attempts} attempts")]
    ConcurrentModification { key: String, attempts: u32 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {0}")]
    InvalidStateTransition(String),

    /// Only returned by explicit redelivery; normal operations never fail on publish.
    #[error("publish failed: {0}")]
    Publish(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl ReservationError {
    pub fn code(&self) -> &'static str {
        match self {
            ReservationError::LockUnavailable { .. } => "LOCK_UNAVAILABLE",
            ReservationError::InsufficientStock { .. } => "INSUFFICIENT_STOCK",
            ReservationError::ConcurrentModification { .. } => "CONCURRENT_MODIFICATION",
            ReservationError::NotFound(_) => "NOT_FOUND",
            ReservationError::InvalidStateTransition(_) => "INVALID_STATE_TRANSITION",
            ReservationError::Publish(_) => "PUBLISH_ERROR",
            ReservationError::InvalidRequest(_) => "INVALID_REQUEST",
            ReservationError::DeadlineExceeded(_) => "DEADLINE_EXCEEDED",
            ReservationError::Storage(_) => "STORAGE_ERROR",
        }
    }

    /// Whether the same request may succeed if simply sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ReservationError::LockUnavailable { .. }
                | ReservationError::ConcurrentModification { .. }
                | ReservationError::Publish(_)
                | ReservationError::DeadlineExceeded(_)
                | ReservationError::Storage(_)
        )
    }
}

impl From<DomainError> for ReservationError {
    fn from(value: DomainError) -> Self {
        match value {
            DomainError::InsufficientStock {
                available,
                requested,
            } => ReservationError::InsufficientStock {
                available,
                requested,
            },
            DomainError::InvalidTransition(msg) => ReservationError::InvalidStateTransition(msg),
            DomainError::Validation(msg)
            | DomainError::InvalidId(msg)
            | DomainError::InvariantViolation(msg) => ReservationError::InvalidRequest(msg),
            DomainError::Conflict(msg) => ReservationError::ConcurrentModification {
                key: msg,
                attempts: 1,
            },
        }
    }
}

impl From<StoreError> for ReservationError {
    fn from(value: StoreError) -> Self {
        ReservationError::Storage(value.to_string())
    }
}

impl From<PublishError> for ReservationError {
    fn from(value: PublishError) -> Self {
        ReservationError::Publish(value.to_string())
    }
}

impl From<LockError> for ReservationError {
    fn from(value: LockError) -> Self {
        let key = match &value {
            LockError::Timeout { key, .. } | LockError::Expired { key } => key.clone(),
            LockError::Backend(_) => String::new(),
        };
        ReservationError::LockUnavailable {
            key,
            reason: value.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            ReservationError::from(DomainError::InsufficientStock {
                available: 1,
                requested: 2
            })
            .code(),
            "INSUFFICIENT_STOCK"
        );
        assert_eq!(
            ReservationError::from(DomainError::validation("x")).code(),
            "INVALID_REQUEST"
        );
        assert_eq!(
            ReservationError::from(DomainError::invalid_transition("x")).code(),
            "INVALID_STATE_TRANSITION"
        );
        assert_eq!(
            ReservationError::from(StoreError::Unavailable("down".into())).code(),
            "STORAGE_ERROR"
        );
        let in_flight = ReservationError::from(DomainError::conflict("being finalized"));
        assert_eq!(in_flight.code(), "CONCURRENT_MODIFICATION");
        assert!(in_flight.is_retryable());
    }

    #[test]
    fn lock_errors_surface_as_lock_unavailable() {
        let err = ReservationError::from(LockError::Timeout {
            key: "inventory_lock:p:s".into(),
            waited: std::time::Duration::from_millis(5),
        });
        assert_eq!(err.code(), "LOCK_UNAVAILABLE");
        assert!(err.is_retryable());
    }

    #[test]
    fn business_rejections_are_not_retryable() {
        assert!(!ReservationError::NotFound("o".into()).is_retryable());
        assert!(!ReservationError::InvalidStateTransition("x".into()).is_retryable());
        assert!(!ReservationError::InsufficientStock {
            available: 0,
            requested: 1
        }
        .is_retryable());
    }
}
