use thiserror::Error;
use uuid::Uuid;

use crate::models::OrderStatus;
use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum OrchestrationError {
    #[error("Reservation slot {slot_id} is fully booked")]
    CapacityExhausted { slot_id: Uuid },
    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    #[error("Sub-order {sub_order_id} has no rider assigned")]
    RiderRequired { sub_order_id: Uuid },
    #[error("Offer {offer_id} is unavailable: {reason}")]
    OfferUnavailable {
        offer_id: Uuid,
        reason: UnavailableReason,
    },
    #[error("Sub-order {sub_order_id} was modified concurrently")]
    ConcurrencyConflict { sub_order_id: Uuid },
    #[error("Sub-order {sub_order_id} is not a delivery")]
    NotDispatchable { sub_order_id: Uuid },
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("Access denied: {0}")]
    AccessDenied(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Checkout has expired")]
    CheckoutExpired,
    #[error("Unexpected internal error")]
    Store(#[source] StoreError),
}

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum UnavailableReason {
    Expired,
    AlreadyResolved,
    AlreadyTaken,
    NotAvailable,
}

impl std::fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            UnavailableReason::Expired => "offer expired",
            UnavailableReason::AlreadyResolved => "offer already resolved",
            UnavailableReason::AlreadyTaken => "already taken by another rider",
            UnavailableReason::NotAvailable => "sub-order is not available",
        })
    }
}

impl OrchestrationError {
    /// Expected outcomes of a request, as opposed to system failures.
    pub fn is_user_facing(&self) -> bool {
        !matches!(
            self,
            OrchestrationError::Store(_) | OrchestrationError::ConcurrencyConflict { .. }
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, OrchestrationError::ConcurrencyConflict { .. })
    }

    pub fn offer_unavailable(offer_id: Uuid, reason: UnavailableReason) -> Self {
        OrchestrationError::OfferUnavailable { offer_id, reason }
    }
}

impl From<StoreError> for OrchestrationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => OrchestrationError::NotFound { entity, id },
            err => OrchestrationError::Store(err),
        }
    }
}

/// Logs a failed operation at the level its kind deserves and hands it back.
pub(crate) fn log_failure(operation: &str, err: OrchestrationError) -> OrchestrationError {
    if err.is_user_facing() {
        tracing::debug!(operation, error = %err, "request refused");
    } else if err.is_retryable() {
        tracing::warn!(operation, error = %err, "gave up after concurrent modifications");
    } else {
        tracing::error!(operation, error = ?err, "operation failed");
    }
    err
}

pub type Result<T, E = OrchestrationError> = std::result::Result<T, E>;
