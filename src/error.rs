//! Engine error types
//!
//! Every fallible operation in the crate surfaces one of these variants.
//! A failed transition leaves no partial side effect: callers can retry or
//! re-poll without reconciliation.

use thiserror::Error;

use crate::core_types::{DriverId, RequestId};

/// Ride lifecycle error taxonomy
///
/// Error codes are stable strings for API responses; `http_status` is an
/// advisory mapping for the (out-of-scope) HTTP layer.
#[derive(Error, Debug, Clone)]
pub enum EngineError {
    // === Validation Errors ===
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Ride duration must be between {min} and {max} hours")]
    DurationOutOfRange { min: u32, max: u32 },

    #[error("Client email or phone is required")]
    MissingIdentity,

    // === Lookup Errors ===
    #[error("Ride request not found: {0}")]
    RequestNotFound(RequestId),

    #[error("Driver not found: {0}")]
    DriverNotFound(DriverId),

    #[error("Driver {driver_id} has no offer on request {request_id}")]
    OfferNotFound {
        request_id: RequestId,
        driver_id: DriverId,
    },

    // === State Machine Errors ===
    #[error("Cannot {action} a request in status {from}")]
    InvalidStateTransition {
        from: &'static str,
        action: &'static str,
    },

    #[error("Driver already holds an open offer on this request")]
    DuplicateOffer,

    #[error("Driver is not available")]
    DriverUnavailable,

    #[error("Driver {0} is not assigned to this ride")]
    NotAssignedDriver(DriverId),

    #[error("Selection timer is already active")]
    TimerAlreadyActive,

    #[error("Selection timer has already expired")]
    TimerAlreadyExpired,

    /// Lost an accept/expire/cancel race; the request moved to another
    /// status between validation and commit. Re-poll current status.
    #[error("Request was concurrently modified; re-query its status")]
    ConcurrentConflict,

    // === Credit Errors ===
    #[error("Insufficient credits")]
    InsufficientFunds,

    #[error("Credit amount must be greater than zero")]
    NonPositiveAmount,

    // === Payment Gateway Errors ===
    #[error("Payment gateway call timed out")]
    GatewayTimeout,

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Payment has not been completed for checkout {0}")]
    PaymentNotCompleted(String),
}

impl EngineError {
    /// Get the error code for API responses
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::DurationOutOfRange { .. } => "DURATION_OUT_OF_RANGE",
            EngineError::MissingIdentity => "MISSING_IDENTITY",
            EngineError::RequestNotFound(_) => "REQUEST_NOT_FOUND",
            EngineError::DriverNotFound(_) => "DRIVER_NOT_FOUND",
            EngineError::OfferNotFound { .. } => "OFFER_NOT_FOUND",
            EngineError::InvalidStateTransition { .. } => "INVALID_STATE_TRANSITION",
            EngineError::DuplicateOffer => "DUPLICATE_OFFER",
            EngineError::DriverUnavailable => "DRIVER_UNAVAILABLE",
            EngineError::NotAssignedDriver(_) => "NOT_ASSIGNED_DRIVER",
            EngineError::TimerAlreadyActive => "TIMER_ALREADY_ACTIVE",
            EngineError::TimerAlreadyExpired => "TIMER_ALREADY_EXPIRED",
            EngineError::ConcurrentConflict => "CONCURRENT_CONFLICT",
            EngineError::InsufficientFunds => "INSUFFICIENT_CREDITS",
            EngineError::NonPositiveAmount => "NON_POSITIVE_AMOUNT",
            EngineError::GatewayTimeout => "GATEWAY_TIMEOUT",
            EngineError::Gateway(_) => "GATEWAY_ERROR",
            EngineError::PaymentNotCompleted(_) => "PAYMENT_NOT_COMPLETED",
        }
    }

    /// Get HTTP status code suggestion
    pub fn http_status(&self) -> u16 {
        match self {
            EngineError::Validation(_)
            | EngineError::DurationOutOfRange { .. }
            | EngineError::MissingIdentity
            | EngineError::DuplicateOffer
            | EngineError::TimerAlreadyActive
            | EngineError::NonPositiveAmount
            | EngineError::PaymentNotCompleted(_) => 400,
            EngineError::RequestNotFound(_)
            | EngineError::DriverNotFound(_)
            | EngineError::OfferNotFound { .. } => 404,
            EngineError::InvalidStateTransition { .. }
            | EngineError::TimerAlreadyExpired
            | EngineError::ConcurrentConflict => 409,
            EngineError::NotAssignedDriver(_) => 403,
            EngineError::DriverUnavailable | EngineError::InsufficientFunds => 422,
            EngineError::GatewayTimeout | EngineError::Gateway(_) => 502,
        }
    }

    /// Whether the caller may safely retry the same call
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::GatewayTimeout | EngineError::Gateway(_)
        )
    }
}
