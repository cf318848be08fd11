//! Ride request state definitions
//!
//! Status transitions are monotonic:
//! `pending -> active -> matched -> in_progress -> completed`, with side
//! branches to `expired` (from pending/active) and `cancelled` (from any
//! non-completed state).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a ride request
///
/// Terminal states: `Completed`, `Cancelled`, `Expired`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Created, payment not yet confirmed, timer not started
    Pending,
    /// Payment/credit coverage established, selection timer running
    Active,
    /// A driver offer was accepted; awaiting ride start
    Matched,
    /// Ride underway
    InProgress,
    /// Terminal: ride ended and settled
    Completed,
    /// Terminal: cancelled by either party
    Cancelled,
    /// Terminal: selection window elapsed without an acceptance
    Expired,
}

impl RequestStatus {
    /// Check if this is a terminal state (no more transitions possible)
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Cancelled | RequestStatus::Expired
        )
    }

    /// States in which drivers may submit offers and the client may accept
    #[inline]
    pub fn is_open_for_offers(&self) -> bool {
        matches!(self, RequestStatus::Pending | RequestStatus::Active)
    }

    /// States in which cancellation is legal
    #[inline]
    pub fn can_cancel(&self) -> bool {
        !self.is_terminal()
    }

    /// Get human-readable status name
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Active => "active",
            RequestStatus::Matched => "matched",
            RequestStatus::InProgress => "in_progress",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
            RequestStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payment state of a ride request, orthogonal to the lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a single driver offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
}

impl OfferStatus {
    /// An open offer blocks the same driver from offering again
    #[inline]
    pub fn is_open(&self) -> bool {
        !matches!(self, OfferStatus::Rejected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
