//! RideRequest aggregate and its embedded records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::core_types::{DriverId, RequestId};

use super::status::{OfferStatus, PaymentStatus, RequestStatus};

/// Pickup point for a ride
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PickupLocation {
    pub address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Client contact details; at least one of phone/email is required
/// (validated at request creation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
}

/// One driver's hourly-rate bid against a request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverOffer {
    pub driver_id: DriverId,
    pub hourly_rate: Decimal,
    pub offered_at: DateTime<Utc>,
    pub status: OfferStatus,
}

/// Driver-selection countdown state
///
/// Persisted on the request so pending expirations survive a process
/// restart. `is_active` and `has_expired` are mutually exclusive; once
/// `has_expired` is set the timer never reactivates for this request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelectionTimer {
    pub started_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    /// Window length in seconds (default 3 minutes)
    pub window_secs: u64,
    pub is_active: bool,
    pub has_expired: bool,
}

impl SelectionTimer {
    /// Arm the timer for `window` starting at `now`
    pub fn start(&mut self, now: DateTime<Utc>, window: std::time::Duration) {
        self.started_at = Some(now);
        self.ends_at =
            Some(now + chrono::TimeDelta::from_std(window).unwrap_or_else(|_| chrono::TimeDelta::zero()));
        self.window_secs = window.as_secs();
        self.is_active = true;
        self.has_expired = false;
    }

    /// Disarm without expiring (driver accepted in time)
    pub fn stop(&mut self) {
        self.is_active = false;
    }

    /// Terminal flip; never undone
    pub fn mark_expired(&mut self) {
        self.is_active = false;
        self.has_expired = true;
    }

    /// An armed timer whose deadline has passed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.has_expired && self.ends_at.is_some_and(|ends| ends <= now)
    }

    /// Seconds left on an armed timer; zero otherwise
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> i64 {
        if !self.is_active || self.has_expired {
            return 0;
        }
        self.ends_at
            .map(|ends| (ends - now).num_seconds().max(0))
            .unwrap_or(0)
    }
}

/// Figures populated incrementally as the ride progresses; all fields are
/// set iff the request is `completed`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RideDetails {
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub actual_duration_hours: Option<u32>,
    pub final_cost: Option<Decimal>,
    pub platform_fee: Option<Decimal>,
    pub driver_earnings: Option<Decimal>,
}

/// Sender of a transcript message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatSender {
    Client,
    Driver,
    /// Engine-generated confirmation lines
    System,
}

/// Persisted transcript entry. The engine only appends system-generated
/// confirmations; client/driver chat flows through the external chat store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: ChatSender,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

/// The aggregate root of the ride lifecycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RideRequest {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub payment_status: PaymentStatus,
    pub pickup: PickupLocation,
    pub duration_hours: u32,
    pub client: ClientInfo,
    /// Fixed at creation; never recomputed or mutated afterwards
    pub upfront_fee: Decimal,
    /// Last payment-gateway checkout reference, if a checkout was created
    pub checkout_ref: Option<String>,
    pub offers: Vec<DriverOffer>,
    /// Set exactly once, on acceptance
    pub assigned_driver: Option<DriverId>,
    pub selection_timer: SelectionTimer,
    pub ride: RideDetails,
    /// Abandonment deadline for the initial pending request (distinct from
    /// the selection timer); used to garbage-collect abandoned requests
    pub expires_at: DateTime<Utc>,
    pub chat: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RideRequest {
    /// Create a new request in `pending`/`unpaid` with the abandonment TTL
    /// applied. The caller has already validated duration and identity and
    /// computed the upfront fee.
    pub fn new(
        pickup: PickupLocation,
        duration_hours: u32,
        client: ClientInfo,
        upfront_fee: Decimal,
        pending_ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            request_id: RequestId::new(),
            status: RequestStatus::Pending,
            payment_status: PaymentStatus::Unpaid,
            pickup,
            duration_hours,
            client,
            upfront_fee,
            checkout_ref: None,
            offers: Vec::new(),
            assigned_driver: None,
            selection_timer: SelectionTimer::default(),
            ride: RideDetails::default(),
            expires_at: now
                + chrono::TimeDelta::from_std(pending_ttl).unwrap_or_else(|_| chrono::TimeDelta::zero()),
            chat: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// The driver's non-rejected offer, if any. A driver may hold at most
    /// one open offer per request.
    pub fn open_offer(&self, driver_id: DriverId) -> Option<&DriverOffer> {
        self.offers
            .iter()
            .find(|o| o.driver_id == driver_id && o.status.is_open())
    }

    /// Past the abandonment TTL and still unmatched
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.status.is_open_for_offers() && self.expires_at <= now
    }

    /// Append a system confirmation line to the transcript
    pub fn push_system_message(&mut self, body: impl Into<String>) {
        self.chat.push(ChatMessage {
            sender: ChatSender::System,
            body: body.into(),
            sent_at: Utc::now(),
        });
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Structural invariant check used by tests: offer/driver/status
    /// consistency as observable at any time.
    pub fn check_invariants(&self) -> Result<(), String> {
        let accepted = self
            .offers
            .iter()
            .filter(|o| o.status == OfferStatus::Accepted)
            .count();
        if accepted > 1 {
            return Err(format!("{accepted} offers accepted at once"));
        }

        let assigned = matches!(
            self.status,
            RequestStatus::Matched | RequestStatus::InProgress | RequestStatus::Completed
        );
        if assigned != self.assigned_driver.is_some() {
            return Err(format!(
                "assigned_driver={:?} inconsistent with status {}",
                self.assigned_driver, self.status
            ));
        }

        if self.selection_timer.is_active && self.selection_timer.has_expired {
            return Err("timer both active and expired".to_string());
        }
        if self.selection_timer.has_expired
            && self.status != RequestStatus::Expired
            && self.assigned_driver.is_none()
        {
            return Err(format!(
                "timer expired but status is {} with no driver",
                self.status
            ));
        }
        Ok(())
    }
}
