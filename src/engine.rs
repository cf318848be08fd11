//! Matching engine - the ride-request lifecycle state machine
//!
//! Orchestrates every transition: creation, payment gating, offer
//! collection, acceptance, expiry, ride start/end, and cancellation.
//! The engine owns no state of its own; the request store and the credit
//! ledger are the single sources of truth, and each transition
//! re-validates against current state inside the request's critical
//! section (never against a cached copy).
//!
//! The accept/expire race is decided by that critical section: both
//! transitions re-check `status` under the same lock, so exactly one
//! commits and the loser aborts with no side effects.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use tracing::{info, warn};

use crate::config::{AppConfig, MatchingConfig};
use crate::core_types::{DriverId, RequestId};
use crate::credit::{CreditIdentity, CreditKind, CreditLedger};
use crate::drivers::DriverDirectory;
use crate::error::EngineError;
use crate::fees;
use crate::gateway::{BoundedGateway, CheckoutSession, PaymentGateway};
use crate::notify::NotificationHub;
use crate::request::{
    ClientInfo, DriverOffer, OfferStatus, PaymentStatus, PickupLocation, RequestStatus,
    RideRequest, SelectionTimer,
};
use crate::store::RequestStore;

/// Valid ride durations, in hours
pub const MIN_DURATION_HOURS: u32 = 1;
pub const MAX_DURATION_HOURS: u32 = 24;

/// Input for [`MatchingEngine::create_request`]
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub pickup: PickupLocation,
    pub duration_hours: u32,
    pub client: ClientInfo,
    /// Caller asserts pre-existing credit coverage; verified against the
    /// ledger before the request is created in `active`.
    pub has_credits: bool,
}

/// Timer state plus derived countdown, for status polls
#[derive(Debug, Clone)]
pub struct TimerStatus {
    pub timer: SelectionTimer,
    pub remaining_secs: i64,
}

/// The lifecycle coordinator. Cheap to share via `Arc`; all methods take
/// `&self` (or `&Arc<Self>` where they schedule deferred work).
pub struct MatchingEngine {
    store: Arc<RequestStore>,
    ledger: Arc<CreditLedger>,
    drivers: Arc<DriverDirectory>,
    hub: Arc<NotificationHub>,
    gateway: BoundedGateway,
    matching: MatchingConfig,
    currency: String,
    /// Checkout refs that already granted their bonus credit; keys are
    /// never removed, so a replayed confirmation grants nothing twice.
    granted_payments: dashmap::DashSet<String>,
}

impl MatchingEngine {
    pub fn new(
        store: Arc<RequestStore>,
        ledger: Arc<CreditLedger>,
        drivers: Arc<DriverDirectory>,
        hub: Arc<NotificationHub>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AppConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            ledger,
            drivers,
            hub,
            gateway: BoundedGateway::new(gateway, config.gateway.call_timeout()),
            matching: config.matching.clone(),
            currency: config.gateway.currency.clone(),
            granted_payments: dashmap::DashSet::new(),
        })
    }

    pub fn store(&self) -> &Arc<RequestStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn drivers(&self) -> &Arc<DriverDirectory> {
        &self.drivers
    }

    // ========================================================================
    // Transition 1: create
    // ========================================================================

    /// Create a ride request.
    ///
    /// With `has_credits` asserted the live balance is verified (>= 1) and
    /// the request starts in `active` with the selection timer armed;
    /// otherwise it starts `pending`/`unpaid` under the 5-minute
    /// abandonment TTL and waits for payment.
    pub fn create_request(
        self: &Arc<Self>,
        input: CreateRequest,
    ) -> Result<RideRequest, EngineError> {
        if !(MIN_DURATION_HOURS..=MAX_DURATION_HOURS).contains(&input.duration_hours) {
            return Err(EngineError::DurationOutOfRange {
                min: MIN_DURATION_HOURS,
                max: MAX_DURATION_HOURS,
            });
        }
        let identity = client_identity(&input.client)?;

        let upfront_fee = fees::upfront_fee(
            input.duration_hours,
            self.matching.base_fee,
            self.matching.per_hour_rate,
        );

        let mut request = RideRequest::new(
            input.pickup,
            input.duration_hours,
            input.client,
            upfront_fee,
            self.matching.pending_ttl(),
        );

        if input.has_credits {
            if self.ledger.balance(&identity) < Decimal::ONE {
                return Err(EngineError::InsufficientFunds);
            }
            request.status = RequestStatus::Active;
            request.payment_status = PaymentStatus::Paid;
            request
                .selection_timer
                .start(Utc::now(), self.matching.selection_window());
        }

        let request_id = request.request_id;
        let snapshot = request.clone();
        self.store.insert(request);

        info!(
            %request_id,
            status = %snapshot.status,
            fee = %snapshot.upfront_fee,
            "Ride request created"
        );

        self.hub.publish_all(
            "new-ride-request",
            json!({
                "requestId": request_id.to_string(),
                "pickupAddress": snapshot.pickup.address,
                "durationHours": snapshot.duration_hours,
                "upfrontFee": snapshot.upfront_fee,
            }),
        );

        if snapshot.selection_timer.is_active {
            self.publish_timer_started(&snapshot);
            self.schedule_expiry(request_id, self.matching.selection_window());
        }

        Ok(snapshot)
    }

    // ========================================================================
    // Transition 2: payment checkout + confirmation
    // ========================================================================

    /// Create a payment checkout for an unpaid pending request.
    ///
    /// No request lock is held across the gateway call: state is validated
    /// first, the call runs, and state is re-validated before the checkout
    /// ref is committed. Timeout or provider failure leaves the request
    /// exactly as it was, so the caller may retry.
    pub async fn create_payment(
        &self,
        request_id: RequestId,
    ) -> Result<CheckoutSession, EngineError> {
        let (amount, description) = self.store.read(request_id, |req| {
            if req.status != RequestStatus::Pending || req.payment_status != PaymentStatus::Unpaid {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "create a payment for",
                });
            }
            Ok((
                req.upfront_fee,
                format!("Ride payment - {}", req.request_id),
            ))
        })??;

        let session = self
            .gateway
            .create_checkout(amount, &self.currency, &description)
            .await?;

        self.store.update(request_id, |req| {
            if req.status != RequestStatus::Pending || req.payment_status != PaymentStatus::Unpaid {
                // Paid or expired while we were talking to the provider
                return Err(EngineError::ConcurrentConflict);
            }
            req.checkout_ref = Some(session.checkout_ref.clone());
            Ok(())
        })?;

        info!(%request_id, checkout_ref = %session.checkout_ref, "Checkout created");
        Ok(session)
    }

    /// Apply an external payment-success callback.
    ///
    /// Verifies the checkout with the gateway, marks the request `paid`
    /// (it stays `pending` until an acceptance consumes the credit), and
    /// grants the payer one bonus credit - exactly once per checkout ref.
    pub async fn confirm_payment(
        &self,
        request_id: RequestId,
        checkout_ref: &str,
    ) -> Result<RideRequest, EngineError> {
        let state = self.gateway.retrieve_status(checkout_ref).await?;
        if !state.paid {
            return Err(EngineError::PaymentNotCompleted(checkout_ref.to_string()));
        }

        let client = self.store.update(request_id, |req| {
            if req.status.is_terminal() {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "confirm a payment for",
                });
            }
            req.payment_status = PaymentStatus::Paid;
            if req.checkout_ref.is_none() {
                req.checkout_ref = Some(checkout_ref.to_string());
            }
            Ok(req.client.clone())
        })?;

        // Bonus credit is keyed by the checkout ref: a replayed callback
        // flips payment_status idempotently but grants nothing twice.
        if self.granted_payments.insert(checkout_ref.to_string()) {
            let identity = client_identity(&client)?;
            self.ledger.credit(
                &identity,
                self.matching.credits_per_payment,
                CreditKind::Credit,
                "payment bonus credit",
                Some(request_id),
            )?;
        }

        self.hub.publish(
            request_id,
            "payment-confirmed",
            json!({ "requestId": request_id.to_string() }),
        );

        self.store.snapshot(request_id)
    }

    // ========================================================================
    // Transition 3: submit-offer
    // ========================================================================

    /// Driver bids their current hourly rate against an open request.
    pub fn submit_offer(
        &self,
        request_id: RequestId,
        driver_id: DriverId,
    ) -> Result<DriverOffer, EngineError> {
        self.expire_if_due(request_id)?;

        let driver = self.drivers.get(driver_id)?;
        if !driver.is_available {
            return Err(EngineError::DriverUnavailable);
        }

        let offer = self.store.update(request_id, |req| {
            if !req.status.is_open_for_offers() {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "offer on",
                });
            }
            if req.is_abandoned(Utc::now()) {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "offer on an abandoned",
                });
            }
            if req.open_offer(driver_id).is_some() {
                return Err(EngineError::DuplicateOffer);
            }

            let offer = DriverOffer {
                driver_id,
                hourly_rate: driver.hourly_rate,
                offered_at: Utc::now(),
                status: OfferStatus::Pending,
            };
            req.offers.push(offer.clone());
            Ok(offer)
        })?;

        info!(%request_id, driver_id, rate = %offer.hourly_rate, "Driver offer submitted");
        self.hub.publish(
            request_id,
            "new-driver-offer",
            json!({
                "requestId": request_id.to_string(),
                "driverId": driver_id,
                "driverName": driver.name,
                "vehicle": driver.vehicle.kind.to_string(),
                "hourlyRate": offer.hourly_rate,
                "rating": driver.rating,
            }),
        );

        Ok(offer)
    }

    // ========================================================================
    // Transition 4: accept-offer (races transition 5)
    // ========================================================================

    /// Client accepts one driver's offer.
    ///
    /// Payment coverage is re-checked at accept time, one credit is
    /// debited, and the match commits - all inside the request's critical
    /// section. Losing the race against expiry surfaces as
    /// `ConcurrentConflict` with no credit movement.
    pub fn accept_offer(
        &self,
        request_id: RequestId,
        driver_id: DriverId,
    ) -> Result<RideRequest, EngineError> {
        self.expire_if_due(request_id)?;

        let rejected = self.store.update(request_id, |req| {
            match req.status {
                s if s.is_open_for_offers() => {}
                RequestStatus::Expired => return Err(EngineError::ConcurrentConflict),
                s => {
                    return Err(EngineError::InvalidStateTransition {
                        from: s.as_str(),
                        action: "accept a driver for",
                    });
                }
            }

            if req.open_offer(driver_id).is_none() {
                return Err(EngineError::OfferNotFound {
                    request_id,
                    driver_id,
                });
            }

            // Coverage re-check: the paid flag or a live credit balance.
            // Creation-time state is not trusted here.
            let identity = client_identity(&req.client)?;
            if req.payment_status != PaymentStatus::Paid
                && self.ledger.balance(&identity) < Decimal::ONE
            {
                return Err(EngineError::InsufficientFunds);
            }

            // Selecting a driver always consumes one credit. This is the
            // last fallible step: a failed debit aborts the transition
            // with the request untouched.
            self.ledger
                .debit(&identity, Decimal::ONE, "driver selection", Some(request_id))?;

            let mut rejected = Vec::new();
            for offer in &mut req.offers {
                if offer.driver_id == driver_id {
                    offer.status = OfferStatus::Accepted;
                } else if offer.status != OfferStatus::Rejected {
                    offer.status = OfferStatus::Rejected;
                    rejected.push(offer.driver_id);
                }
            }
            req.assigned_driver = Some(driver_id);
            req.status = RequestStatus::Matched;
            req.selection_timer.stop();
            req.push_system_message(format!("Driver {driver_id} confirmed for this ride."));
            Ok(rejected)
        })?;

        if let Err(e) = self.drivers.mark_unavailable(driver_id) {
            warn!(%request_id, driver_id, error = %e, "Could not mark driver unavailable");
        }

        info!(%request_id, driver_id, rejected = rejected.len(), "Driver accepted");
        self.hub.publish(
            request_id,
            "ride-accepted",
            json!({
                "requestId": request_id.to_string(),
                "driverId": driver_id,
            }),
        );
        for loser in rejected {
            self.hub.publish_all(
                "ride-rejected",
                json!({
                    "requestId": request_id.to_string(),
                    "driverId": loser,
                }),
            );
        }

        self.store.snapshot(request_id)
    }

    // ========================================================================
    // Transition 5: expire (races transition 4)
    // ========================================================================

    /// Expire an unmatched request whose selection window elapsed.
    ///
    /// Strictly a no-op (`Ok(false)`) when the request already left the
    /// eligible states or the timer was never armed / already fired - a
    /// second invocation can never produce a second refund. The scheduled
    /// task, the sweeper, and lazy reads all funnel into this one guarded
    /// transition.
    pub fn expire(&self, request_id: RequestId) -> Result<bool, EngineError> {
        let fired = self.store.update(request_id, |req| {
            if !req.status.is_open_for_offers()
                || !req.selection_timer.is_active
                || req.selection_timer.has_expired
            {
                return Ok(false);
            }

            req.selection_timer.mark_expired();
            req.status = RequestStatus::Expired;

            // Refund rides on winning this guarded transition, so it fires
            // at most once per request. Same identity contract as the
            // debit path.
            let identity = client_identity(&req.client)?;
            self.ledger.credit(
                &identity,
                Decimal::ONE,
                CreditKind::Refund,
                "timer expiry refund",
                Some(request_id),
            )?;
            Ok(true)
        })?;

        if fired {
            info!(%request_id, "Selection window expired, credit refunded");
            self.hub.publish(
                request_id,
                "timer-expired",
                json!({
                    "requestId": request_id.to_string(),
                    "message": "Driver selection time expired. Credit has been refunded to your account.",
                }),
            );
            self.hub.publish_all(
                "ride-expired",
                json!({ "requestId": request_id.to_string() }),
            );
        }

        Ok(fired)
    }

    // ========================================================================
    // Timer control
    // ========================================================================

    /// Arm the selection timer on a pending request (payment flow done,
    /// client is now choosing). Flips the request to `active`.
    pub fn start_selection_timer(
        self: &Arc<Self>,
        request_id: RequestId,
    ) -> Result<RideRequest, EngineError> {
        let window = self.matching.selection_window();
        self.store.update(request_id, |req| {
            if !req.status.is_open_for_offers() {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "start the timer on",
                });
            }
            if req.selection_timer.has_expired {
                return Err(EngineError::TimerAlreadyExpired);
            }
            if req.selection_timer.is_active {
                return Err(EngineError::TimerAlreadyActive);
            }
            req.selection_timer.start(Utc::now(), window);
            req.status = RequestStatus::Active;
            Ok(())
        })?;

        let snapshot = self.store.snapshot(request_id)?;
        self.publish_timer_started(&snapshot);
        self.schedule_expiry(request_id, window);
        Ok(snapshot)
    }

    /// Spawn the delayed expiry check. The timer state itself lives on
    /// the persisted request; this task is only the prompt path, with the
    /// sweeper and lazy reads as safety nets behind it.
    fn schedule_expiry(self: &Arc<Self>, request_id: RequestId, window: std::time::Duration) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            match engine.expire(request_id) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(%request_id, "Scheduled expiry found nothing to do");
                }
                Err(e) => warn!(%request_id, error = %e, "Scheduled expiry failed"),
            }
        });
    }

    /// Lazy expiry: any read that observes an overdue armed timer settles
    /// it before proceeding. Self-healing when the scheduled task was
    /// lost (e.g. across a restart).
    fn expire_if_due(&self, request_id: RequestId) -> Result<(), EngineError> {
        let due = self
            .store
            .read(request_id, |req| req.selection_timer.is_due(Utc::now()))?;
        if due {
            self.expire(request_id)?;
        }
        Ok(())
    }

    // ========================================================================
    // Transitions 6/7: ride start and end
    // ========================================================================

    /// Assigned driver starts the ride.
    pub fn start_ride(
        &self,
        request_id: RequestId,
        driver_id: DriverId,
    ) -> Result<RideRequest, EngineError> {
        self.store.update(request_id, |req| {
            if req.status != RequestStatus::Matched {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "start",
                });
            }
            if req.assigned_driver != Some(driver_id) {
                return Err(EngineError::NotAssignedDriver(driver_id));
            }
            req.status = RequestStatus::InProgress;
            req.ride.started_at = Some(Utc::now());
            Ok(())
        })?;

        info!(%request_id, driver_id, "Ride started");
        self.hub.publish(
            request_id,
            "ride-started",
            json!({ "requestId": request_id.to_string() }),
        );
        self.store.snapshot(request_id)
    }

    /// Assigned driver ends the ride: billable hours are ceiled, the
    /// settlement is computed once and persisted, and the driver is
    /// released with updated aggregates.
    pub fn end_ride(
        &self,
        request_id: RequestId,
        driver_id: DriverId,
    ) -> Result<RideRequest, EngineError> {
        let platform_fee_percent = self.matching.platform_fee_percent;
        let earnings = self.store.update(request_id, |req| {
            if req.status != RequestStatus::InProgress {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "end",
                });
            }
            if req.assigned_driver != Some(driver_id) {
                return Err(EngineError::NotAssignedDriver(driver_id));
            }

            // The agreed price is the accepted offer's rate, frozen at
            // acceptance; the driver's directory rate may have moved since.
            let hourly_rate = req
                .offers
                .iter()
                .find(|o| o.status == OfferStatus::Accepted)
                .map(|o| o.hourly_rate)
                .ok_or(EngineError::OfferNotFound {
                    request_id,
                    driver_id,
                })?;

            let ended_at = Utc::now();
            let started_at = req.ride.started_at.unwrap_or(ended_at);
            let hours = fees::actual_hours(started_at, ended_at);
            let settlement = fees::settlement(hourly_rate, hours, platform_fee_percent);

            req.ride.ended_at = Some(ended_at);
            req.ride.actual_duration_hours = Some(hours);
            req.ride.final_cost = Some(settlement.final_cost);
            req.ride.platform_fee = Some(settlement.platform_fee);
            req.ride.driver_earnings = Some(settlement.driver_earnings);
            req.status = RequestStatus::Completed;
            req.push_system_message(format!(
                "Ride completed: {hours}h at {hourly_rate}/h, total {}.",
                settlement.final_cost
            ));
            Ok(settlement.driver_earnings)
        })?;

        if let Err(e) = self.drivers.record_completed_ride(driver_id, earnings) {
            warn!(%request_id, driver_id, error = %e, "Could not update driver stats");
        }

        info!(%request_id, driver_id, %earnings, "Ride completed");
        let snapshot = self.store.snapshot(request_id)?;
        self.hub.publish(
            request_id,
            "ride-completed",
            json!({
                "requestId": request_id.to_string(),
                "actualDurationHours": snapshot.ride.actual_duration_hours,
                "finalCost": snapshot.ride.final_cost,
                "driverEarnings": snapshot.ride.driver_earnings,
            }),
        );
        Ok(snapshot)
    }

    // ========================================================================
    // Transition 8: cancel
    // ========================================================================

    /// Cancel from any non-terminal state; releases an assigned driver.
    /// No automatic refund - expiry is the only compensated path.
    pub fn cancel(
        &self,
        request_id: RequestId,
        reason: Option<&str>,
    ) -> Result<RideRequest, EngineError> {
        let released = self.store.update(request_id, |req| {
            if !req.status.can_cancel() {
                return Err(EngineError::InvalidStateTransition {
                    from: req.status.as_str(),
                    action: "cancel",
                });
            }
            req.status = RequestStatus::Cancelled;
            req.selection_timer.stop();
            Ok(req.assigned_driver)
        })?;

        if let Some(driver_id) = released
            && let Err(e) = self.drivers.mark_available(driver_id)
        {
            warn!(%request_id, driver_id, error = %e, "Could not release driver");
        }

        info!(%request_id, reason = ?reason, "Ride cancelled");
        self.hub.publish_all(
            "ride-cancelled",
            json!({
                "requestId": request_id.to_string(),
                "reason": reason,
            }),
        );
        self.store.snapshot(request_id)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current request state. Settles an overdue timer first, so callers
    /// never observe an armed timer past its deadline.
    pub fn get_request(&self, request_id: RequestId) -> Result<RideRequest, EngineError> {
        self.expire_if_due(request_id)?;
        self.store.snapshot(request_id)
    }

    /// Timer state with the derived countdown
    pub fn timer_status(&self, request_id: RequestId) -> Result<TimerStatus, EngineError> {
        self.expire_if_due(request_id)?;
        self.store.read(request_id, |req| TimerStatus {
            timer: req.selection_timer.clone(),
            remaining_secs: req.selection_timer.remaining_secs(Utc::now()),
        })
    }

    /// Requests still open to the driver pool, newest first
    pub fn list_open_requests(&self) -> Vec<RideRequest> {
        self.store.list_open(Utc::now())
    }

    /// A driver's matched/in-progress rides, newest first
    pub fn driver_active_rides(&self, driver_id: DriverId) -> Vec<RideRequest> {
        self.store.driver_rides(driver_id)
    }

    fn publish_timer_started(&self, request: &RideRequest) {
        self.hub.publish(
            request.request_id,
            "timer-started",
            json!({
                "requestId": request.request_id.to_string(),
                "startedAt": request.selection_timer.started_at,
                "endsAt": request.selection_timer.ends_at,
                "windowSecs": request.selection_timer.window_secs,
            }),
        );
    }
}

fn client_identity(client: &ClientInfo) -> Result<CreditIdentity, EngineError> {
    CreditIdentity::new(client.email.as_deref(), client.phone.as_deref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::{DriverProfile, VehicleInfo, VehicleKind};
    use crate::gateway::MockGateway;
    use rust_decimal_macros::dec;

    fn test_engine() -> Arc<MatchingEngine> {
        let config = AppConfig::default();
        MatchingEngine::new(
            Arc::new(RequestStore::new()),
            Arc::new(CreditLedger::new()),
            Arc::new(DriverDirectory::new()),
            Arc::new(NotificationHub::new()),
            Arc::new(MockGateway::new()),
            &config,
        )
    }

    fn client() -> ClientInfo {
        ClientInfo {
            name: "Ana".into(),
            phone: Some("555-0101".into()),
            email: Some("ana@example.com".into()),
        }
    }

    fn identity() -> CreditIdentity {
        CreditIdentity::new(Some("ana@example.com"), Some("555-0101")).unwrap()
    }

    fn create_input(duration: u32, has_credits: bool) -> CreateRequest {
        CreateRequest {
            pickup: PickupLocation {
                address: "Calle 10 #43-12".into(),
                latitude: None,
                longitude: None,
            },
            duration_hours: duration,
            client: client(),
            has_credits,
        }
    }

    fn register_driver(engine: &MatchingEngine, rate: Decimal) -> DriverId {
        engine.drivers.register(DriverProfile {
            name: "Carlos".into(),
            phone: "555-0150".into(),
            vehicle: VehicleInfo {
                kind: VehicleKind::Sedan,
                model: "Spark GT".into(),
                plate: "ABC123".into(),
            },
            hourly_rate: rate,
        })
    }

    #[tokio::test]
    async fn test_create_pending_without_credits() {
        let engine = test_engine();
        let req = engine.create_request(create_input(3, false)).unwrap();

        assert_eq!(req.status, RequestStatus::Pending);
        assert_eq!(req.payment_status, PaymentStatus::Unpaid);
        assert_eq!(req.upfront_fee, dec!(11)); // 5 + 3*2
        assert!(!req.selection_timer.is_active);
        req.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_create_with_credits_verifies_balance() {
        let engine = test_engine();
        // Asserting credits without holding any fails closed
        assert!(matches!(
            engine.create_request(create_input(3, true)),
            Err(EngineError::InsufficientFunds)
        ));

        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(3, true)).unwrap();
        assert_eq!(req.status, RequestStatus::Active);
        assert_eq!(req.payment_status, PaymentStatus::Paid);
        assert!(req.selection_timer.is_active);
    }

    #[tokio::test]
    async fn test_duration_bounds() {
        let engine = test_engine();
        assert!(matches!(
            engine.create_request(create_input(0, false)),
            Err(EngineError::DurationOutOfRange { .. })
        ));
        assert!(matches!(
            engine.create_request(create_input(25, false)),
            Err(EngineError::DurationOutOfRange { .. })
        ));
        assert!(engine.create_request(create_input(24, false)).is_ok());
    }

    #[tokio::test]
    async fn test_offer_and_duplicate() {
        let engine = test_engine();
        let req = engine.create_request(create_input(2, false)).unwrap();
        let driver = register_driver(&engine, dec!(15));

        let offer = engine.submit_offer(req.request_id, driver).unwrap();
        assert_eq!(offer.status, OfferStatus::Pending);
        assert_eq!(offer.hourly_rate, dec!(15));

        assert!(matches!(
            engine.submit_offer(req.request_id, driver),
            Err(EngineError::DuplicateOffer)
        ));
    }

    #[tokio::test]
    async fn test_accept_debits_one_credit_and_rejects_losers() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();
        let winner = register_driver(&engine, dec!(15));
        let loser = register_driver(&engine, dec!(18));
        engine.submit_offer(req.request_id, winner).unwrap();
        engine.submit_offer(req.request_id, loser).unwrap();

        let matched = engine.accept_offer(req.request_id, winner).unwrap();
        assert_eq!(matched.status, RequestStatus::Matched);
        assert_eq!(matched.assigned_driver, Some(winner));
        assert!(!matched.selection_timer.is_active);
        assert_eq!(engine.ledger.balance(&identity()), dec!(0));

        let statuses: Vec<_> = matched.offers.iter().map(|o| o.status).collect();
        assert_eq!(statuses, vec![OfferStatus::Accepted, OfferStatus::Rejected]);
        assert!(!engine.drivers.is_available(winner).unwrap());
        matched.check_invariants().unwrap();

        // A second accept is an invalid transition, not a second debit
        assert!(engine.accept_offer(req.request_id, loser).is_err());
        assert_eq!(engine.ledger.balance(&identity()), dec!(0));
    }

    #[tokio::test]
    async fn test_accept_without_coverage_fails() {
        let engine = test_engine();
        let req = engine.create_request(create_input(2, false)).unwrap();
        let driver = register_driver(&engine, dec!(15));
        engine.submit_offer(req.request_id, driver).unwrap();

        assert!(matches!(
            engine.accept_offer(req.request_id, driver),
            Err(EngineError::InsufficientFunds)
        ));
        let snapshot = engine.get_request(req.request_id).unwrap();
        assert_eq!(snapshot.status, RequestStatus::Pending);
        assert!(snapshot.assigned_driver.is_none());
    }

    #[tokio::test]
    async fn test_expire_is_idempotent_and_refunds_once() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();

        assert!(engine.expire(req.request_id).unwrap());
        assert!(!engine.expire(req.request_id).unwrap());

        let snapshot = engine.get_request(req.request_id).unwrap();
        assert_eq!(snapshot.status, RequestStatus::Expired);
        assert!(snapshot.selection_timer.has_expired);
        // One refund only: 1 (topup) - 0 (never debited) + 1 (refund) = 2
        assert_eq!(engine.ledger.balance(&identity()), dec!(2));
        snapshot.check_invariants().unwrap();
    }

    #[tokio::test]
    async fn test_expire_noop_after_match() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();
        let driver = register_driver(&engine, dec!(15));
        engine.submit_offer(req.request_id, driver).unwrap();
        engine.accept_offer(req.request_id, driver).unwrap();

        assert!(!engine.expire(req.request_id).unwrap());
        assert_eq!(
            engine.get_request(req.request_id).unwrap().status,
            RequestStatus::Matched
        );
        // Debited at accept, no refund afterwards
        assert_eq!(engine.ledger.balance(&identity()), dec!(0));
    }

    #[tokio::test]
    async fn test_ride_start_end_settlement() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();
        let driver = register_driver(&engine, dec!(15));
        engine.submit_offer(req.request_id, driver).unwrap();
        engine.accept_offer(req.request_id, driver).unwrap();

        let stranger = register_driver(&engine, dec!(10));
        assert!(matches!(
            engine.start_ride(req.request_id, stranger),
            Err(EngineError::NotAssignedDriver(_))
        ));

        engine.start_ride(req.request_id, driver).unwrap();

        // Backdate the start so the measured duration is 2h15m -> 3 billable hours
        engine
            .store
            .update(req.request_id, |r| {
                r.ride.started_at = Some(Utc::now() - chrono::TimeDelta::minutes(135));
                Ok(())
            })
            .unwrap();

        let done = engine.end_ride(req.request_id, driver).unwrap();
        assert_eq!(done.status, RequestStatus::Completed);
        assert_eq!(done.ride.actual_duration_hours, Some(3));
        assert_eq!(done.ride.final_cost, Some(dec!(45)));
        assert_eq!(done.ride.platform_fee, Some(dec!(4.50)));
        assert_eq!(done.ride.driver_earnings, Some(dec!(40.50)));
        done.check_invariants().unwrap();

        let profile = engine.drivers.get(driver).unwrap();
        assert_eq!(profile.total_rides, 1);
        assert_eq!(profile.total_earnings, dec!(40.50));
        assert!(profile.is_available);
    }

    #[tokio::test]
    async fn test_settlement_uses_offer_rate_not_current_rate() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();
        let driver = register_driver(&engine, dec!(15));
        engine.submit_offer(req.request_id, driver).unwrap();
        engine.accept_offer(req.request_id, driver).unwrap();
        engine.start_ride(req.request_id, driver).unwrap();

        // The driver raising their directory rate mid-ride changes nothing:
        // the accepted offer froze the agreed price
        engine.drivers.set_hourly_rate(driver, dec!(99)).unwrap();

        let done = engine.end_ride(req.request_id, driver).unwrap();
        assert_eq!(done.ride.final_cost, Some(dec!(15))); // 1h minimum at the agreed 15/h
    }

    #[tokio::test]
    async fn test_cancel_releases_driver_no_refund() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();
        let driver = register_driver(&engine, dec!(15));
        engine.submit_offer(req.request_id, driver).unwrap();
        engine.accept_offer(req.request_id, driver).unwrap();

        let cancelled = engine.cancel(req.request_id, Some("change of plans")).unwrap();
        assert_eq!(cancelled.status, RequestStatus::Cancelled);
        assert!(engine.drivers.is_available(driver).unwrap());
        // Cancellation is not compensated; the debited credit stays spent
        assert_eq!(engine.ledger.balance(&identity()), dec!(0));

        assert!(matches!(
            engine.cancel(req.request_id, None),
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancel_completed_rejected() {
        let engine = test_engine();
        engine
            .ledger
            .credit(&identity(), dec!(1), CreditKind::Credit, "topup", None)
            .unwrap();
        let req = engine.create_request(create_input(2, true)).unwrap();
        let driver = register_driver(&engine, dec!(15));
        engine.submit_offer(req.request_id, driver).unwrap();
        engine.accept_offer(req.request_id, driver).unwrap();
        engine.start_ride(req.request_id, driver).unwrap();
        engine.end_ride(req.request_id, driver).unwrap();

        assert!(matches!(
            engine.cancel(req.request_id, None),
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_request() {
        let engine = test_engine();
        assert!(matches!(
            engine.get_request(RequestId::new()),
            Err(EngineError::RequestNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_explicit_timer_start() {
        let engine = test_engine();
        let req = engine.create_request(create_input(2, false)).unwrap();
        assert_eq!(req.status, RequestStatus::Pending);

        let active = engine.start_selection_timer(req.request_id).unwrap();
        assert_eq!(active.status, RequestStatus::Active);
        assert!(active.selection_timer.is_active);

        assert!(matches!(
            engine.start_selection_timer(req.request_id),
            Err(EngineError::TimerAlreadyActive)
        ));

        engine.expire(req.request_id).unwrap();
        assert!(matches!(
            engine.start_selection_timer(req.request_id),
            Err(EngineError::InvalidStateTransition { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_open_requests() {
        let engine = test_engine();
        let open = engine.create_request(create_input(2, false)).unwrap();
        let doomed = engine.create_request(create_input(3, false)).unwrap();
        engine.cancel(doomed.request_id, None).unwrap();

        let listed = engine.list_open_requests();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].request_id, open.request_id);
    }
}
