//! Payment gateway seam
//!
//! The engine consumes an opaque checkout/capture/refund capability and
//! never depends on provider-specific fields. Concrete Stripe/PayPal
//! adapters live outside this crate; [`MockGateway`] backs tests and
//! local development.
//!
//! Every call goes through [`BoundedGateway`], which enforces the
//! configured timeout so a slow provider can never stall the request
//! state machine - the caller gets `GatewayTimeout` and may retry.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use crate::error::EngineError;

/// A created checkout the client must approve out-of-band
#[derive(Debug, Clone)]
pub struct CheckoutSession {
    pub checkout_ref: String,
    pub approval_url: String,
}

/// Settlement state of a checkout as reported by the provider
#[derive(Debug, Clone, Copy)]
pub struct PaymentState {
    pub paid: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct RefundOutcome {
    pub refunded: bool,
}

/// Opaque payment provider capability
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &'static str;

    async fn create_checkout(
        &self,
        amount: Decimal,
        currency: &str,
        description: &str,
    ) -> Result<CheckoutSession, EngineError>;

    async fn retrieve_status(&self, checkout_ref: &str) -> Result<PaymentState, EngineError>;

    async fn refund(
        &self,
        payment_ref: &str,
        amount: Option<Decimal>,
    ) -> Result<RefundOutcome, EngineError>;
}

/// Timeout-enforcing wrapper around any [`PaymentGateway`]
pub struct BoundedGateway {
    inner: Arc<dyn PaymentGateway>,
    call_timeout: Duration,
}

impl BoundedGateway {
    pub fn new(inner: Arc<dyn PaymentGateway>, call_timeout: Duration) -> Self {
        Self {
            inner,
            call_timeout,
        }
    }

    pub async fn create_checkout(
        &self,
        amount: Decimal,
        currency: &str,
        description: &str,
    ) -> Result<CheckoutSession, EngineError> {
        self.bounded(self.inner.create_checkout(amount, currency, description))
            .await
    }

    pub async fn retrieve_status(&self, checkout_ref: &str) -> Result<PaymentState, EngineError> {
        self.bounded(self.inner.retrieve_status(checkout_ref)).await
    }

    pub async fn refund(
        &self,
        payment_ref: &str,
        amount: Option<Decimal>,
    ) -> Result<RefundOutcome, EngineError> {
        self.bounded(self.inner.refund(payment_ref, amount)).await
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_elapsed) => {
                tracing::warn!(
                    gateway = self.inner.name(),
                    timeout_ms = self.call_timeout.as_millis() as u64,
                    "Gateway call timed out"
                );
                Err(EngineError::GatewayTimeout)
            }
        }
    }
}

/// In-memory gateway for tests and local development.
///
/// Checkouts are recorded on creation and report unpaid until marked paid
/// via [`MockGateway::settle`]. Failures and artificial latency can be
/// injected to exercise the timeout and retry paths.
pub struct MockGateway {
    checkouts: DashMap<String, bool>,
    create_count: AtomicUsize,
    status_count: AtomicUsize,
    refund_count: AtomicUsize,
    fail_create: parking_lot::Mutex<bool>,
    delay: parking_lot::Mutex<Option<Duration>>,
}

impl MockGateway {
    pub fn new() -> Self {
        Self {
            checkouts: DashMap::new(),
            create_count: AtomicUsize::new(0),
            status_count: AtomicUsize::new(0),
            refund_count: AtomicUsize::new(0),
            fail_create: parking_lot::Mutex::new(false),
            delay: parking_lot::Mutex::new(None),
        }
    }

    /// Mark a checkout as paid, as the provider webhook would
    pub fn settle(&self, checkout_ref: &str) {
        self.checkouts.insert(checkout_ref.to_string(), true);
    }

    /// Register an externally known checkout reference (paid or not)
    pub fn seed(&self, checkout_ref: &str, paid: bool) {
        self.checkouts.insert(checkout_ref.to_string(), paid);
    }

    pub fn set_fail_create(&self, fail: bool) {
        *self.fail_create.lock() = fail;
    }

    /// Inject latency into every call
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn create_count(&self) -> usize {
        self.create_count.load(Ordering::SeqCst)
    }

    pub fn status_count(&self) -> usize {
        self.status_count.load(Ordering::SeqCst)
    }

    pub fn refund_count(&self) -> usize {
        self.refund_count.load(Ordering::SeqCst)
    }

    async fn maybe_delay(&self) {
        let delay = *self.delay.lock();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PaymentGateway for MockGateway {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn create_checkout(
        &self,
        _amount: Decimal,
        _currency: &str,
        description: &str,
    ) -> Result<CheckoutSession, EngineError> {
        self.maybe_delay().await;
        self.create_count.fetch_add(1, Ordering::SeqCst);

        if *self.fail_create.lock() {
            return Err(EngineError::Gateway("checkout creation refused".into()));
        }

        let checkout_ref = uuid::Uuid::new_v4().to_string();
        self.checkouts.insert(checkout_ref.clone(), false);
        Ok(CheckoutSession {
            approval_url: format!("https://pay.invalid/approve/{checkout_ref}?d={description}"),
            checkout_ref,
        })
    }

    async fn retrieve_status(&self, checkout_ref: &str) -> Result<PaymentState, EngineError> {
        self.maybe_delay().await;
        self.status_count.fetch_add(1, Ordering::SeqCst);

        match self.checkouts.get(checkout_ref) {
            Some(paid) => Ok(PaymentState { paid: *paid }),
            None => Err(EngineError::Gateway(format!(
                "unknown checkout {checkout_ref}"
            ))),
        }
    }

    async fn refund(
        &self,
        payment_ref: &str,
        _amount: Option<Decimal>,
    ) -> Result<RefundOutcome, EngineError> {
        self.maybe_delay().await;
        self.refund_count.fetch_add(1, Ordering::SeqCst);

        if self.checkouts.get(payment_ref).map(|p| *p) == Some(true) {
            Ok(RefundOutcome { refunded: true })
        } else {
            Err(EngineError::Gateway(format!(
                "cannot refund unsettled payment {payment_ref}"
            )))
        }
    }
}
