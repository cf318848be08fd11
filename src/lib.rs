//! ridematch - hourly-rate ride booking broker
//!
//! Clients post ride requests, drivers bid competing hourly rates, and the
//! client picks one inside a bounded selection window. The core is the
//! request lifecycle state machine, kept consistent under concurrent
//! drivers, a racing expiry timer, and a realtime notification channel.
//!
//! # Modules
//!
//! - [`core_types`] - Identifier newtypes (RequestId, DriverId)
//! - [`config`] - Application configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Error taxonomy
//! - [`fees`] - Upfront fee and settlement math
//! - [`credit`] - Prepaid credit ledger
//! - [`request`] - RideRequest aggregate and status enums
//! - [`store`] - In-memory request registry with per-request locking
//! - [`drivers`] - Driver directory (profiles, availability, stats)
//! - [`gateway`] - Payment gateway seam
//! - [`notify`] - Per-request notification fan-out
//! - [`engine`] - The matching engine state machine
//! - [`timer`] - Expiry sweeper for overdue selection timers

pub mod config;
pub mod core_types;
pub mod credit;
pub mod drivers;
pub mod engine;
pub mod error;
pub mod fees;
pub mod gateway;
pub mod logging;
pub mod notify;
pub mod request;
pub mod store;
pub mod timer;

// Convenient re-exports at crate root
pub use config::{AppConfig, GatewayConfig, MatchingConfig};
pub use core_types::{DriverId, RequestId, SubscriberId};
pub use credit::{CreditAccount, CreditEntry, CreditIdentity, CreditKind, CreditLedger};
pub use drivers::{Driver, DriverDirectory, DriverProfile, VehicleInfo, VehicleKind};
pub use engine::{CreateRequest, MatchingEngine, TimerStatus};
pub use error::EngineError;
pub use fees::{DirectPayment, Settlement};
pub use gateway::{BoundedGateway, CheckoutSession, MockGateway, PaymentGateway};
pub use notify::{Notification, NotificationHub};
pub use request::{
    ChatMessage, ChatSender, ClientInfo, DriverOffer, OfferStatus, PaymentStatus, PickupLocation,
    RequestStatus, RideDetails, RideRequest, SelectionTimer,
};
pub use store::RequestStore;
pub use timer::{ExpirySweeper, SweeperConfig};
