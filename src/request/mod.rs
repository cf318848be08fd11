//! Ride request aggregate
//!
//! The [`RideRequest`] is the aggregate root of the lifecycle state
//! machine. Status enums carry their own transition predicates; the
//! engine is the only writer.

pub mod model;
pub mod status;

pub use model::{
    ChatMessage, ChatSender, ClientInfo, DriverOffer, PickupLocation, RideDetails, RideRequest,
    SelectionTimer,
};
pub use status::{OfferStatus, PaymentStatus, RequestStatus};
