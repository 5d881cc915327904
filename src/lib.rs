//! Storefront Pricing Engine
//!
//! Turns a cart, an optional coupon code, a delivery destination and a chosen
//! courier into one authoritative price breakdown, and decides whether a
//! coupon may legally apply to a cart for a user.
//!
//! ## Pieces
//! - Cart normalization over guest and server shapes
//! - Coupon validation and applicable-coupon listing
//! - Courier quote resolution with the free-shipping rule
//! - Pure price reconciliation (subtotal, discount, shipping, GST, total)
//! - Server-authoritative checkout preview with idempotent submission

pub mod domain;
pub mod engine;
pub mod ports;

use thiserror::Error;

use crate::engine::coupon::CouponError;
use crate::engine::shipping::ShippingError;

/// Failure taxonomy crossing module boundaries. Everything user-visible or
/// retryable is explicit; nothing propagates as a panic.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Bad, ineligible or expired coupon. Non-retryable without a different
    /// code.
    #[error("coupon rejected: {0}")]
    Validation(#[from] CouponError),

    /// No courier serves the destination; needs a different address.
    #[error("destination {pincode} is not serviceable")]
    NotServiceable { pincode: String },

    /// A dependent input changed since the last computed result; recompute
    /// before trusting anything.
    #[error("pricing inputs changed; recompute required")]
    Stale,

    /// Transient provider failure. One bounded retry, then surfaced as a
    /// dismissible warning while last-known values stay in place.
    #[error("provider error: {0}")]
    Network(String),

    /// State moved underneath the request (stock, duplicate submit path);
    /// blocks checkout until the cart is edited.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<ShippingError> for EngineError {
    fn from(e: ShippingError) -> Self {
        match e {
            ShippingError::NotServiceable { pincode } => EngineError::NotServiceable { pincode },
            ShippingError::UnknownCourier(id) => EngineError::Conflict(format!("unknown courier {id}")),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

pub use domain::aggregates::cart::{Cart, CartLine, CartSnapshot, CartSource};
pub use domain::aggregates::order::{Order, OrderReceipt};
pub use domain::value_objects::{Money, Pincode, Quantity};
pub use engine::coupon::{Coupon, CouponApplication, UserContext};
pub use engine::pricing::{reconcile, AppliedCoupon, PriceBreakdown};
pub use engine::preview::OrderPreviewService;
pub use engine::session::CheckoutSession;
pub use engine::shipping::{CourierQuote, Parcel, ShippingQuoteSet, ShippingSelection};
pub use engine::EngineConfig;
