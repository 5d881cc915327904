//! Pricing engine: coupon validation, shipping resolution, price
//! reconciliation, session reactivity and the checkout-time preview.

pub mod coupon;
pub mod pricing;
pub mod preview;
pub mod session;
pub mod shipping;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Engine-wide policy knobs, read once from the environment at startup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    pub currency: String,
    /// Flat GST rate applied to the taxable amount.
    pub gst_rate: Decimal,
    /// Subtotal at or above which default-courier shipping is free.
    pub free_shipping_threshold: Decimal,
    /// How far above the current subtotal a coupon minimum may sit and still
    /// be listed as a near-miss.
    pub near_miss_margin: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: "INR".to_string(),
            gst_rate: Decimal::new(18, 2),
            free_shipping_threshold: Decimal::new(1000, 0),
            near_miss_margin: Decimal::new(20, 2),
        }
    }
}

impl EngineConfig {
    /// Environment overrides: `FREE_SHIPPING_THRESHOLD`, `GST_RATE`,
    /// `CURRENCY`. Unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("CURRENCY") {
            if !v.trim().is_empty() {
                config.currency = v.trim().to_string();
            }
        }
        if let Some(v) = std::env::var("GST_RATE").ok().and_then(|v| v.parse().ok()) {
            config.gst_rate = v;
        }
        if let Some(v) = std::env::var("FREE_SHIPPING_THRESHOLD").ok().and_then(|v| v.parse().ok()) {
            config.free_shipping_threshold = v;
        }
        config
    }
}
