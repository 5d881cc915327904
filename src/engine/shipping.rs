//! Shipping rate resolution
//!
//! Turns raw courier quotes for a destination into a quote set with
//! cheapest/fastest pointers and resolves the effective shipping cost for a
//! selection. Quotes are memoized under a `(pincode, item_count, subtotal)`
//! key; a set computed for one key must never answer for another.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::aggregates::cart::CartSnapshot;
use crate::domain::value_objects::Pincode;
use crate::engine::EngineConfig;

/// A single courier's offer, as returned by the provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CourierQuote {
    pub courier_id: String,
    pub courier_name: String,
    pub freight_charge: Decimal,
    pub estimated_delivery_days: u32,
    pub rating: Decimal,
}

/// What gets handed to the shipping provider.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Parcel {
    pub value: Decimal,
    pub weight_grams: u32,
    pub item_count: u32,
}

impl Parcel {
    pub fn from_snapshot(snapshot: &CartSnapshot) -> Self {
        Self {
            value: snapshot.subtotal_amount(),
            weight_grams: snapshot.weight_grams(),
            item_count: snapshot.total_items,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShippingQuoteSet {
    pub pincode: Pincode,
    pub quotes: Vec<CourierQuote>,
    pub cheapest: Option<String>,
    pub fastest: Option<String>,
    pub serviceable: bool,
}

impl ShippingQuoteSet {
    pub fn build(pincode: Pincode, quotes: Vec<CourierQuote>) -> Self {
        let cheapest = quotes
            .iter()
            .min_by(|a, b| a.freight_charge.cmp(&b.freight_charge))
            .map(|q| q.courier_id.clone());
        let fastest = quotes
            .iter()
            .min_by_key(|q| q.estimated_delivery_days)
            .map(|q| q.courier_id.clone());
        let serviceable = !quotes.is_empty();
        Self { pincode, quotes, cheapest, fastest, serviceable }
    }

    fn find(&self, courier_id: &str) -> Option<&CourierQuote> {
        self.quotes.iter().find(|q| q.courier_id == courier_id)
    }
}

/// How the courier was chosen.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SelectionMode {
    #[default]
    Cheapest,
    Fastest,
    Courier {
        courier_id: String,
    },
}

/// The resolved choice: which courier, what it quotes, and what the order
/// actually pays after the free-shipping rule.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ShippingSelection {
    pub courier_id: String,
    pub courier_name: String,
    pub freight_charge: Decimal,
    pub shipping_cost: Decimal,
    pub estimated_delivery_days: u32,
    pub free_shipping_applied: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ShippingError {
    #[error("no courier serves pincode {pincode}")]
    NotServiceable { pincode: String },
    #[error("unknown courier {0}")]
    UnknownCourier(String),
}

/// Resolve the effective shipping cost for a quote set and selection.
///
/// Free shipping zeroes the cost only when the chosen courier is the default
/// (cheapest) one; explicitly picking a premium courier keeps its freight
/// charge even above the threshold.
pub fn resolve(
    set: &ShippingQuoteSet,
    subtotal: Decimal,
    selection: &SelectionMode,
    config: &EngineConfig,
) -> Result<ShippingSelection, ShippingError> {
    if !set.serviceable {
        return Err(ShippingError::NotServiceable { pincode: set.pincode.as_str().to_string() });
    }
    let chosen = match selection {
        SelectionMode::Cheapest => set.cheapest.as_deref().and_then(|id| set.find(id)),
        SelectionMode::Fastest => set.fastest.as_deref().and_then(|id| set.find(id)),
        SelectionMode::Courier { courier_id } => Some(
            set.find(courier_id)
                .ok_or_else(|| ShippingError::UnknownCourier(courier_id.clone()))?,
        ),
    }
    .ok_or_else(|| ShippingError::NotServiceable { pincode: set.pincode.as_str().to_string() })?;

    let is_default = set.cheapest.as_deref() == Some(chosen.courier_id.as_str());
    let free = subtotal >= config.free_shipping_threshold && is_default;
    let shipping_cost = if free { Decimal::ZERO } else { chosen.freight_charge };
    Ok(ShippingSelection {
        courier_id: chosen.courier_id.clone(),
        courier_name: chosen.courier_name.clone(),
        freight_charge: chosen.freight_charge,
        shipping_cost,
        estimated_delivery_days: chosen.estimated_delivery_days,
        free_shipping_applied: free,
    })
}

/// Memoization key for resolved quotes. Any component changing means the old
/// set no longer answers.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QuoteKey {
    pub pincode: String,
    pub item_count: u32,
    pub subtotal: Decimal,
}

impl QuoteKey {
    pub fn of(pincode: &Pincode, snapshot: &CartSnapshot) -> Self {
        Self {
            pincode: pincode.as_str().to_string(),
            item_count: snapshot.total_items,
            subtotal: snapshot.subtotal_amount(),
        }
    }
}
