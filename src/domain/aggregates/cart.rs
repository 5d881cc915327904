//! Cart Aggregate
//!
//! Normalizes the two raw cart representations (guest/local store and
//! server-fetched) into one canonical line-item sequence. Normalization never
//! fails: missing nested fields fall through the unit-price precedence ladder
//! (variant price, product selling price, product base price, zero) and a
//! missing quantity counts as zero.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::value_objects::{Money, Quantity};

/// Raw cart shapes as they arrive from the repository.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "source", content = "items", rename_all = "snake_case")]
pub enum CartSource {
    Guest(Vec<GuestCartItem>),
    Server(Vec<ServerCartItem>),
}

impl CartSource {
    /// Product ids whose requested quantity exceeds the known available
    /// stock. Only the server shape carries stock counts.
    pub fn stock_violations(&self) -> Vec<String> {
        match self {
            CartSource::Guest(_) => vec![],
            CartSource::Server(items) => items
                .iter()
                .filter(|i| {
                    matches!(i.available_quantity, Some(avail) if i.quantity.unwrap_or(0) > avail)
                })
                .map(|i| i.product_id.clone())
                .collect(),
        }
    }
}

/// Guest-local item: a flat product snapshot kept client-side.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GuestCartItem {
    pub product_id: String,
    #[serde(default)]
    pub variant: Option<VariantSnapshot>,
    #[serde(default)]
    pub selling_price: Option<Decimal>,
    #[serde(default)]
    pub base_price: Option<Decimal>,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub unit_weight_grams: Option<u32>,
}

/// Server item: a cart row with nested, independently-optional product and
/// variant records.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerCartItem {
    pub id: String,
    pub product_id: String,
    #[serde(default)]
    pub quantity: Option<u32>,
    #[serde(default)]
    pub variant: Option<VariantSnapshot>,
    #[serde(default)]
    pub product: Option<ProductSnapshot>,
    #[serde(default)]
    pub available_quantity: Option<u32>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct VariantSnapshot {
    pub id: String,
    #[serde(default)]
    pub price: Option<Decimal>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProductSnapshot {
    #[serde(default)]
    pub selling_price: Option<Decimal>,
    #[serde(default)]
    pub base_price: Option<Decimal>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub unit_weight_grams: Option<u32>,
}

/// Canonical line item every consumer works against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CartLine {
    pub product_id: String,
    pub variant_id: Option<String>,
    pub quantity: Quantity,
    pub unit_price: Money,
    pub category_id: Option<String>,
    pub unit_weight_grams: u32,
}

impl CartLine {
    pub fn line_total(&self) -> Money {
        self.unit_price.multiply(self.quantity.value())
    }
}

#[derive(Clone, Debug)]
pub struct Cart {
    id: String,
    lines: Vec<CartLine>,
    subtotal: Money,
    currency: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Cart {
    pub fn new(currency: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            lines: vec![],
            subtotal: Money::zero(currency),
            currency: currency.to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    /// Exhaustive adapter over both raw shapes. Lines with the same
    /// `(product_id, variant_id)` merge by summed quantity.
    pub fn normalize(source: CartSource, currency: &str) -> Self {
        let mut cart = Self::new(currency);
        match source {
            CartSource::Guest(items) => {
                for item in items {
                    let line = Self::line_from_guest(item, currency);
                    cart.add_line(line);
                }
            }
            CartSource::Server(items) => {
                for item in items {
                    let line = Self::line_from_server(item, currency);
                    cart.add_line(line);
                }
            }
        }
        cart
    }

    fn line_from_guest(item: GuestCartItem, currency: &str) -> CartLine {
        let unit_price = item
            .variant
            .as_ref()
            .and_then(|v| v.price)
            .or(item.selling_price)
            .or(item.base_price)
            .unwrap_or(Decimal::ZERO);
        CartLine {
            product_id: item.product_id,
            variant_id: item.variant.map(|v| v.id),
            quantity: Quantity::new(item.quantity.unwrap_or(0)),
            unit_price: Money::new(unit_price, currency),
            category_id: item.category_id,
            unit_weight_grams: item.unit_weight_grams.unwrap_or(0),
        }
    }

    fn line_from_server(item: ServerCartItem, currency: &str) -> CartLine {
        let unit_price = item
            .variant
            .as_ref()
            .and_then(|v| v.price)
            .or(item.product.as_ref().and_then(|p| p.selling_price))
            .or(item.product.as_ref().and_then(|p| p.base_price))
            .unwrap_or(Decimal::ZERO);
        CartLine {
            product_id: item.product_id,
            variant_id: item.variant.map(|v| v.id),
            quantity: Quantity::new(item.quantity.unwrap_or(0)),
            unit_price: Money::new(unit_price, currency),
            category_id: item.product.as_ref().and_then(|p| p.category_id.clone()),
            unit_weight_grams: item.product.as_ref().and_then(|p| p.unit_weight_grams).unwrap_or(0),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn subtotal(&self) -> &Money {
        &self.subtotal
    }

    pub fn total_items(&self) -> u32 {
        self.lines.iter().map(|l| l.quantity.value()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }

    pub fn add_line(&mut self, line: CartLine) {
        if let Some(existing) = self
            .lines
            .iter_mut()
            .find(|l| l.product_id == line.product_id && l.variant_id == line.variant_id)
        {
            existing.quantity = existing.quantity.add(line.quantity.value());
        } else {
            self.lines.push(line);
        }
        self.recalculate();
    }

    pub fn update_quantity(&mut self, product_id: &str, quantity: u32) -> Result<(), CartError> {
        let line = self
            .lines
            .iter_mut()
            .find(|l| l.product_id == product_id)
            .ok_or(CartError::LineNotFound)?;
        if quantity == 0 {
            self.lines.retain(|l| l.product_id != product_id);
        } else {
            line.quantity = Quantity::new(quantity);
        }
        self.recalculate();
        Ok(())
    }

    pub fn remove_line(&mut self, product_id: &str) -> Result<(), CartError> {
        let before = self.lines.len();
        self.lines.retain(|l| l.product_id != product_id);
        if self.lines.len() == before {
            return Err(CartError::LineNotFound);
        }
        self.recalculate();
        Ok(())
    }

    pub fn clear(&mut self) {
        self.lines.clear();
        self.recalculate();
    }

    /// Immutable view handed to the engine.
    pub fn snapshot(&self) -> CartSnapshot {
        CartSnapshot {
            lines: self.lines.clone(),
            subtotal: self.subtotal.clone(),
            total_items: self.total_items(),
            fingerprint: fingerprint(&self.lines),
        }
    }

    fn recalculate(&mut self) {
        self.subtotal = self
            .lines
            .iter()
            .fold(Money::zero(&self.currency), |acc, l| acc.add(&l.line_total()).unwrap_or(acc));
        self.updated_at = Utc::now();
    }
}

/// Point-in-time cart view. The fingerprint changes whenever composition,
/// quantities or prices change, which is what marks dependent state stale.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CartSnapshot {
    pub lines: Vec<CartLine>,
    pub subtotal: Money,
    pub total_items: u32,
    pub fingerprint: u64,
}

impl CartSnapshot {
    pub fn subtotal_amount(&self) -> Decimal {
        self.subtotal.amount()
    }

    pub fn weight_grams(&self) -> u32 {
        self.lines
            .iter()
            .map(|l| l.unit_weight_grams.saturating_mul(l.quantity.value()))
            .sum()
    }
}

fn fingerprint(lines: &[CartLine]) -> u64 {
    let mut h = DefaultHasher::new();
    for line in lines {
        line.product_id.hash(&mut h);
        line.variant_id.hash(&mut h);
        line.quantity.value().hash(&mut h);
        line.unit_price.amount().hash(&mut h);
    }
    h.finish()
}

#[derive(Debug, Clone, Error)]
pub enum CartError {
    #[error("cart line not found")]
    LineNotFound,
}
