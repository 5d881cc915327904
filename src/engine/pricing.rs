//! Price reconciliation
//!
//! Pure combination of cart, coupon and shipping into one authoritative
//! breakdown. Operation order is fixed: subtotal, discount, shipping cost,
//! taxable amount, GST, total. Each figure is sealed to two decimal places
//! here and nowhere else, so the displayed and charged values cannot diverge.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::aggregates::cart::CartSnapshot;
use crate::domain::value_objects::Money;
use crate::engine::shipping::ShippingSelection;
use crate::engine::EngineConfig;

/// Session-scoped record of a successfully validated coupon. Ephemeral: any
/// change to the cart or destination makes it stale and it must be
/// re-derived before being trusted again.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppliedCoupon {
    pub code: String,
    pub discount_amount: Decimal,
    pub computed_at: DateTime<Utc>,
}

/// The canonical decomposition of an order's charge.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub subtotal: Money,
    pub discount: Money,
    pub shipping_cost: Money,
    pub taxable_amount: Money,
    pub gst_amount: Money,
    pub total: Money,
    pub estimated_delivery_days: Option<u32>,
}

fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Recompute the breakdown from scratch. Pure: identical inputs yield a
/// bit-identical breakdown.
pub fn reconcile(
    snapshot: &CartSnapshot,
    applied: Option<&AppliedCoupon>,
    shipping: Option<&ShippingSelection>,
    config: &EngineConfig,
) -> PriceBreakdown {
    let subtotal = round2(snapshot.subtotal_amount());
    let discount = round2(
        applied
            .map(|a| a.discount_amount)
            .unwrap_or(Decimal::ZERO)
            .clamp(Decimal::ZERO, subtotal),
    );
    let shipping_cost = round2(shipping.map(|s| s.shipping_cost).unwrap_or(Decimal::ZERO));
    let taxable = (subtotal - discount + shipping_cost).max(Decimal::ZERO);
    let gst = round2(taxable * config.gst_rate);
    let total = taxable + gst;
    let currency = &config.currency;
    PriceBreakdown {
        subtotal: Money::new(subtotal, currency),
        discount: Money::new(discount, currency),
        shipping_cost: Money::new(shipping_cost, currency),
        taxable_amount: Money::new(taxable, currency),
        gst_amount: Money::new(gst, currency),
        total: Money::new(total, currency),
        estimated_delivery_days: shipping.map(|s| s.estimated_delivery_days),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BreakdownViolation {
    #[error("negative amount in breakdown")]
    NegativeAmount,
    #[error("discount exceeds subtotal")]
    DiscountExceedsSubtotal,
    #[error("taxable amount does not equal subtotal - discount + shipping")]
    TaxableMismatch,
    #[error("gst amount does not equal the rounded tax on the taxable amount")]
    GstMismatch,
    #[error("total does not equal taxable + gst")]
    TotalMismatch,
    #[error("breakdown mixes currencies")]
    CurrencyMismatch,
}

impl PriceBreakdown {
    /// Re-check every invariant. Persistence refuses to commit a breakdown
    /// that fails this.
    pub fn verify(&self, config: &EngineConfig) -> Result<(), BreakdownViolation> {
        let amounts = [
            &self.subtotal,
            &self.discount,
            &self.shipping_cost,
            &self.taxable_amount,
            &self.gst_amount,
            &self.total,
        ];
        if amounts.iter().any(|m| m.currency() != config.currency) {
            return Err(BreakdownViolation::CurrencyMismatch);
        }
        if amounts.iter().any(|m| m.amount() < Decimal::ZERO) {
            return Err(BreakdownViolation::NegativeAmount);
        }
        if self.discount.amount() > self.subtotal.amount() {
            return Err(BreakdownViolation::DiscountExceedsSubtotal);
        }
        let expected_taxable = (self.subtotal.amount() - self.discount.amount()
            + self.shipping_cost.amount())
        .max(Decimal::ZERO);
        if self.taxable_amount.amount() != expected_taxable {
            return Err(BreakdownViolation::TaxableMismatch);
        }
        if self.gst_amount.amount() != round2(self.taxable_amount.amount() * config.gst_rate) {
            return Err(BreakdownViolation::GstMismatch);
        }
        if self.total.amount() != self.taxable_amount.amount() + self.gst_amount.amount() {
            return Err(BreakdownViolation::TotalMismatch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::cart::{Cart, CartSource, GuestCartItem};

    fn snapshot(subtotal: i64) -> CartSnapshot {
        Cart::normalize(
            CartSource::Guest(vec![GuestCartItem {
                product_id: "P1".into(),
                selling_price: Some(Decimal::new(subtotal, 0)),
                quantity: Some(1),
                ..Default::default()
            }]),
            "INR",
        )
        .snapshot()
    }

    fn applied(discount: i64) -> AppliedCoupon {
        AppliedCoupon {
            code: "C".into(),
            discount_amount: Decimal::new(discount, 0),
            computed_at: Utc::now(),
        }
    }

    fn shipping(cost: i64, free: bool) -> ShippingSelection {
        ShippingSelection {
            courier_id: "std".into(),
            courier_name: "STD".into(),
            freight_charge: Decimal::new(cost, 0),
            shipping_cost: if free { Decimal::ZERO } else { Decimal::new(cost, 0) },
            estimated_delivery_days: 4,
            free_shipping_applied: free,
        }
    }

    #[test]
    fn test_fixed_coupon_with_free_shipping() {
        // subtotal 2000, flat 200 off, free shipping:
        // taxable 1800, gst 324.00, total 2124.00
        let b = reconcile(
            &snapshot(2000),
            Some(&applied(200)),
            Some(&shipping(60, true)),
            &EngineConfig::default(),
        );
        assert_eq!(b.discount.amount(), Decimal::new(200, 0));
        assert_eq!(b.shipping_cost.amount(), Decimal::ZERO);
        assert_eq!(b.taxable_amount.amount(), Decimal::new(1800, 0));
        assert_eq!(b.gst_amount.amount(), Decimal::new(32400, 2));
        assert_eq!(b.total.amount(), Decimal::new(212400, 2));
        b.verify(&EngineConfig::default()).unwrap();
    }

    #[test]
    fn test_capped_percentage_with_courier_charge() {
        // subtotal 800, discount capped at 50, courier 60:
        // taxable 810, gst 145.80, total 955.80
        let b = reconcile(
            &snapshot(800),
            Some(&applied(50)),
            Some(&shipping(60, false)),
            &EngineConfig::default(),
        );
        assert_eq!(b.taxable_amount.amount(), Decimal::new(810, 0));
        assert_eq!(b.gst_amount.amount(), Decimal::new(14580, 2));
        assert_eq!(b.total.amount(), Decimal::new(95580, 2));
        b.verify(&EngineConfig::default()).unwrap();
    }

    #[test]
    fn test_no_coupon_no_shipping() {
        let b = reconcile(&snapshot(500), None, None, &EngineConfig::default());
        assert_eq!(b.discount.amount(), Decimal::ZERO);
        assert_eq!(b.shipping_cost.amount(), Decimal::ZERO);
        assert_eq!(b.total.amount(), Decimal::new(59000, 2));
        assert_eq!(b.estimated_delivery_days, None);
        b.verify(&EngineConfig::default()).unwrap();
    }

    #[test]
    fn test_idempotent_bit_identical() {
        let snap = snapshot(1234);
        let coupon = applied(99);
        let ship = shipping(45, false);
        let config = EngineConfig::default();
        let a = reconcile(&snap, Some(&coupon), Some(&ship), &config);
        let b = reconcile(&snap, Some(&coupon), Some(&ship), &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_oversized_discount_clamps_to_subtotal() {
        let b = reconcile(&snapshot(100), Some(&applied(500)), None, &EngineConfig::default());
        assert_eq!(b.discount.amount(), Decimal::new(100, 0));
        assert_eq!(b.taxable_amount.amount(), Decimal::ZERO);
        assert_eq!(b.total.amount(), Decimal::ZERO);
        b.verify(&EngineConfig::default()).unwrap();
    }

    #[test]
    fn test_verify_catches_tampering() {
        let mut b = reconcile(&snapshot(1000), None, None, &EngineConfig::default());
        b.total = Money::inr(Decimal::ONE);
        assert_eq!(b.verify(&EngineConfig::default()), Err(BreakdownViolation::TotalMismatch));

        let mut b = reconcile(&snapshot(1000), None, None, &EngineConfig::default());
        b.discount = Money::inr(Decimal::new(2000, 0));
        assert!(b.verify(&EngineConfig::default()).is_err());
    }

    #[test]
    fn test_fractional_discount_seals_once() {
        // 10% of 333.33 would be 33.333; the sealed discount is 33.33 and the
        // chain stays exact from there.
        let snap = Cart::normalize(
            CartSource::Guest(vec![GuestCartItem {
                product_id: "P1".into(),
                selling_price: Some(Decimal::new(33333, 2)),
                quantity: Some(1),
                ..Default::default()
            }]),
            "INR",
        )
        .snapshot();
        let coupon = AppliedCoupon {
            code: "TEN".into(),
            discount_amount: Decimal::new(33333, 3),
            computed_at: Utc::now(),
        };
        let b = reconcile(&snap, Some(&coupon), None, &EngineConfig::default());
        assert_eq!(b.discount.amount(), Decimal::new(3333, 2));
        b.verify(&EngineConfig::default()).unwrap();
    }
}
