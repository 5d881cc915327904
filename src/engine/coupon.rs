//! Coupon validation and listing
//!
//! A coupon is read-only data here; the engine decides whether it may apply
//! to a cart for a user and what it is worth. Checks run in a fixed order and
//! short-circuit on the first failure.
//!
//! Scope base: for category/product-scoped coupons the discount base is the
//! matching lines' subtotal; `min_order_value` is always checked against the
//! full cart subtotal.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::domain::aggregates::cart::CartSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponScope {
    All,
    Category { category_ids: HashSet<String> },
    Product { product_ids: HashSet<String> },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "eligibility", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UserEligibility {
    All,
    FirstTime,
    NewUsers { window_days: u32 },
    SpecificUsers { user_ids: HashSet<String> },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    pub min_order_value: Decimal,
    pub max_discount_amount: Option<Decimal>,
    pub scope: CouponScope,
    pub user_eligibility: UserEligibility,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub max_usage: Option<u32>,
    pub per_user_limit: Option<u32>,
    pub usage_count: u32,
    pub is_active: bool,
}

/// What the engine knows about the requesting user.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UserContext {
    pub user_id: String,
    pub signup_date: DateTime<Utc>,
    pub completed_orders: u32,
    pub coupon_usage: HashMap<String, u32>,
}

impl UserContext {
    pub fn new(user_id: impl Into<String>, signup_date: DateTime<Utc>) -> Self {
        Self { user_id: user_id.into(), signup_date, completed_orders: 0, coupon_usage: HashMap::new() }
    }

    fn usage_of(&self, code: &str) -> u32 {
        self.coupon_usage.get(code).copied().unwrap_or(0)
    }
}

/// Successful validation result.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CouponApplication {
    pub code: String,
    pub discount: Decimal,
    pub final_amount: Decimal,
    /// Subtotal of the lines the coupon actually discounts.
    pub eligible_base: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "error", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponError {
    #[error("coupon not found")]
    NotFound,
    #[error("coupon is expired or not yet active")]
    Expired,
    #[error("add {shortfall} more to use this coupon")]
    BelowMinimum { shortfall: Decimal },
    #[error("coupon does not apply to any item in the cart")]
    NotApplicable,
    #[error("coupon usage limit reached")]
    UsageExceeded,
    #[error("you are not eligible for this coupon")]
    NotEligible,
}

impl Coupon {
    /// Ordered checks: active, validity window, order minimum, scope, usage
    /// caps, user eligibility, then the discount computation with its clamps.
    pub fn validate(
        &self,
        snapshot: &CartSnapshot,
        user: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<CouponApplication, CouponError> {
        if !self.is_active {
            return Err(CouponError::NotFound);
        }
        if now < self.valid_from || now > self.valid_until {
            return Err(CouponError::Expired);
        }
        let subtotal = snapshot.subtotal_amount();
        if subtotal < self.min_order_value {
            return Err(CouponError::BelowMinimum { shortfall: self.min_order_value - subtotal });
        }
        let base = match &self.scope {
            CouponScope::All => subtotal,
            _ => {
                let base = self.eligible_base(snapshot);
                if base <= Decimal::ZERO {
                    return Err(CouponError::NotApplicable);
                }
                base
            }
        };
        if let Some(max) = self.max_usage {
            if self.usage_count >= max {
                return Err(CouponError::UsageExceeded);
            }
        }
        if let Some(limit) = self.per_user_limit {
            if user.usage_of(&self.code) >= limit {
                return Err(CouponError::UsageExceeded);
            }
        }
        match &self.user_eligibility {
            UserEligibility::All => {}
            UserEligibility::FirstTime => {
                if user.completed_orders > 0 {
                    return Err(CouponError::NotEligible);
                }
            }
            UserEligibility::NewUsers { window_days } => {
                if now.signed_duration_since(user.signup_date) > Duration::days(*window_days as i64) {
                    return Err(CouponError::NotEligible);
                }
            }
            UserEligibility::SpecificUsers { user_ids } => {
                if !user_ids.contains(&user.user_id) {
                    return Err(CouponError::NotEligible);
                }
            }
        }

        let raw = match self.discount_type {
            DiscountType::Percentage => base * self.discount_value / Decimal::ONE_HUNDRED,
            DiscountType::Fixed => self.discount_value,
        };
        let mut discount = raw;
        if let Some(cap) = self.max_discount_amount {
            discount = discount.min(cap);
        }
        let discount = discount.min(base).max(Decimal::ZERO);
        Ok(CouponApplication {
            code: self.code.clone(),
            discount,
            final_amount: subtotal - discount,
            eligible_base: base,
        })
    }

    fn eligible_base(&self, snapshot: &CartSnapshot) -> Decimal {
        snapshot
            .lines
            .iter()
            .filter(|line| match &self.scope {
                CouponScope::All => true,
                CouponScope::Category { category_ids } => {
                    line.category_id.as_ref().is_some_and(|c| category_ids.contains(c))
                }
                CouponScope::Product { product_ids } => product_ids.contains(&line.product_id),
            })
            .map(|line| line.line_total().amount())
            .sum()
    }
}

/// A coupon listed against the current cart, annotated for ranking.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RankedCoupon {
    pub coupon: Coupon,
    pub estimated_discount: Decimal,
    pub min_order_met: bool,
}

/// Coupons worth showing for this cart: every coupon that validates, plus
/// near-misses whose minimum is within `near_miss_margin` above the current
/// subtotal (estimated discount zero, so the UI can nudge). Sorted by
/// estimated discount descending.
pub fn list_applicable(
    coupons: &[Coupon],
    snapshot: &CartSnapshot,
    user: &UserContext,
    now: DateTime<Utc>,
    near_miss_margin: Decimal,
) -> Vec<RankedCoupon> {
    let cutoff = snapshot.subtotal_amount() * (Decimal::ONE + near_miss_margin);
    let mut ranked: Vec<RankedCoupon> = coupons
        .iter()
        .filter_map(|coupon| match coupon.validate(snapshot, user, now) {
            Ok(app) => Some(RankedCoupon {
                coupon: coupon.clone(),
                estimated_discount: app.discount,
                min_order_met: true,
            }),
            Err(CouponError::BelowMinimum { .. }) if coupon.min_order_value <= cutoff => {
                Some(RankedCoupon {
                    coupon: coupon.clone(),
                    estimated_discount: Decimal::ZERO,
                    min_order_met: false,
                })
            }
            Err(_) => None,
        })
        .collect();
    ranked.sort_by(|a, b| b.estimated_discount.cmp(&a.estimated_discount));
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::cart::{Cart, CartSource, GuestCartItem, VariantSnapshot};

    fn snapshot(items: Vec<(&str, Option<&str>, i64, u32)>) -> CartSnapshot {
        let items = items
            .into_iter()
            .map(|(product, category, price, qty)| GuestCartItem {
                product_id: product.into(),
                variant: None::<VariantSnapshot>,
                selling_price: Some(Decimal::new(price, 0)),
                quantity: Some(qty),
                category_id: category.map(Into::into),
                ..Default::default()
            })
            .collect();
        Cart::normalize(CartSource::Guest(items), "INR").snapshot()
    }

    fn coupon(code: &str) -> Coupon {
        Coupon {
            code: code.into(),
            discount_type: DiscountType::Fixed,
            discount_value: Decimal::new(200, 0),
            min_order_value: Decimal::new(1000, 0),
            max_discount_amount: None,
            scope: CouponScope::All,
            user_eligibility: UserEligibility::All,
            valid_from: Utc::now() - Duration::days(1),
            valid_until: Utc::now() + Duration::days(1),
            max_usage: None,
            per_user_limit: None,
            usage_count: 0,
            is_active: true,
        }
    }

    fn user() -> UserContext {
        UserContext::new("U1", Utc::now() - Duration::days(10))
    }

    #[test]
    fn test_fixed_discount_applies() {
        let snap = snapshot(vec![("P1", None, 2000, 1)]);
        let app = coupon("FLAT200").validate(&snap, &user(), Utc::now()).unwrap();
        assert_eq!(app.discount, Decimal::new(200, 0));
        assert_eq!(app.final_amount, Decimal::new(1800, 0));
    }

    #[test]
    fn test_expired_coupon() {
        let mut c = coupon("OLD");
        c.valid_until = Utc::now() - Duration::days(1);
        let snap = snapshot(vec![("P1", None, 2000, 1)]);
        assert_eq!(c.validate(&snap, &user(), Utc::now()), Err(CouponError::Expired));
    }

    #[test]
    fn test_inactive_reads_as_not_found() {
        let mut c = coupon("GONE");
        c.is_active = false;
        let snap = snapshot(vec![("P1", None, 2000, 1)]);
        assert_eq!(c.validate(&snap, &user(), Utc::now()), Err(CouponError::NotFound));
    }

    #[test]
    fn test_below_minimum_carries_shortfall() {
        let snap = snapshot(vec![("P1", None, 800, 1)]);
        match coupon("FLAT200").validate(&snap, &user(), Utc::now()) {
            Err(CouponError::BelowMinimum { shortfall }) => {
                assert_eq!(shortfall, Decimal::new(200, 0));
            }
            other => panic!("expected BelowMinimum, got {other:?}"),
        }
    }

    #[test]
    fn test_percentage_capped_by_max_discount() {
        let mut c = coupon("TEN");
        c.discount_type = DiscountType::Percentage;
        c.discount_value = Decimal::new(10, 0);
        c.min_order_value = Decimal::new(500, 0);
        c.max_discount_amount = Some(Decimal::new(50, 0));
        let snap = snapshot(vec![("P1", None, 800, 1)]);
        let app = c.validate(&snap, &user(), Utc::now()).unwrap();
        assert_eq!(app.discount, Decimal::new(50, 0));
        assert_eq!(app.final_amount, Decimal::new(750, 0));
    }

    #[test]
    fn test_scoped_coupon_uses_matching_lines_base() {
        let mut c = coupon("CAT10");
        c.discount_type = DiscountType::Percentage;
        c.discount_value = Decimal::new(10, 0);
        c.min_order_value = Decimal::ZERO;
        c.scope = CouponScope::Category { category_ids: ["books".to_string()].into_iter().collect() };
        let snap = snapshot(vec![("P1", Some("books"), 400, 1), ("P2", Some("toys"), 600, 1)]);
        let app = c.validate(&snap, &user(), Utc::now()).unwrap();
        assert_eq!(app.eligible_base, Decimal::new(400, 0));
        assert_eq!(app.discount, Decimal::new(40, 0));
        // final amount still comes off the whole order
        assert_eq!(app.final_amount, Decimal::new(960, 0));
    }

    #[test]
    fn test_scoped_coupon_with_no_matching_lines() {
        let mut c = coupon("CAT10");
        c.min_order_value = Decimal::ZERO;
        c.scope = CouponScope::Product { product_ids: ["P9".to_string()].into_iter().collect() };
        let snap = snapshot(vec![("P1", None, 500, 1)]);
        assert_eq!(c.validate(&snap, &user(), Utc::now()), Err(CouponError::NotApplicable));
    }

    #[test]
    fn test_fixed_discount_clamped_to_scoped_base() {
        let mut c = coupon("BIGFLAT");
        c.discount_value = Decimal::new(500, 0);
        c.min_order_value = Decimal::ZERO;
        c.scope = CouponScope::Product { product_ids: ["P1".to_string()].into_iter().collect() };
        let snap = snapshot(vec![("P1", None, 100, 1), ("P2", None, 2000, 1)]);
        let app = c.validate(&snap, &user(), Utc::now()).unwrap();
        assert_eq!(app.discount, Decimal::new(100, 0));
    }

    #[test]
    fn test_usage_caps() {
        let mut c = coupon("CAPPED");
        c.max_usage = Some(5);
        c.usage_count = 5;
        let snap = snapshot(vec![("P1", None, 2000, 1)]);
        assert_eq!(c.validate(&snap, &user(), Utc::now()), Err(CouponError::UsageExceeded));

        let mut c = coupon("PERUSER");
        c.per_user_limit = Some(1);
        let mut u = user();
        u.coupon_usage.insert("PERUSER".into(), 1);
        assert_eq!(c.validate(&snap, &u, Utc::now()), Err(CouponError::UsageExceeded));
        c.per_user_limit = Some(2);
        assert!(c.validate(&snap, &u, Utc::now()).is_ok());
    }

    #[test]
    fn test_eligibility_rules() {
        let snap = snapshot(vec![("P1", None, 2000, 1)]);

        let mut c = coupon("FIRST");
        c.user_eligibility = UserEligibility::FirstTime;
        let mut u = user();
        assert!(c.validate(&snap, &u, Utc::now()).is_ok());
        u.completed_orders = 3;
        assert_eq!(c.validate(&snap, &u, Utc::now()), Err(CouponError::NotEligible));

        let mut c = coupon("NEW30");
        c.user_eligibility = UserEligibility::NewUsers { window_days: 30 };
        let u = UserContext::new("U1", Utc::now() - Duration::days(45));
        assert_eq!(c.validate(&snap, &u, Utc::now()), Err(CouponError::NotEligible));

        let mut c = coupon("VIP");
        c.user_eligibility =
            UserEligibility::SpecificUsers { user_ids: ["U2".to_string()].into_iter().collect() };
        assert_eq!(c.validate(&snap, &user(), Utc::now()), Err(CouponError::NotEligible));
    }

    #[test]
    fn test_list_applicable_ranks_and_includes_near_miss() {
        let snap = snapshot(vec![("P1", None, 1000, 1)]);
        let big = {
            let mut c = coupon("BIG");
            c.discount_value = Decimal::new(300, 0);
            c.min_order_value = Decimal::new(500, 0);
            c
        };
        let small = {
            let mut c = coupon("SMALL");
            c.discount_value = Decimal::new(100, 0);
            c.min_order_value = Decimal::new(500, 0);
            c
        };
        let near = {
            let mut c = coupon("NEAR");
            c.min_order_value = Decimal::new(1100, 0);
            c
        };
        let far = {
            let mut c = coupon("FAR");
            c.min_order_value = Decimal::new(5000, 0);
            c
        };
        let ranked = list_applicable(
            &[small, far, near, big],
            &snap,
            &user(),
            Utc::now(),
            Decimal::new(20, 2),
        );
        let codes: Vec<&str> = ranked.iter().map(|r| r.coupon.code.as_str()).collect();
        assert_eq!(codes, vec!["BIG", "SMALL", "NEAR"]);
        assert!(!ranked[2].min_order_met);
        assert_eq!(ranked[2].estimated_discount, Decimal::ZERO);
    }
}
