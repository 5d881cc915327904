//! Session-scoped reactive state
//!
//! The coupon lifecycle is an explicit state machine, never a bare mutable
//! singleton: `Unapplied -> Validating -> {Applied | Rejected}`, with any cart
//! or destination change pushing `Applied` to `Stale` until re-validation.
//! Only the coupon code survives client-side; discounts are always re-derived
//! server-side before anything is charged.
//!
//! Validation requests carry a monotonically increasing token; a response that
//! arrives after a newer request has been issued is discarded instead of
//! overwriting fresher state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::events::{CouponEvent, DomainEvent};
use crate::domain::value_objects::Pincode;
use crate::engine::coupon::{CouponApplication, CouponError};
use crate::engine::pricing::AppliedCoupon;
use crate::engine::shipping::{QuoteKey, SelectionMode, ShippingQuoteSet};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CouponState {
    #[default]
    Unapplied,
    Validating {
        token: u64,
        code: String,
    },
    Applied(AppliedCoupon),
    Rejected {
        code: String,
        reason: String,
    },
    Stale(AppliedCoupon),
}

impl CouponState {
    /// Checkout may only be submitted with a settled coupon: applied, or none
    /// at all. Never mid-validation, never from stale state.
    pub fn can_submit(&self) -> bool {
        matches!(self, CouponState::Unapplied | CouponState::Applied(_))
    }

    pub fn applied(&self) -> Option<&AppliedCoupon> {
        match self {
            CouponState::Applied(a) => Some(a),
            _ => None,
        }
    }

    /// The code to re-derive server-side, if any coupon is in play.
    pub fn code(&self) -> Option<&str> {
        match self {
            CouponState::Unapplied => None,
            CouponState::Validating { code, .. } => Some(code),
            CouponState::Applied(a) | CouponState::Stale(a) => Some(&a.code),
            CouponState::Rejected { code, .. } => Some(code),
        }
    }
}

/// Issues request tokens; only the most recently issued token is current.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenIssuer {
    last: u64,
}

impl TokenIssuer {
    pub fn issue(&mut self) -> u64 {
        self.last += 1;
        self.last
    }

    pub fn is_current(&self, token: u64) -> bool {
        token == self.last
    }
}

/// Non-fatal degradation surfaced to the caller instead of a failure.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineWarning {
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Per-session reactive node: owns the coupon state machine and the memoized
/// provider results, keyed so that any input change is a cache miss rather
/// than a silently stale hit.
#[derive(Clone, Debug, Default)]
pub struct CheckoutSession {
    id: String,
    state: CouponState,
    tokens: TokenIssuer,
    destination: Option<Pincode>,
    courier_selection: SelectionMode,
    cart_fingerprint: Option<u64>,
    quote_cache: HashMap<QuoteKey, ShippingQuoteSet>,
    last_quote_set: Option<ShippingQuoteSet>,
    coupon_cache: HashMap<(String, Decimal), CouponApplication>,
    warnings: Vec<EngineWarning>,
    events: Vec<DomainEvent>,
}

impl CheckoutSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), ..Default::default() }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> &CouponState {
        &self.state
    }

    pub fn destination(&self) -> Option<&Pincode> {
        self.destination.as_ref()
    }

    pub fn courier_selection(&self) -> &SelectionMode {
        &self.courier_selection
    }

    /// Record the latest cart fingerprint. A change invalidates the applied
    /// coupon (quote and coupon caches miss by key on their own).
    pub fn observe_cart(&mut self, fingerprint: u64) {
        if self.cart_fingerprint != Some(fingerprint) {
            self.cart_fingerprint = Some(fingerprint);
            self.mark_stale("cart changed");
        }
    }

    pub fn set_destination(&mut self, pincode: Pincode) {
        if self.destination.as_ref() != Some(&pincode) {
            self.destination = Some(pincode);
            self.mark_stale("destination changed");
        }
    }

    pub fn set_courier(&mut self, selection: SelectionMode) {
        self.courier_selection = selection;
    }

    fn mark_stale(&mut self, why: &str) {
        if let CouponState::Applied(applied) = &self.state {
            tracing::debug!(session = %self.id, code = %applied.code, why, "applied coupon is stale");
            self.state = CouponState::Stale(applied.clone());
        }
    }

    /// Start validating a code. Supersedes any in-flight validation.
    pub fn begin_validation(&mut self, code: impl Into<String>) -> u64 {
        let token = self.tokens.issue();
        self.state = CouponState::Validating { token, code: code.into() };
        token
    }

    /// Commit a validation outcome. Returns false when the response was
    /// superseded by a newer request and therefore discarded.
    pub fn complete_validation(
        &mut self,
        token: u64,
        outcome: Result<CouponApplication, CouponError>,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.tokens.is_current(token) {
            tracing::debug!(session = %self.id, token, "discarding superseded coupon validation");
            return false;
        }
        match outcome {
            Ok(app) => {
                self.raise_event(DomainEvent::Coupon(CouponEvent::Applied {
                    session_id: self.id.clone(),
                    code: app.code.clone(),
                    discount: app.discount,
                }));
                self.state = CouponState::Applied(AppliedCoupon {
                    code: app.code,
                    discount_amount: app.discount,
                    computed_at: now,
                });
            }
            Err(err) => {
                let code = self.state.code().unwrap_or_default().to_string();
                self.raise_event(DomainEvent::Coupon(CouponEvent::Rejected {
                    session_id: self.id.clone(),
                    code: code.clone(),
                    reason: err.to_string(),
                }));
                self.state = CouponState::Rejected { code, reason: err.to_string() };
            }
        }
        true
    }

    pub fn remove_coupon(&mut self) {
        if !matches!(self.state, CouponState::Unapplied) {
            self.raise_event(DomainEvent::Coupon(CouponEvent::Removed { session_id: self.id.clone() }));
        }
        self.state = CouponState::Unapplied;
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn raise_event(&mut self, e: DomainEvent) {
        self.events.push(e);
    }

    pub fn can_submit(&self) -> bool {
        self.state.can_submit()
    }

    /// Gate for checkout submission. Stale or in-flight coupon state asks the
    /// caller to recompute first; a rejected coupon must be removed or
    /// replaced before submitting.
    pub fn ensure_submittable(&self) -> crate::Result<()> {
        match &self.state {
            CouponState::Unapplied | CouponState::Applied(_) => Ok(()),
            CouponState::Stale(_) | CouponState::Validating { .. } => Err(crate::EngineError::Stale),
            CouponState::Rejected { code, reason } => Err(crate::EngineError::Conflict(format!(
                "coupon {code} was rejected: {reason}"
            ))),
        }
    }

    // Reactive caches -------------------------------------------------------

    pub fn cached_quotes(&self, key: &QuoteKey) -> Option<&ShippingQuoteSet> {
        self.quote_cache.get(key)
    }

    pub fn store_quotes(&mut self, key: QuoteKey, set: ShippingQuoteSet) {
        self.last_quote_set = Some(set.clone());
        self.quote_cache.insert(key, set);
    }

    /// Fail-soft fallback: the most recent quote set regardless of key, for
    /// when the provider is down and a degraded answer beats none.
    pub fn last_known_quotes(&self) -> Option<&ShippingQuoteSet> {
        self.last_quote_set.as_ref()
    }

    pub fn cached_application(&self, code: &str, subtotal: Decimal) -> Option<&CouponApplication> {
        self.coupon_cache.get(&(code.to_string(), subtotal))
    }

    pub fn store_application(&mut self, subtotal: Decimal, app: CouponApplication) {
        self.coupon_cache.insert((app.code.clone(), subtotal), app);
    }

    pub fn push_warning(&mut self, message: impl Into<String>, now: DateTime<Utc>) {
        let message = message.into();
        tracing::warn!(session = %self.id, %message, "engine warning");
        self.warnings.push(EngineWarning { message, at: now });
    }

    pub fn drain_warnings(&mut self) -> Vec<EngineWarning> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn application(code: &str, subtotal: i64, discount: i64) -> CouponApplication {
        CouponApplication {
            code: code.into(),
            discount: Decimal::new(discount, 0),
            final_amount: Decimal::new(subtotal - discount, 0),
            eligible_base: Decimal::new(subtotal, 0),
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut s = CheckoutSession::new("s1");
        assert_eq!(s.id(), "s1");
        assert!(s.can_submit()); // no coupon is a legal submit state

        let token = s.begin_validation("SAVE10");
        assert!(!s.can_submit());
        assert!(s.complete_validation(token, Ok(application("SAVE10", 1000, 100)), Utc::now()));
        assert!(matches!(s.state(), CouponState::Applied(a) if a.code == "SAVE10"));
        assert!(s.can_submit());

        s.remove_coupon();
        assert_eq!(s.state(), &CouponState::Unapplied);
    }

    #[test]
    fn test_rejection() {
        let mut s = CheckoutSession::new("s1");
        let token = s.begin_validation("BAD");
        s.complete_validation(token, Err(CouponError::Expired), Utc::now());
        assert!(matches!(s.state(), CouponState::Rejected { code, .. } if code == "BAD"));
        assert!(!s.can_submit());
    }

    #[test]
    fn test_superseded_response_discarded() {
        let mut s = CheckoutSession::new("s1");
        let stale_token = s.begin_validation("FIRST");
        let fresh_token = s.begin_validation("SECOND");
        // late arrival for the first request must not win
        assert!(!s.complete_validation(stale_token, Ok(application("FIRST", 1000, 500)), Utc::now()));
        assert!(matches!(s.state(), CouponState::Validating { code, .. } if code == "SECOND"));
        assert!(s.complete_validation(fresh_token, Ok(application("SECOND", 1000, 50)), Utc::now()));
        assert_eq!(s.state().applied().unwrap().discount_amount, Decimal::new(50, 0));
    }

    #[test]
    fn test_cart_change_marks_applied_stale() {
        let mut s = CheckoutSession::new("s1");
        s.observe_cart(1);
        let token = s.begin_validation("SAVE10");
        s.complete_validation(token, Ok(application("SAVE10", 1000, 100)), Utc::now());
        s.observe_cart(1); // unchanged: still applied
        assert!(s.can_submit());
        s.observe_cart(2);
        assert!(matches!(s.state(), CouponState::Stale(_)));
        assert!(!s.can_submit());
        assert_eq!(s.state().code(), Some("SAVE10"));
    }

    #[test]
    fn test_destination_change_marks_applied_stale() {
        let mut s = CheckoutSession::new("s1");
        let token = s.begin_validation("SAVE10");
        s.complete_validation(token, Ok(application("SAVE10", 1000, 100)), Utc::now());
        s.set_destination(Pincode::new("560001").unwrap());
        assert_eq!(s.destination().unwrap().as_str(), "560001");
        assert!(matches!(s.state(), CouponState::Stale(_)));
        // re-entry: stale -> validating -> applied
        let token = s.begin_validation("SAVE10");
        s.complete_validation(token, Ok(application("SAVE10", 1000, 100)), Utc::now());
        assert!(s.can_submit());
        // same destination again is not a change
        s.set_destination(Pincode::new("560001").unwrap());
        assert!(s.can_submit());
    }

    #[test]
    fn test_ensure_submittable() {
        let mut s = CheckoutSession::new("s1");
        assert!(s.ensure_submittable().is_ok());
        s.begin_validation("X");
        assert!(matches!(s.ensure_submittable(), Err(crate::EngineError::Stale)));
        let token = s.begin_validation("X");
        s.complete_validation(token, Err(CouponError::NotFound), Utc::now());
        assert!(matches!(s.ensure_submittable(), Err(crate::EngineError::Conflict(_))));
    }

    #[test]
    fn test_warnings_drain() {
        let mut s = CheckoutSession::new("s1");
        s.push_warning("shipping provider timed out; showing last known rates", Utc::now());
        assert_eq!(s.drain_warnings().len(), 1);
        assert!(s.drain_warnings().is_empty());
    }
}
