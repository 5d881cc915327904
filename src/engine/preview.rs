//! Checkout-time preview and submission
//!
//! Re-runs the whole pipeline server-side immediately before commit:
//! re-fetches the persisted cart, re-validates the coupon (codes expire and
//! exhaust usage between cart view and checkout), re-quotes shipping and
//! recomputes the breakdown from scratch. Whatever a client computed is
//! ignored; the breakdown produced here is what gets persisted and charged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::domain::aggregates::cart::{Cart, CartSnapshot};
use crate::domain::aggregates::order::{Order, OrderReceipt};
use crate::domain::value_objects::Pincode;
use crate::engine::coupon::{Coupon, CouponError, UserContext};
use crate::engine::pricing::{reconcile, AppliedCoupon, PriceBreakdown};
use crate::engine::session::EngineWarning;
use crate::engine::shipping::{self, CourierQuote, Parcel, SelectionMode, ShippingQuoteSet, ShippingSelection};
use crate::engine::EngineConfig;
use crate::ports::{CartRepository, CouponStore, OrderPersistence, ShippingProvider};
use crate::{EngineError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviewRequest {
    pub session_id: String,
    pub destination: Pincode,
    pub coupon_code: Option<String>,
    #[serde(default)]
    pub courier: SelectionMode,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub idempotency_key: String,
    #[serde(flatten)]
    pub preview: PreviewRequest,
}

/// How the requested coupon fared during the server-side re-validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "coupon", rename_all = "snake_case")]
pub enum CouponOutcome {
    None,
    Applied(AppliedCoupon),
    Rejected { code: String, reason: CouponError },
}

impl CouponOutcome {
    pub fn applied(&self) -> Option<&AppliedCoupon> {
        match self {
            CouponOutcome::Applied(a) => Some(a),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PreviewOutcome {
    pub breakdown: PriceBreakdown,
    pub coupon: CouponOutcome,
    pub shipping: ShippingSelection,
    pub snapshot: CartSnapshot,
    pub warnings: Vec<EngineWarning>,
}

pub struct OrderPreviewService {
    cart_repo: Arc<dyn CartRepository>,
    coupon_store: Arc<dyn CouponStore>,
    shipping: Arc<dyn ShippingProvider>,
    persistence: Arc<dyn OrderPersistence>,
    config: EngineConfig,
    order_numbers: AtomicU64,
}

impl OrderPreviewService {
    pub fn new(
        cart_repo: Arc<dyn CartRepository>,
        coupon_store: Arc<dyn CouponStore>,
        shipping: Arc<dyn ShippingProvider>,
        persistence: Arc<dyn OrderPersistence>,
        config: EngineConfig,
    ) -> Self {
        Self { cart_repo, coupon_store, shipping, persistence, config, order_numbers: AtomicU64::new(1000) }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The authoritative recomputation. A rejected coupon does not fail the
    /// preview; the breakdown simply carries no discount and the outcome says
    /// why. An unserviceable destination does fail: there is nothing to
    /// charge without a shipping answer.
    pub async fn preview(
        &self,
        req: &PreviewRequest,
        user: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<PreviewOutcome> {
        let source = self.cart_repo.get(&req.session_id).await?;
        let violations = source.stock_violations();
        if !violations.is_empty() {
            return Err(EngineError::Conflict(format!(
                "insufficient stock for {}",
                violations.join(", ")
            )));
        }
        let cart = Cart::normalize(source, &self.config.currency);
        if cart.is_empty() {
            return Err(EngineError::Conflict("cart is empty".into()));
        }
        let snapshot = cart.snapshot();
        let mut warnings = Vec::new();

        let coupon = match &req.coupon_code {
            None => CouponOutcome::None,
            Some(code) => match self.find_coupon_with_retry(code, &mut warnings, now).await? {
                None => CouponOutcome::Rejected { code: code.clone(), reason: CouponError::NotFound },
                Some(found) => match found.validate(&snapshot, user, now) {
                    Ok(app) => CouponOutcome::Applied(AppliedCoupon {
                        code: app.code,
                        discount_amount: app.discount,
                        computed_at: now,
                    }),
                    Err(reason) => {
                        tracing::info!(%code, %reason, "coupon failed server-side re-validation");
                        CouponOutcome::Rejected { code: code.clone(), reason }
                    }
                },
            },
        };

        let parcel = Parcel::from_snapshot(&snapshot);
        let quotes = self.quote_with_retry(&req.destination, &parcel, &mut warnings, now).await?;
        let set = ShippingQuoteSet::build(req.destination.clone(), quotes);
        let selection = shipping::resolve(&set, snapshot.subtotal_amount(), &req.courier, &self.config)?;

        let breakdown = reconcile(&snapshot, coupon.applied(), Some(&selection), &self.config);
        Ok(PreviewOutcome { breakdown, coupon, shipping: selection, snapshot, warnings })
    }

    /// Idempotent submission: replays return the already-committed order.
    /// Submission requires a settled coupon outcome; a coupon that fails
    /// re-validation here blocks the checkout rather than silently dropping
    /// the discount the user expects.
    pub async fn submit(
        &self,
        req: &CheckoutRequest,
        user: &UserContext,
        now: DateTime<Utc>,
    ) -> Result<OrderReceipt> {
        if let Some(existing) = self.persistence.find_by_idempotency_key(&req.idempotency_key).await? {
            tracing::info!(key = %req.idempotency_key, order_id = %existing.order_id, "idempotent checkout replay");
            return Ok(existing);
        }

        let outcome = self.preview(&req.preview, user, now).await?;
        if let CouponOutcome::Rejected { reason, .. } = &outcome.coupon {
            return Err(EngineError::Validation(reason.clone()));
        }

        let order_number = self.order_numbers.fetch_add(1, Ordering::SeqCst);
        let mut order = Order::create(
            order_number,
            &req.preview.session_id,
            &user.user_id,
            outcome.snapshot.lines.clone(),
            outcome.breakdown.clone(),
            req.preview.destination.clone(),
            outcome.coupon.applied().map(|a| a.code.clone()),
            &req.idempotency_key,
        );
        order.confirm(&self.config).map_err(|e| EngineError::Conflict(e.to_string()))?;
        let receipt = self.persistence.commit(&order).await?;
        for event in order.take_events() {
            tracing::info!(?event, "domain event");
        }
        if let Some(applied) = outcome.coupon.applied() {
            self.coupon_store.record_use(&applied.code, &user.user_id).await?;
        }
        tracing::info!(order_id = %receipt.order_id, total = %receipt.total, "order committed");
        Ok(receipt)
    }

    async fn find_coupon_with_retry(
        &self,
        code: &str,
        warnings: &mut Vec<EngineWarning>,
        now: DateTime<Utc>,
    ) -> Result<Option<Coupon>> {
        match self.coupon_store.find(code).await {
            Err(EngineError::Network(msg)) => {
                tracing::warn!(code, %msg, "coupon store failed; retrying once");
                warnings.push(EngineWarning { message: format!("coupon store retried: {msg}"), at: now });
                self.coupon_store.find(code).await
            }
            other => other,
        }
    }

    async fn quote_with_retry(
        &self,
        pincode: &Pincode,
        parcel: &Parcel,
        warnings: &mut Vec<EngineWarning>,
        now: DateTime<Utc>,
    ) -> Result<Vec<CourierQuote>> {
        match self.shipping.quote(pincode, parcel).await {
            Err(EngineError::Network(msg)) => {
                tracing::warn!(pincode = %pincode, %msg, "shipping provider failed; retrying once");
                warnings.push(EngineWarning { message: format!("shipping provider retried: {msg}"), at: now });
                self.shipping.quote(pincode, parcel).await
            }
            other => other,
        }
    }
}
