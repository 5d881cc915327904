//! Order Aggregate
//!
//! A committed order carries the server-computed breakdown, never anything a
//! client sent. Confirmation re-checks the breakdown invariants.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::aggregates::cart::CartLine;
use crate::domain::events::{DomainEvent, OrderEvent};
use crate::domain::value_objects::{Money, Pincode};
use crate::engine::pricing::{BreakdownViolation, PriceBreakdown};
use crate::engine::EngineConfig;

#[derive(Clone, Debug)]
pub struct Order {
    id: String,
    order_number: u64,
    session_id: String,
    customer_id: String,
    status: OrderStatus,
    lines: Vec<CartLine>,
    breakdown: PriceBreakdown,
    destination: Pincode,
    coupon_code: Option<String>,
    idempotency_key: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Cancelled,
}

impl Order {
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        order_number: u64,
        session_id: impl Into<String>,
        customer_id: impl Into<String>,
        lines: Vec<CartLine>,
        breakdown: PriceBreakdown,
        destination: Pincode,
        coupon_code: Option<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        let id = Uuid::new_v4().to_string();
        let session_id = session_id.into();
        let now = Utc::now();
        let mut order = Self {
            id: id.clone(),
            order_number,
            session_id: session_id.clone(),
            customer_id: customer_id.into(),
            status: OrderStatus::Pending,
            lines,
            breakdown,
            destination,
            coupon_code,
            idempotency_key: idempotency_key.into(),
            created_at: now,
            updated_at: now,
            events: vec![],
        };
        order.raise_event(DomainEvent::Order(OrderEvent::Created { order_id: id, session_id }));
        order
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn order_number(&self) -> u64 {
        self.order_number
    }

    pub fn status(&self) -> &OrderStatus {
        &self.status
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn breakdown(&self) -> &PriceBreakdown {
        &self.breakdown
    }

    pub fn destination(&self) -> &Pincode {
        &self.destination
    }

    pub fn coupon_code(&self) -> Option<&str> {
        self.coupon_code.as_deref()
    }

    pub fn idempotency_key(&self) -> &str {
        &self.idempotency_key
    }

    pub fn total(&self) -> &Money {
        &self.breakdown.total
    }

    pub fn confirm(&mut self, config: &EngineConfig) -> Result<(), OrderError> {
        if self.lines.is_empty() {
            return Err(OrderError::NoItems);
        }
        self.breakdown.verify(config)?;
        self.status = OrderStatus::Confirmed;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Committed {
            order_id: self.id.clone(),
            total: self.breakdown.total.amount(),
        }));
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), OrderError> {
        if self.status == OrderStatus::Confirmed {
            return Err(OrderError::AlreadyCommitted);
        }
        self.status = OrderStatus::Cancelled;
        self.touch();
        self.raise_event(DomainEvent::Order(OrderEvent::Cancelled { order_id: self.id.clone() }));
        Ok(())
    }

    pub fn take_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.events)
    }

    fn raise_event(&mut self, e: DomainEvent) {
        self.events.push(e);
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// What callers get back after a commit.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderReceipt {
    pub order_id: String,
    pub order_number: u64,
    pub total: Money,
    pub breakdown: PriceBreakdown,
}

impl OrderReceipt {
    pub fn of(order: &Order) -> Self {
        Self {
            order_id: order.id.clone(),
            order_number: order.order_number,
            total: order.breakdown.total.clone(),
            breakdown: order.breakdown.clone(),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum OrderError {
    #[error("order has no items")]
    NoItems,
    #[error("order already committed")]
    AlreadyCommitted,
    #[error("price breakdown rejected: {0}")]
    InvalidBreakdown(#[from] BreakdownViolation),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::cart::{Cart, CartSource, GuestCartItem};
    use crate::engine::pricing::reconcile;
    use rust_decimal::Decimal;

    fn order() -> Order {
        let cart = Cart::normalize(
            CartSource::Guest(vec![GuestCartItem {
                product_id: "P1".into(),
                selling_price: Some(Decimal::new(500, 0)),
                quantity: Some(1),
                ..Default::default()
            }]),
            "INR",
        );
        let snap = cart.snapshot();
        let breakdown = reconcile(&snap, None, None, &EngineConfig::default());
        Order::create(
            1001,
            "sess-1",
            "U1",
            snap.lines,
            breakdown,
            Pincode::new("560001").unwrap(),
            None,
            "idem-1",
        )
    }

    #[test]
    fn test_confirm_checks_invariants() {
        let mut o = order();
        assert_eq!(o.order_number(), 1001);
        assert_eq!(o.lines().len(), 1);
        assert_eq!(o.destination().as_str(), "560001");
        assert!(o.coupon_code().is_none());
        o.confirm(&EngineConfig::default()).unwrap();
        assert_eq!(o.status(), &OrderStatus::Confirmed);
        assert_eq!(o.total().amount(), Decimal::new(59000, 2));
        let events = o.take_events();
        assert_eq!(events.len(), 2); // created + committed
    }

    #[test]
    fn test_confirm_rejects_tampered_breakdown() {
        let mut o = order();
        o.breakdown.total = Money::inr(Decimal::ONE);
        assert!(matches!(o.confirm(&EngineConfig::default()), Err(OrderError::InvalidBreakdown(_))));
    }

    #[test]
    fn test_cannot_cancel_after_commit() {
        let mut o = order();
        o.confirm(&EngineConfig::default()).unwrap();
        assert!(o.cancel().is_err());
    }
}
