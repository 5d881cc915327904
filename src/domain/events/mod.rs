//! Domain events
use rust_decimal::Decimal;

#[derive(Clone, Debug)]
pub enum DomainEvent {
    Coupon(CouponEvent),
    Order(OrderEvent),
}

#[derive(Clone, Debug)]
pub enum CouponEvent {
    Applied { session_id: String, code: String, discount: Decimal },
    Rejected { session_id: String, code: String, reason: String },
    Removed { session_id: String },
}

#[derive(Clone, Debug)]
pub enum OrderEvent {
    Created { order_id: String, session_id: String },
    Committed { order_id: String, total: Decimal },
    Cancelled { order_id: String },
}
