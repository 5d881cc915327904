//! Collaborator interfaces
//!
//! The engine consumes the cart store, coupon store, shipping provider and
//! order persistence through these traits. The in-memory implementations back
//! the service by default and double as test fixtures; a transient-failure
//! hook on the shipping provider exercises the bounded-retry path.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::Mutex;

use crate::domain::aggregates::cart::{CartSource, ServerCartItem};
use crate::domain::aggregates::order::{Order, OrderReceipt};
use crate::domain::value_objects::Pincode;
use crate::engine::coupon::Coupon;
use crate::engine::shipping::{CourierQuote, Parcel};
use crate::engine::EngineConfig;
use crate::{EngineError, Result};

#[async_trait]
pub trait CartRepository: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<CartSource>;
    async fn update_quantity(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<()>;
    async fn remove(&self, session_id: &str, product_id: &str) -> Result<()>;
}

#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn find(&self, code: &str) -> Result<Option<Coupon>>;
    async fn all_active(&self) -> Result<Vec<Coupon>>;
    async fn record_use(&self, code: &str, user_id: &str) -> Result<()>;
}

#[async_trait]
pub trait ShippingProvider: Send + Sync {
    async fn quote(&self, pincode: &Pincode, parcel: &Parcel) -> Result<Vec<CourierQuote>>;
}

#[async_trait]
pub trait OrderPersistence: Send + Sync {
    /// Commit an order atomically. Must reject a breakdown whose invariants
    /// do not hold, and must be idempotent over the order's idempotency key.
    async fn commit(&self, order: &Order) -> Result<OrderReceipt>;
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OrderReceipt>>;
}

// ---------------------------------------------------------------------------
// In-memory implementations
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryCartRepository {
    carts: Mutex<HashMap<String, Vec<ServerCartItem>>>,
}

impl InMemoryCartRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert_item(&self, session_id: &str, item: ServerCartItem) {
        let mut carts = self.carts.lock().await;
        let rows = carts.entry(session_id.to_string()).or_default();
        if let Some(existing) = rows.iter_mut().find(|r| r.product_id == item.product_id) {
            let added = item.quantity.unwrap_or(0);
            existing.quantity = Some(existing.quantity.unwrap_or(0).saturating_add(added));
        } else {
            rows.push(item);
        }
    }

    pub async fn clear(&self, session_id: &str) {
        self.carts.lock().await.remove(session_id);
    }
}

#[async_trait]
impl CartRepository for InMemoryCartRepository {
    async fn get(&self, session_id: &str) -> Result<CartSource> {
        let carts = self.carts.lock().await;
        Ok(CartSource::Server(carts.get(session_id).cloned().unwrap_or_default()))
    }

    async fn update_quantity(&self, session_id: &str, product_id: &str, quantity: u32) -> Result<()> {
        let mut carts = self.carts.lock().await;
        let rows = carts
            .get_mut(session_id)
            .ok_or_else(|| EngineError::Conflict("cart not found".into()))?;
        if quantity == 0 {
            rows.retain(|r| r.product_id != product_id);
            return Ok(());
        }
        let row = rows
            .iter_mut()
            .find(|r| r.product_id == product_id)
            .ok_or_else(|| EngineError::Conflict("cart item not found".into()))?;
        row.quantity = Some(quantity);
        Ok(())
    }

    async fn remove(&self, session_id: &str, product_id: &str) -> Result<()> {
        let mut carts = self.carts.lock().await;
        let rows = carts
            .get_mut(session_id)
            .ok_or_else(|| EngineError::Conflict("cart not found".into()))?;
        let before = rows.len();
        rows.retain(|r| r.product_id != product_id);
        if rows.len() == before {
            return Err(EngineError::Conflict("cart item not found".into()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryCouponStore {
    coupons: Mutex<HashMap<String, Coupon>>,
}

impl InMemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, coupon: Coupon) {
        self.coupons.lock().await.insert(coupon.code.clone(), coupon);
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn find(&self, code: &str) -> Result<Option<Coupon>> {
        let code = code.trim().to_uppercase();
        Ok(self.coupons.lock().await.get(&code).cloned())
    }

    async fn all_active(&self) -> Result<Vec<Coupon>> {
        Ok(self.coupons.lock().await.values().filter(|c| c.is_active).cloned().collect())
    }

    async fn record_use(&self, code: &str, user_id: &str) -> Result<()> {
        let mut coupons = self.coupons.lock().await;
        if let Some(coupon) = coupons.get_mut(code) {
            coupon.usage_count += 1;
            tracing::info!(code, user_id, usage = coupon.usage_count, "coupon redeemed");
        }
        Ok(())
    }
}

/// Parcels heavier than this pick up a flat surcharge per courier.
const HEAVY_PARCEL_GRAMS: u32 = 5_000;

pub struct InMemoryShippingProvider {
    zones: Mutex<HashMap<String, Vec<CourierQuote>>>,
    heavy_surcharge: Decimal,
    fail_times: AtomicU32,
}

impl Default for InMemoryShippingProvider {
    fn default() -> Self {
        Self {
            zones: Mutex::new(HashMap::new()),
            heavy_surcharge: Decimal::new(40, 0),
            fail_times: AtomicU32::new(0),
        }
    }
}

impl InMemoryShippingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn serve(&self, pincode: &str, quotes: Vec<CourierQuote>) {
        self.zones.lock().await.insert(pincode.to_string(), quotes);
    }

    /// Make the next `n` quote calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.fail_times.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShippingProvider for InMemoryShippingProvider {
    async fn quote(&self, pincode: &Pincode, parcel: &Parcel) -> Result<Vec<CourierQuote>> {
        if self.fail_times.load(Ordering::SeqCst) > 0 {
            self.fail_times.fetch_sub(1, Ordering::SeqCst);
            return Err(EngineError::Network("shipping provider timed out".into()));
        }
        let zones = self.zones.lock().await;
        let mut quotes = zones.get(pincode.as_str()).cloned().unwrap_or_default();
        if parcel.weight_grams > HEAVY_PARCEL_GRAMS {
            for q in &mut quotes {
                q.freight_charge += self.heavy_surcharge;
            }
        }
        Ok(quotes)
    }
}

pub struct InMemoryOrderPersistence {
    config: EngineConfig,
    orders: Mutex<HashMap<String, OrderReceipt>>,
    by_key: Mutex<HashMap<String, String>>,
}

impl InMemoryOrderPersistence {
    pub fn new(config: EngineConfig) -> Self {
        Self { config, orders: Mutex::new(HashMap::new()), by_key: Mutex::new(HashMap::new()) }
    }

    pub async fn order_count(&self) -> usize {
        self.orders.lock().await.len()
    }
}

#[async_trait]
impl OrderPersistence for InMemoryOrderPersistence {
    async fn commit(&self, order: &Order) -> Result<OrderReceipt> {
        let mut by_key = self.by_key.lock().await;
        let mut orders = self.orders.lock().await;
        if let Some(order_id) = by_key.get(order.idempotency_key()) {
            if let Some(existing) = orders.get(order_id) {
                return Ok(existing.clone());
            }
        }
        order
            .breakdown()
            .verify(&self.config)
            .map_err(|v| EngineError::Conflict(format!("breakdown rejected: {v}")))?;
        let receipt = OrderReceipt::of(order);
        by_key.insert(order.idempotency_key().to_string(), order.id().to_string());
        orders.insert(order.id().to_string(), receipt.clone());
        Ok(receipt)
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<OrderReceipt>> {
        let by_key = self.by_key.lock().await;
        let orders = self.orders.lock().await;
        Ok(by_key.get(key).and_then(|id| orders.get(id)).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::cart::{Cart, GuestCartItem};
    use crate::domain::value_objects::{Money, Pincode};
    use crate::engine::pricing::reconcile;

    fn quote(id: &str, charge: i64, days: u32) -> CourierQuote {
        CourierQuote {
            courier_id: id.into(),
            courier_name: id.to_uppercase(),
            freight_charge: Decimal::new(charge, 0),
            estimated_delivery_days: days,
            rating: Decimal::new(40, 1),
        }
    }

    #[tokio::test]
    async fn test_cart_repository_roundtrip() {
        let repo = InMemoryCartRepository::new();
        repo.upsert_item(
            "s1",
            ServerCartItem { id: "r1".into(), product_id: "P1".into(), quantity: Some(2), ..Default::default() },
        )
        .await;
        repo.upsert_item(
            "s1",
            ServerCartItem { id: "r2".into(), product_id: "P1".into(), quantity: Some(1), ..Default::default() },
        )
        .await;
        repo.update_quantity("s1", "P1", 5).await.unwrap();
        match repo.get("s1").await.unwrap() {
            CartSource::Server(rows) => {
                assert_eq!(rows.len(), 1);
                assert_eq!(rows[0].quantity, Some(5));
            }
            _ => panic!("expected server shape"),
        }
        repo.update_quantity("s1", "P1", 0).await.unwrap();
        assert!(repo.remove("s1", "P1").await.is_err());
    }

    #[tokio::test]
    async fn test_shipping_provider_fail_hook_and_surcharge() {
        let provider = InMemoryShippingProvider::new();
        provider.serve("560001", vec![quote("std", 60, 4)]).await;
        provider.fail_next(1);
        let pin = Pincode::new("560001").unwrap();
        let light = Parcel { value: Decimal::new(500, 0), weight_grams: 800, item_count: 1 };
        assert!(matches!(provider.quote(&pin, &light).await, Err(EngineError::Network(_))));
        assert_eq!(provider.quote(&pin, &light).await.unwrap()[0].freight_charge, Decimal::new(60, 0));

        let heavy = Parcel { value: Decimal::new(500, 0), weight_grams: 9_000, item_count: 1 };
        assert_eq!(provider.quote(&pin, &heavy).await.unwrap()[0].freight_charge, Decimal::new(100, 0));
    }

    #[tokio::test]
    async fn test_persistence_rejects_invariant_violations() {
        let config = EngineConfig::default();
        let persistence = InMemoryOrderPersistence::new(config.clone());
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
        let mut breakdown = reconcile(&snap, None, None, &config);
        breakdown.gst_amount = Money::inr(Decimal::ZERO);
        let order = Order::create(
            1,
            "s1",
            "U1",
            snap.lines,
            breakdown,
            Pincode::new("560001").unwrap(),
            None,
            "key-1",
        );
        assert!(matches!(persistence.commit(&order).await, Err(EngineError::Conflict(_))));
        assert_eq!(persistence.order_count().await, 0);
    }
}
