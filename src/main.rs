//! Storefront Pricing - Order Pricing & Coupon Reconciliation Service

use anyhow::Result;
use axum::{extract::{Path, State}, http::StatusCode, routing::{get, post, put}, Json, Router};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use validator::Validate;

use storefront_pricing::domain::aggregates::cart::{Cart, ProductSnapshot, ServerCartItem};
use storefront_pricing::engine::coupon::{self, Coupon, CouponScope, DiscountType, UserEligibility};
use storefront_pricing::engine::preview::{CheckoutRequest, PreviewRequest};
use storefront_pricing::engine::session::CheckoutSession;
use storefront_pricing::engine::shipping::{CourierQuote, Parcel, QuoteKey, SelectionMode, ShippingQuoteSet};
use storefront_pricing::ports::{CartRepository, CouponStore, InMemoryCartRepository, InMemoryCouponStore, InMemoryOrderPersistence, InMemoryShippingProvider, ShippingProvider};
use storefront_pricing::{EngineConfig, EngineError, OrderPreviewService, Pincode, UserContext};

#[derive(Clone)]
struct AppState {
    cart_repo: Arc<InMemoryCartRepository>,
    coupon_store: Arc<InMemoryCouponStore>,
    shipping: Arc<InMemoryShippingProvider>,
    service: Arc<OrderPreviewService>,
    sessions: Arc<Mutex<HashMap<String, CheckoutSession>>>,
    config: EngineConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into())).with(tracing_subscriber::fmt::layer()).init();

    let config = EngineConfig::from_env();
    let cart_repo = Arc::new(InMemoryCartRepository::new());
    let coupon_store = Arc::new(InMemoryCouponStore::new());
    let shipping = Arc::new(InMemoryShippingProvider::new());
    seed(&coupon_store, &shipping).await;
    let persistence = Arc::new(InMemoryOrderPersistence::new(config.clone()));
    let service = Arc::new(OrderPreviewService::new(cart_repo.clone(), coupon_store.clone(), shipping.clone(), persistence, config.clone()));
    let state = AppState { cart_repo, coupon_store, shipping, service, sessions: Arc::new(Mutex::new(HashMap::new())), config };

    let app = Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "storefront-pricing"})) }))
        .route("/api/v1/cart/:session", get(get_cart).post(add_to_cart).delete(clear_cart))
        .route("/api/v1/cart/:session/items/:product_id", put(update_item).delete(remove_item))
        .route("/api/v1/coupons/validate", post(validate_coupon))
        .route("/api/v1/coupons/remove", post(remove_coupon))
        .route("/api/v1/coupons/applicable", post(applicable_coupons))
        .route("/api/v1/shipping/quote", post(shipping_quote))
        .route("/api/v1/checkout/preview", post(checkout_preview))
        .route("/api/v1/checkout", post(checkout))
        .layer(TraceLayer::new_for_http()).layer(CorsLayer::permissive()).with_state(state);

    let port = std::env::var("PORT").unwrap_or_else(|_| "8084".to_string());
    tracing::info!("storefront-pricing listening on 0.0.0.0:{}", port);
    axum::serve(tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?, app).await?;
    Ok(())
}

/// Demo rate card and coupon book so the service answers out of the box.
async fn seed(coupons: &InMemoryCouponStore, shipping: &InMemoryShippingProvider) {
    let now = Utc::now();
    coupons.insert(Coupon { code: "WELCOME200".into(), discount_type: DiscountType::Fixed, discount_value: Decimal::new(200, 0), min_order_value: Decimal::new(1000, 0), max_discount_amount: None, scope: CouponScope::All, user_eligibility: UserEligibility::FirstTime, valid_from: now - Duration::days(30), valid_until: now + Duration::days(365), max_usage: None, per_user_limit: Some(1), usage_count: 0, is_active: true }).await;
    coupons.insert(Coupon { code: "SAVE10".into(), discount_type: DiscountType::Percentage, discount_value: Decimal::new(10, 0), min_order_value: Decimal::new(500, 0), max_discount_amount: Some(Decimal::new(150, 0)), scope: CouponScope::All, user_eligibility: UserEligibility::All, valid_from: now - Duration::days(30), valid_until: now + Duration::days(90), max_usage: Some(10_000), per_user_limit: Some(5), usage_count: 0, is_active: true }).await;
    for pincode in ["560001", "560034", "110001"] {
        shipping.serve(pincode, vec![
            CourierQuote { courier_id: "valuexp".into(), courier_name: "ValueExpress".into(), freight_charge: Decimal::new(40, 0), estimated_delivery_days: 6, rating: Decimal::new(39, 1) },
            CourierQuote { courier_id: "bluedash".into(), courier_name: "BlueDash".into(), freight_charge: Decimal::new(60, 0), estimated_delivery_days: 4, rating: Decimal::new(43, 1) },
            CourierQuote { courier_id: "ontime-air".into(), courier_name: "OnTime Air".into(), freight_charge: Decimal::new(120, 0), estimated_delivery_days: 1, rating: Decimal::new(46, 1) },
        ]).await;
    }
}

fn status_of(e: &EngineError) -> StatusCode {
    match e {
        EngineError::Validation(_) | EngineError::NotServiceable { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::Stale | EngineError::Conflict(_) => StatusCode::CONFLICT,
        EngineError::Network(_) => StatusCode::BAD_GATEWAY,
    }
}

fn reject(e: EngineError) -> (StatusCode, String) {
    (status_of(&e), e.to_string())
}

/// The demo deployment has no account service; every caller gets a context
/// derived from the supplied id.
fn user_context(user_id: Option<String>) -> UserContext {
    UserContext::new(user_id.unwrap_or_else(|| "guest".into()), Utc::now() - Duration::days(365))
}

async fn get_cart(State(s): State<AppState>, Path(session): Path<String>) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let source = s.cart_repo.get(&session).await.map_err(reject)?;
    let cart = Cart::normalize(source, &s.config.currency);
    let snapshot = cart.snapshot();
    s.sessions.lock().await.entry(session.clone()).or_insert_with(|| CheckoutSession::new(session)).observe_cart(snapshot.fingerprint);
    Ok(Json(serde_json::json!({"lines": snapshot.lines, "subtotal": snapshot.subtotal.rounded(), "total_items": snapshot.total_items})))
}

#[derive(Debug, Deserialize, Validate)]
struct AddItemRequest {
    #[validate(length(min = 1))]
    product_id: String,
    #[validate(range(min = 1, max = 99))]
    quantity: u32,
    selling_price: Decimal,
    category_id: Option<String>,
    unit_weight_grams: Option<u32>,
}

async fn add_to_cart(State(s): State<AppState>, Path(session): Path<String>, Json(r): Json<AddItemRequest>) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    r.validate().map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let item = ServerCartItem {
        id: uuid::Uuid::now_v7().to_string(),
        product_id: r.product_id,
        quantity: Some(r.quantity),
        variant: None,
        product: Some(ProductSnapshot { selling_price: Some(r.selling_price), base_price: None, category_id: r.category_id, unit_weight_grams: r.unit_weight_grams }),
        available_quantity: None,
    };
    s.cart_repo.upsert_item(&session, item).await;
    note_cart_change(&s, &session).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"status": "added"}))))
}

#[derive(Debug, Deserialize)]
struct UpdateQuantityRequest { quantity: u32 }

async fn update_item(State(s): State<AppState>, Path((session, product_id)): Path<(String, String)>, Json(r): Json<UpdateQuantityRequest>) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    s.cart_repo.update_quantity(&session, &product_id, r.quantity).await.map_err(reject)?;
    note_cart_change(&s, &session).await.map_err(reject)?;
    Ok(Json(serde_json::json!({"status": "updated"})))
}

async fn remove_item(State(s): State<AppState>, Path((session, product_id)): Path<(String, String)>) -> Result<StatusCode, (StatusCode, String)> {
    s.cart_repo.remove(&session, &product_id).await.map_err(reject)?;
    note_cart_change(&s, &session).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn clear_cart(State(s): State<AppState>, Path(session): Path<String>) -> Result<StatusCode, (StatusCode, String)> {
    s.cart_repo.clear(&session).await;
    note_cart_change(&s, &session).await.map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Re-fingerprint the cart so dependent session state (applied coupon,
/// memoized quotes) goes stale instead of silently persisting.
async fn note_cart_change(s: &AppState, session: &str) -> storefront_pricing::Result<()> {
    let source = s.cart_repo.get(session).await?;
    let snapshot = Cart::normalize(source, &s.config.currency).snapshot();
    s.sessions.lock().await.entry(session.to_string()).or_insert_with(|| CheckoutSession::new(session)).observe_cart(snapshot.fingerprint);
    Ok(())
}

#[derive(Debug, Deserialize)]
struct ValidateCouponRequest { session_id: String, code: String, user_id: Option<String> }

async fn validate_coupon(State(s): State<AppState>, Json(r): Json<ValidateCouponRequest>) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let source = s.cart_repo.get(&r.session_id).await.map_err(reject)?;
    let snapshot = Cart::normalize(source, &s.config.currency).snapshot();
    let user = user_context(r.user_id);
    let now = Utc::now();

    let mut sessions = s.sessions.lock().await;
    let sess = sessions.entry(r.session_id.clone()).or_insert_with(|| CheckoutSession::new(&r.session_id));
    sess.observe_cart(snapshot.fingerprint);
    let token = sess.begin_validation(r.code.trim().to_uppercase());

    let outcome = if let Some(cached) = sess.cached_application(r.code.trim().to_uppercase().as_str(), snapshot.subtotal_amount()).cloned() {
        Ok(cached)
    } else {
        match s.coupon_store.find(&r.code).await.map_err(reject)? {
            None => Err(coupon::CouponError::NotFound),
            Some(found) => found.validate(&snapshot, &user, now),
        }
    };
    if let Ok(app) = &outcome {
        sess.store_application(snapshot.subtotal_amount(), app.clone());
    }
    let accepted = sess.complete_validation(token, outcome.clone(), now);
    for event in sess.take_events() { tracing::info!(?event, "domain event"); }

    match outcome {
        Ok(app) if accepted => Ok(Json(serde_json::json!({"valid": true, "code": app.code, "discount": app.discount, "final_amount": app.final_amount}))),
        Ok(_) => Err((StatusCode::CONFLICT, "superseded by a newer request".into())),
        Err(e) => Err(reject(EngineError::Validation(e))),
    }
}

#[derive(Debug, Deserialize)]
struct RemoveCouponRequest { session_id: String }

async fn remove_coupon(State(s): State<AppState>, Json(r): Json<RemoveCouponRequest>) -> Json<serde_json::Value> {
    let mut sessions = s.sessions.lock().await;
    let sess = sessions.entry(r.session_id.clone()).or_insert_with(|| CheckoutSession::new(&r.session_id));
    sess.remove_coupon();
    for event in sess.take_events() { tracing::info!(?event, "domain event"); }
    Json(serde_json::json!({"status": "removed"}))
}

#[derive(Debug, Deserialize)]
struct ApplicableCouponsRequest { session_id: String, user_id: Option<String> }

async fn applicable_coupons(State(s): State<AppState>, Json(r): Json<ApplicableCouponsRequest>) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    let source = s.cart_repo.get(&r.session_id).await.map_err(reject)?;
    let snapshot = Cart::normalize(source, &s.config.currency).snapshot();
    let coupons = s.coupon_store.all_active().await.map_err(reject)?;
    let ranked = coupon::list_applicable(&coupons, &snapshot, &user_context(r.user_id), Utc::now(), s.config.near_miss_margin);
    Ok(Json(serde_json::json!({"coupons": ranked})))
}

#[derive(Debug, Deserialize, Validate)]
struct ShippingQuoteRequest {
    session_id: String,
    #[validate(length(min = 6, max = 6))]
    pincode: String,
}

async fn shipping_quote(State(s): State<AppState>, Json(r): Json<ShippingQuoteRequest>) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    r.validate().map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let pincode = Pincode::new(&r.pincode).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let source = s.cart_repo.get(&r.session_id).await.map_err(reject)?;
    let snapshot = Cart::normalize(source, &s.config.currency).snapshot();
    let key = QuoteKey::of(&pincode, &snapshot);
    let now = Utc::now();

    let mut sessions = s.sessions.lock().await;
    let sess = sessions.entry(r.session_id.clone()).or_insert_with(|| CheckoutSession::new(&r.session_id));
    sess.observe_cart(snapshot.fingerprint);
    sess.set_destination(pincode.clone());

    let set = if let Some(cached) = sess.cached_quotes(&key) {
        cached.clone()
    } else {
        match s.shipping.quote(&pincode, &Parcel::from_snapshot(&snapshot)).await {
            Ok(quotes) => {
                let set = ShippingQuoteSet::build(pincode.clone(), quotes);
                sess.store_quotes(key, set.clone());
                set
            }
            // fail soft: keep the last known rates on the screen, tell the
            // user they are possibly out of date
            Err(EngineError::Network(msg)) => match sess.last_known_quotes().cloned() {
                Some(last) => {
                    sess.push_warning(format!("shipping rates may be outdated: {msg}"), now);
                    last
                }
                None => return Err(reject(EngineError::Network(msg))),
            },
            Err(e) => return Err(reject(e)),
        }
    };
    if !set.serviceable {
        return Err(reject(EngineError::NotServiceable { pincode: r.pincode }));
    }
    let warnings = sess.drain_warnings();
    Ok(Json(serde_json::json!({"quotes": set, "warnings": warnings})))
}

#[derive(Debug, Deserialize, Validate)]
struct PreviewPayload {
    session_id: String,
    #[validate(length(min = 6, max = 6))]
    pincode: String,
    coupon_code: Option<String>,
    courier: Option<SelectionMode>,
    user_id: Option<String>,
}

impl PreviewPayload {
    fn to_request(&self) -> Result<PreviewRequest, (StatusCode, String)> {
        let destination = Pincode::new(&self.pincode).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
        Ok(PreviewRequest {
            session_id: self.session_id.clone(),
            destination,
            coupon_code: self.coupon_code.as_ref().map(|c| c.trim().to_uppercase()),
            courier: self.courier.clone().unwrap_or_default(),
        })
    }
}

async fn checkout_preview(State(s): State<AppState>, Json(r): Json<PreviewPayload>) -> Result<Json<serde_json::Value>, (StatusCode, String)> {
    r.validate().map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let req = r.to_request()?;
    let outcome = s.service.preview(&req, &user_context(r.user_id), Utc::now()).await.map_err(reject)?;
    Ok(Json(serde_json::json!({"breakdown": outcome.breakdown, "coupon": outcome.coupon, "shipping": outcome.shipping, "warnings": outcome.warnings})))
}

#[derive(Debug, Deserialize, Validate)]
struct CheckoutPayload {
    #[validate(length(min = 1))]
    idempotency_key: String,
    session_id: String,
    #[validate(length(min = 6, max = 6))]
    pincode: String,
    coupon_code: Option<String>,
    courier: Option<SelectionMode>,
    user_id: Option<String>,
}

async fn checkout(State(s): State<AppState>, Json(r): Json<CheckoutPayload>) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, String)> {
    r.validate().map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let destination = Pincode::new(&r.pincode).map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.to_string()))?;
    let user = user_context(r.user_id.clone());
    let now = Utc::now();

    let source = s.cart_repo.get(&r.session_id).await.map_err(reject)?;
    let snapshot = Cart::normalize(source, &s.config.currency).snapshot();
    let coupon_code = r.coupon_code.as_ref().map(|c| c.trim().to_uppercase());

    let courier = {
        let mut sessions = s.sessions.lock().await;
        let sess = sessions.entry(r.session_id.clone()).or_insert_with(|| CheckoutSession::new(&r.session_id));
        sess.observe_cart(snapshot.fingerprint);
        sess.set_destination(destination.clone());
        if let Some(picked) = r.courier.clone() {
            sess.set_courier(picked);
        }
        // a stale applied coupon silently re-validates before the gate
        if matches!(sess.ensure_submittable(), Err(EngineError::Stale)) {
            if let Some(code) = coupon_code.clone().or_else(|| sess.state().code().map(String::from)) {
                let token = sess.begin_validation(code.clone());
                let outcome = match s.coupon_store.find(&code).await.map_err(reject)? {
                    None => Err(coupon::CouponError::NotFound),
                    Some(found) => found.validate(&snapshot, &user, now),
                };
                sess.complete_validation(token, outcome, now);
            } else {
                sess.remove_coupon();
            }
        }
        sess.ensure_submittable().map_err(reject)?;
        for event in sess.take_events() { tracing::info!(?event, "domain event"); }
        sess.courier_selection().clone()
    };

    let req = CheckoutRequest {
        idempotency_key: r.idempotency_key,
        preview: PreviewRequest { session_id: r.session_id, destination, coupon_code, courier },
    };
    let receipt = s.service.submit(&req, &user, now).await.map_err(reject)?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({"order": receipt}))))
}
