// =============================================================================
// TEST SUPPORT
// =============================================================================
// In-memory store, scripted gateway and request fixtures shared by the unit
// tests.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use metrics_exporter_prometheus::PrometheusBuilder;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::auth::Claims;
use crate::config::{Config, GatewayConfig};
use crate::error::{AppError, AppResult};
use crate::gateway::{compute_signature, PaymentGateway, PaymentSession, SessionRequest};
use crate::models::{
    NewOrder, NewOrderLine, Order, OrderLine, OrderStatus, OrderUpdate, PaymentRecord,
    PaymentStatus, PaymentUpsert, Product, ShippingMethod, StoreSettings,
};
use crate::recovery::attempt_base;
use crate::settings::SettingsCache;
use crate::store::Store;
use crate::AppState;

pub const TEST_SERVER_KEY: &str = "SB-Mid-server-test";
pub const TEST_JWT_SECRET: &str = "test-jwt-secret";

// =============================================================================
// IN-MEMORY STORE
// =============================================================================

#[derive(Default)]
struct MemoryState {
    products: HashMap<Uuid, Product>,
    sizes: HashMap<(Uuid, String), i32>,
    orders: HashMap<Uuid, Order>,
    lines: Vec<OrderLine>,
    payments: HashMap<Uuid, PaymentRecord>,
    settings: StoreSettings,
    fail_next_release: bool,
}

/// `Store` backed by a mutex-guarded map. Reservation is all-or-nothing
/// like the PostgreSQL transaction.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_product(&self, name: &str, price: i64, sizes: &[(&str, i32)]) -> Uuid {
        let id = Uuid::new_v4();
        let mut state = self.state.lock().await;
        state.products.insert(
            id,
            Product {
                id,
                name: name.to_string(),
                price: Decimal::from(price),
                category: None,
                is_active: true,
                stock: sizes.iter().map(|(_, stock)| stock).sum(),
            },
        );
        for (size, stock) in sizes {
            state.sizes.insert((id, size.to_string()), *stock);
        }
        id
    }

    pub async fn deactivate(&self, product_id: Uuid) {
        if let Some(product) = self.state.lock().await.products.get_mut(&product_id) {
            product.is_active = false;
        }
    }

    pub async fn stock(&self, product_id: Uuid, size: &str) -> i32 {
        self.state
            .lock()
            .await
            .sizes
            .get(&(product_id, size.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub async fn product_stock(&self, product_id: Uuid) -> i32 {
        self.state
            .lock()
            .await
            .products
            .get(&product_id)
            .map(|p| p.stock)
            .unwrap_or(0)
    }

    pub async fn set_settings(&self, settings: StoreSettings) {
        self.state.lock().await.settings = settings;
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }

    /// Makes the next `release_reservation` fail after restoring part of the
    /// order, as a dropped connection mid-transaction would.
    pub async fn fail_next_release(&self) {
        self.state.lock().await.fail_next_release = true;
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> bool {
        true
    }

    async fn get_product(&self, product_id: Uuid) -> AppResult<Option<Product>> {
        Ok(self.state.lock().await.products.get(&product_id).cloned())
    }

    async fn get_size_stock(&self, product_id: Uuid, size: &str) -> AppResult<Option<i32>> {
        Ok(self
            .state
            .lock()
            .await
            .sizes
            .get(&(product_id, size.to_string()))
            .copied())
    }

    async fn recompute_product_stock(&self, product_id: Uuid) -> AppResult<i32> {
        let mut state = self.state.lock().await;
        let total: i32 = state
            .sizes
            .iter()
            .filter(|((id, _), _)| *id == product_id)
            .map(|(_, stock)| *stock)
            .sum();
        if let Some(product) = state.products.get_mut(&product_id) {
            product.stock = total;
        }
        Ok(total)
    }

    async fn create_order_with_reservation(
        &self,
        order: &NewOrder,
        lines: &[NewOrderLine],
    ) -> AppResult<Order> {
        let mut state = self.state.lock().await;

        for line in lines {
            let available = state
                .sizes
                .get(&(line.product_id, line.size.clone()))
                .copied()
                .unwrap_or(0);
            if available < line.quantity {
                return Err(AppError::InsufficientStock {
                    product_id: line.product_id,
                    size: line.size.clone(),
                    available,
                    requested: line.quantity,
                });
            }
        }

        let now = Utc::now();
        let created = Order {
            id: Uuid::new_v4(),
            order_number: order.order_number.clone(),
            gateway_order_id: Some(order.order_number.clone()),
            user_id: order.user_id,
            total: order.total,
            shipping_fee: order.shipping_fee,
            status: OrderStatus::Pending,
            payment_method: None,
            payment_url: None,
            payment_token: None,
            tracking_number: None,
            shipping_method: order.shipping_method,
            shipping_address: order.shipping_address.clone(),
            buyer_name: order.buyer_name.clone(),
            buyer_email: order.buyer_email.clone(),
            buyer_phone: order.buyer_phone.clone(),
            stock_released_at: None,
            created_at: now,
            updated_at: now,
        };

        for line in lines {
            if let Some(stock) = state.sizes.get_mut(&(line.product_id, line.size.clone())) {
                *stock -= line.quantity;
            }
            state.lines.push(OrderLine {
                id: Uuid::new_v4(),
                order_id: created.id,
                product_id: line.product_id,
                size: line.size.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
            });
        }
        state.orders.insert(created.id, created.clone());

        Ok(created)
    }

    async fn find_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        Ok(self.state.lock().await.orders.get(&order_id).cloned())
    }

    async fn find_order_by_number(&self, reference: &str) -> AppResult<Option<Order>> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .find(|o| {
                o.order_number == reference
                    || o.gateway_order_id.as_deref() == Some(reference)
                    || o.order_number == attempt_base(reference)
            })
            .cloned())
    }

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>> {
        Ok(self
            .state
            .lock()
            .await
            .lines
            .iter()
            .filter(|line| line.order_id == order_id)
            .cloned()
            .collect())
    }

    async fn update_order(&self, order_id: Uuid, update: &OrderUpdate) -> AppResult<Order> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| AppError::NotFound(format!("Order {} not found", order_id)))?;

        if let Some(expected) = update.expected_status {
            if order.status != expected {
                return Err(AppError::Conflict(format!(
                    "Order {} is {}, expected {}",
                    order.order_number, order.status, expected
                )));
            }
        }

        if let Some(status) = update.status {
            order.status = status;
        }
        if let Some(method) = &update.payment_method {
            order.payment_method = Some(method.clone());
        }
        if let Some(url) = &update.payment_url {
            order.payment_url = url.clone();
        }
        if let Some(token) = &update.payment_token {
            order.payment_token = token.clone();
        }
        if let Some(gateway_order_id) = &update.gateway_order_id {
            order.gateway_order_id = Some(gateway_order_id.clone());
        }
        order.updated_at = Utc::now();

        Ok(order.clone())
    }

    async fn release_reservation(&self, order_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        match state.orders.get(&order_id) {
            Some(order) if order.stock_released_at.is_none() => {}
            _ => return Ok(false),
        }

        // Work on a copy so a failure leaves nothing behind
        let mut sizes = state.sizes.clone();
        let lines: Vec<(Uuid, String, i32)> = state
            .lines
            .iter()
            .filter(|line| line.order_id == order_id)
            .map(|line| (line.product_id, line.size.clone(), line.quantity))
            .collect();
        for (product_id, size, quantity) in lines {
            if let Some(stock) = sizes.get_mut(&(product_id, size)) {
                *stock = (*stock + quantity).max(0);
            }
            if state.fail_next_release {
                state.fail_next_release = false;
                return Err(AppError::Internal("connection reset during release".to_string()));
            }
        }

        state.sizes = sizes;
        if let Some(order) = state.orders.get_mut(&order_id) {
            order.stock_released_at = Some(Utc::now());
        }
        Ok(true)
    }

    async fn find_payment(&self, order_id: Uuid) -> AppResult<Option<PaymentRecord>> {
        Ok(self.state.lock().await.payments.get(&order_id).cloned())
    }

    async fn upsert_payment(&self, payment: &PaymentUpsert) -> AppResult<PaymentRecord> {
        let mut state = self.state.lock().await;
        let now = Utc::now();
        let record = state
            .payments
            .entry(payment.order_id)
            .or_insert_with(|| PaymentRecord {
                id: Uuid::new_v4(),
                order_id: payment.order_id,
                amount: payment.amount,
                status: payment.status,
                payment_proof: Value::Null,
                created_at: now,
                updated_at: now,
            });
        record.amount = payment.amount;
        record.status = payment.status;
        record.payment_proof = payment.payment_proof.clone();
        record.updated_at = now;
        Ok(record.clone())
    }

    async fn cancel_pending_payment(&self, order_id: Uuid) -> AppResult<bool> {
        let mut state = self.state.lock().await;
        match state.payments.get_mut(&order_id) {
            Some(record) if record.status == PaymentStatus::Pending => {
                record.status = PaymentStatus::Cancelled;
                record.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_settings(&self) -> AppResult<StoreSettings> {
        Ok(self.state.lock().await.settings.clone())
    }
}

// =============================================================================
// SCRIPTED GATEWAY
// =============================================================================

/// Gateway double: records session requests and answers status queries
/// from a per-id script. Ids without a script behave as unreachable.
#[derive(Default)]
pub struct ScriptedGateway {
    sessions: Mutex<Vec<SessionRequest>>,
    statuses: Mutex<HashMap<String, Value>>,
    fail_sessions: Mutex<bool>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn fail_sessions(&self) {
        *self.fail_sessions.lock().await = true;
    }

    pub async fn script_status(&self, gateway_order_id: &str, body: Value) {
        self.statuses
            .lock()
            .await
            .insert(gateway_order_id.to_string(), body);
    }

    pub async fn sessions(&self) -> Vec<SessionRequest> {
        self.sessions.lock().await.clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn create_session(&self, request: &SessionRequest) -> AppResult<PaymentSession> {
        if *self.fail_sessions.lock().await {
            return Err(AppError::UpstreamGateway("gateway returned 500".to_string()));
        }
        let mut sessions = self.sessions.lock().await;
        sessions.push(request.clone());
        let order_id = &request.transaction_details.order_id;
        Ok(PaymentSession {
            token: format!("token-{}", sessions.len()),
            redirect_url: format!("https://pay.example.com/v2/vtweb/{}", order_id),
        })
    }

    async fn transaction_status(&self, gateway_order_id: &str) -> AppResult<Value> {
        self.statuses
            .lock()
            .await
            .get(gateway_order_id)
            .cloned()
            .ok_or_else(|| AppError::GatewayTimeout("no scripted status".to_string()))
    }
}

// =============================================================================
// FIXTURES
// =============================================================================

/// Places a pending order for one line through the reservation path.
pub async fn seed_order(store: &dyn Store, product_id: Uuid, size: &str, quantity: i32) -> Order {
    seed_order_for(store, Uuid::new_v4(), product_id, size, quantity).await
}

pub async fn seed_order_for(
    store: &dyn Store,
    user_id: Uuid,
    product_id: Uuid,
    size: &str,
    quantity: i32,
) -> Order {
    let product = store.get_product(product_id).await.unwrap().unwrap();
    let total = product.price * Decimal::from(quantity);
    store
        .create_order_with_reservation(
            &NewOrder {
                order_number: format!("ORD-20261019-{}", &Uuid::new_v4().simple().to_string()[..6].to_uppercase()),
                user_id,
                total,
                shipping_fee: Decimal::ZERO,
                shipping_method: ShippingMethod::Regular,
                shipping_address: "Jl. Merdeka 1, Bandung".to_string(),
                buyer_name: "Sari".to_string(),
                buyer_email: "sari@example.com".to_string(),
                buyer_phone: "08123456789".to_string(),
            },
            &[NewOrderLine {
                product_id,
                size: size.to_string(),
                quantity,
                unit_price: product.price,
            }],
        )
        .await
        .unwrap()
}

/// A signed bank-transfer notification as the gateway would send it.
pub fn notification(order_id: &str, transaction_status: &str, gross_amount: &str) -> Value {
    let status_code = match transaction_status {
        "settlement" | "capture" => "200",
        "pending" => "201",
        "expire" => "407",
        _ => "202",
    };
    json!({
        "order_id": order_id,
        "status_code": status_code,
        "gross_amount": gross_amount,
        "signature_key": compute_signature(order_id, status_code, gross_amount, TEST_SERVER_KEY),
        "transaction_status": transaction_status,
        "fraud_status": "accept",
        "payment_type": "bank_transfer",
        "va_numbers": [{ "bank": "bca", "va_number": "8277000012345" }],
        "transaction_time": "2026-10-19 10:00:00"
    })
}

pub fn mint_token(secret: &str, user_id: Uuid, role: Option<&str>) -> String {
    let claims = Claims {
        sub: user_id.to_string(),
        exp: (Utc::now().timestamp() + 3600) as usize,
        role: role.map(str::to_string),
        email: None,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

pub fn test_config() -> Config {
    Config {
        port: 0,
        database_url: "postgres://unused".to_string(),
        redis_url: None,
        jwt_secret: TEST_JWT_SECRET.to_string(),
        gateway: GatewayConfig {
            server_key: TEST_SERVER_KEY.to_string(),
            snap_url: "https://snap.invalid".to_string(),
            api_url: "https://api.invalid".to_string(),
            timeout: Duration::from_secs(1),
        },
        app_base_url: "https://shop.example.com".to_string(),
        express_shipping_fee: Decimal::from(15000),
        amount_tolerance: Decimal::ONE,
        settings_ttl: Duration::from_secs(30),
    }
}

pub fn test_state(store: Arc<dyn Store>, gateway: Arc<dyn PaymentGateway>) -> Arc<AppState> {
    Arc::new(AppState {
        config: test_config(),
        store,
        gateway,
        settings: SettingsCache::new(Duration::ZERO, None),
        redis: None,
        metrics_handle: PrometheusBuilder::new().build_recorder().handle(),
    })
}
