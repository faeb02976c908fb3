// =============================================================================
// MODELS MODULE
// =============================================================================
// Data structures shared by the checkout, reconciliation and status paths.
//
// - Product rows are read-mostly; per-size stock (product_sizes) is the only
//   globally shared mutable resource.
// - Order / OrderLine / PaymentRecord are scoped to a single order.
// - API request/response shapes keep the storefront's wire names via serde
//   renames while the Rust names stay descriptive.
// =============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// =============================================================================
// STATUS ENUMS
// =============================================================================
// Status columns are VARCHAR in PostgreSQL and hold the lowercase variant
// name, which is also the JSON form.

// -----------------------------------------------------------------------------
// ORDER STATUS
// -----------------------------------------------------------------------------
/// Lifecycle of an order.
///
/// `pending → paid → processing → shipped → delivered`, with `pending →
/// cancelled` and `pending/paid → failed` side branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Paid,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Processing => "processing",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Delivered | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    /// Payment has been captured for this order (it may have moved on to
    /// fulfillment since).
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid
                | OrderStatus::Processing
                | OrderStatus::Shipped
                | OrderStatus::Delivered
        )
    }

    /// Stock reserved at checkout goes back to the shelf in these states.
    pub fn releases_stock(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Failed)
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Paid)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Paid, Processing)
                | (Paid, Failed)
                | (Processing, Shipped)
                | (Shipped, Delivered)
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// PAYMENT STATUS
// -----------------------------------------------------------------------------
/// Status of the single payment record kept per order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Cancelled,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Cancelled => "cancelled",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl From<OrderStatus> for PaymentStatus {
    fn from(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Pending => PaymentStatus::Pending,
            OrderStatus::Cancelled => PaymentStatus::Cancelled,
            OrderStatus::Failed => PaymentStatus::Failed,
            OrderStatus::Paid
            | OrderStatus::Processing
            | OrderStatus::Shipped
            | OrderStatus::Delivered => PaymentStatus::Paid,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// -----------------------------------------------------------------------------
// SHIPPING METHOD
// -----------------------------------------------------------------------------
/// Express shipping carries a flat surcharge; regular shipping is free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "varchar", rename_all = "lowercase")]
pub enum ShippingMethod {
    #[serde(alias = "standard")]
    Regular,
    #[serde(alias = "expedited")]
    Express,
}

impl ShippingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ShippingMethod::Regular => "regular",
            ShippingMethod::Express => "express",
        }
    }
}

impl fmt::Display for ShippingMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// CATALOG & INVENTORY LEDGER
// =============================================================================

/// Catalog entity. `stock` is a denormalized sum over its size rows, kept
/// for display only.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub price: Decimal,
    pub category: Option<String>,
    pub is_active: bool,
    pub stock: i32,
}

// =============================================================================
// ORDERS
// =============================================================================

/// Order header.
///
/// `order_number` is the external identifier sent to the gateway.
/// `gateway_order_id` is the identifier of the currently active payment
/// attempt; it equals `order_number` for the first attempt and carries an
/// attempt suffix after a payment method change.
///
/// The session token and the shipment tracking code live in separate
/// columns (`payment_token`, `tracking_number`).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub gateway_order_id: Option<String>,
    pub user_id: Uuid,
    pub total: Decimal,
    pub shipping_fee: Decimal,
    pub status: OrderStatus,
    pub payment_method: Option<String>,
    pub payment_url: Option<String>,
    pub payment_token: Option<String>,
    pub tracking_number: Option<String>,
    pub shipping_method: ShippingMethod,
    pub shipping_address: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub buyer_phone: String,
    /// Set once, when the checkout reservation has been returned to stock.
    pub stock_released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Identifier the gateway knows the active payment attempt by.
    pub fn gateway_reference(&self) -> &str {
        self.gateway_order_id.as_deref().unwrap_or(&self.order_number)
    }
}

/// One line of an order. `unit_price` is snapshotted at checkout and never
/// changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct OrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Order header as written by checkout.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub order_number: String,
    pub user_id: Uuid,
    pub total: Decimal,
    pub shipping_fee: Decimal,
    pub shipping_method: ShippingMethod,
    pub shipping_address: String,
    pub buyer_name: String,
    pub buyer_email: String,
    pub buyer_phone: String,
}

#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub product_id: Uuid,
    pub size: String,
    pub quantity: i32,
    pub unit_price: Decimal,
}

/// Partial update of an order header. `None` leaves a column untouched;
/// the nested options on nullable columns allow clearing them.
///
/// With `expected_status` set the update only applies while the stored
/// status still equals it; otherwise the store returns `Conflict`.
#[derive(Debug, Clone, Default)]
pub struct OrderUpdate {
    pub expected_status: Option<OrderStatus>,
    pub status: Option<OrderStatus>,
    pub payment_method: Option<String>,
    pub payment_url: Option<Option<String>>,
    pub payment_token: Option<Option<String>>,
    pub gateway_order_id: Option<String>,
}

// =============================================================================
// PAYMENT RECORDS
// =============================================================================

/// The single payment record of an order. `payment_proof` holds the last
/// gateway payload seen for it.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub payment_proof: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PaymentUpsert {
    pub order_id: Uuid,
    pub amount: Decimal,
    pub status: PaymentStatus,
    pub payment_proof: serde_json::Value,
}

// =============================================================================
// STORE SETTINGS
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreSettings {
    #[serde(default)]
    pub maintenance_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maintenance_message: Option<String>,
}

// =============================================================================
// API REQUEST/RESPONSE STRUCTURES
// =============================================================================

// -----------------------------------------------------------------------------
// CHECKOUT
// -----------------------------------------------------------------------------
/// Request body for checkout.
///
/// # Example JSON
/// ```json
/// {
///   "orderData": {
///     "total": 315000,
///     "nama_pembeli": "Sari",
///     "email_pembeli": "sari@example.com",
///     "telepon_pembeli": "08123456789",
///     "shipping_address": "Jl. Merdeka 1, Bandung",
///     "shipping_method": "express"
///   },
///   "items": [{ "product_id": "…", "quantity": 2, "ukuran": "M" }]
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    #[serde(rename = "orderData")]
    pub order_data: CheckoutOrderData,
    pub items: Vec<CartItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutOrderData {
    /// Total as computed by the client; only used to detect tampering.
    pub total: Decimal,
    #[serde(rename = "nama_pembeli")]
    pub buyer_name: String,
    #[serde(rename = "email_pembeli")]
    pub buyer_email: String,
    #[serde(rename = "telepon_pembeli")]
    pub buyer_phone: String,
    pub shipping_address: String,
    pub shipping_method: ShippingMethod,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub product_id: Uuid,
    pub quantity: i32,
    #[serde(rename = "ukuran")]
    pub size: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub token: String,
    pub redirect_url: String,
    pub order_id: Uuid,
    pub order_number: String,
}

// -----------------------------------------------------------------------------
// STATUS CHECK
// -----------------------------------------------------------------------------
/// Request body for the status poller. `order_id` accepts either the order
/// UUID or the order number carried on the gateway callback URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheckRequest {
    pub order_id: String,
    #[serde(default)]
    pub transaction_status: Option<String>,
    #[serde(default)]
    pub status_code: Option<String>,
}

/// Where the reported payment status came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusSource {
    Gateway,
    Callback,
    Stored,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusCheckResponse {
    pub order: Order,
    pub payment_status: PaymentStatus,
    pub source: StatusSource,
}

// -----------------------------------------------------------------------------
// PAYMENT URL RECOVERY
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverPaymentRequest {
    pub order_id: String,
    /// Optional label of the method the buyer intends to use next.
    #[serde(default)]
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverPaymentResponse {
    pub success: bool,
    pub payment_url: String,
    pub order_number: String,
}

// -----------------------------------------------------------------------------
// ORDER DETAIL
// -----------------------------------------------------------------------------
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderDetailResponse {
    pub order: Order,
    pub items: Vec<OrderLine>,
    pub payment: Option<PaymentRecord>,
}

// -----------------------------------------------------------------------------
// WEBHOOK ACKNOWLEDGEMENT
// -----------------------------------------------------------------------------
/// Body returned to the gateway. Ignored notifications still get HTTP 200 so
/// the gateway stops retrying them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAck {
    pub status: String,
    pub order_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_status: Option<OrderStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

// =============================================================================
// HEALTH CHECK RESPONSES
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
pub struct ReadinessResponse {
    pub status: String,
    pub checks: ReadinessChecks,
}

#[derive(Debug, Serialize)]
pub struct ReadinessChecks {
    pub database: bool,
    /// `None` when no Redis is configured.
    pub redis: Option<bool>,
}

// =============================================================================
// ERROR RESPONSES
// =============================================================================

/// API error response body
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error type/code
    pub error: String,

    /// Human-readable error message
    pub message: String,

    /// Coarse classification for the client's error surface:
    /// `validation`, `network`, `timeout` or `system`.
    pub error_type: String,

    /// Optional additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ErrorResponse {
    pub fn new(
        error: impl Into<String>,
        message: impl Into<String>,
        error_type: impl Into<String>,
    ) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
            error_type: error_type.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
