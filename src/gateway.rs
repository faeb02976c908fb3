// =============================================================================
// PAYMENT GATEWAY MODULE
// =============================================================================
// Everything that talks to, or comes from, the hosted payment gateway:
//
// - Session requests (hosted checkout page + token)
// - Transaction status queries
// - Notification signatures
// - The typed notification model used by the reconciler and the poller
//
// Calls are fire-and-wait with a client-wide timeout and no retries.
// =============================================================================

use std::time::Instant;

use async_trait::async_trait;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha512};

use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Gateway limit on the length of a transaction id.
pub const MAX_GATEWAY_ORDER_ID_LEN: usize = 50;

// =============================================================================
// SESSION REQUEST
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub transaction_details: TransactionDetails,
    pub item_details: Vec<ItemDetail>,
    pub customer_details: CustomerDetails,
    pub callbacks: Callbacks,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionDetails {
    pub order_id: String,
    pub gross_amount: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemDetail {
    pub id: String,
    pub price: i64,
    pub quantity: i32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerDetails {
    pub first_name: String,
    pub email: String,
    pub phone: String,
    pub shipping_address: ShippingAddress,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShippingAddress {
    pub first_name: String,
    pub phone: String,
    pub address: String,
}

/// Browser redirect targets after the hosted page. Each one carries the order
/// number plus `{status_code}` and `{transaction_status}` placeholders that the
/// gateway fills in on redirect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Callbacks {
    pub finish: String,
    pub unfinish: String,
    pub error: String,
}

impl Callbacks {
    pub fn for_order(app_base_url: &str, order_number: &str) -> Self {
        let url = |outcome: &str| {
            format!(
                "{}/payment/{}?order_id={}&status_code={{status_code}}&transaction_status={{transaction_status}}",
                app_base_url, outcome, order_number
            )
        };
        Self {
            finish: url("finish"),
            unfinish: url("unfinish"),
            error: url("error"),
        }
    }
}

/// Gateway amounts are whole currency units.
pub fn to_gateway_amount(amount: Decimal) -> AppResult<i64> {
    amount
        .round()
        .to_i64()
        .ok_or_else(|| AppError::Validation(format!("Amount out of range: {}", amount)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentSession {
    pub token: String,
    pub redirect_url: String,
}

// =============================================================================
// GATEWAY TRAIT
// =============================================================================

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a hosted payment session for one transaction id.
    async fn create_session(&self, request: &SessionRequest) -> AppResult<PaymentSession>;

    /// Asks the gateway for the current state of a transaction. The answer
    /// has the same shape as a notification.
    async fn transaction_status(&self, gateway_order_id: &str) -> AppResult<serde_json::Value>;
}

// =============================================================================
// HTTP CLIENT
// =============================================================================

pub struct MidtransClient {
    http: reqwest::Client,
    config: GatewayConfig,
}

impl MidtransClient {
    pub fn new(config: GatewayConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { http, config })
    }

    async fn check(response: reqwest::Response) -> AppResult<reqwest::Response> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(AppError::UpstreamGateway(format!(
            "gateway returned {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl PaymentGateway for MidtransClient {
    async fn create_session(&self, request: &SessionRequest) -> AppResult<PaymentSession> {
        let start = Instant::now();

        let result = async {
            let response = self
                .http
                .post(format!("{}/snap/v1/transactions", self.config.snap_url))
                .basic_auth(&self.config.server_key, None::<&str>)
                .json(request)
                .send()
                .await?;
            let session: PaymentSession = Self::check(response).await?.json().await?;
            Ok::<_, AppError>(session)
        }
        .await;

        metrics::record_gateway_call("create_session", result.is_ok(), start.elapsed().as_secs_f64());

        match &result {
            Ok(_) => tracing::info!(
                gateway_order_id = %request.transaction_details.order_id,
                gross_amount = request.transaction_details.gross_amount,
                "Payment session created"
            ),
            Err(e) => tracing::warn!(
                gateway_order_id = %request.transaction_details.order_id,
                error = %e,
                "Payment session request failed"
            ),
        }

        result
    }

    async fn transaction_status(&self, gateway_order_id: &str) -> AppResult<serde_json::Value> {
        let start = Instant::now();

        let result = async {
            let response = self
                .http
                .get(format!("{}/v2/{}/status", self.config.api_url, gateway_order_id))
                .basic_auth(&self.config.server_key, None::<&str>)
                .send()
                .await?;
            let body: serde_json::Value = Self::check(response).await?.json().await?;
            Ok::<_, AppError>(body)
        }
        .await;

        metrics::record_gateway_call(
            "transaction_status",
            result.is_ok(),
            start.elapsed().as_secs_f64(),
        );

        result
    }
}

// =============================================================================
// SIGNATURES
// =============================================================================

/// `hex(SHA-512(order_id + status_code + gross_amount + server_key))`
pub fn compute_signature(
    order_id: &str,
    status_code: &str,
    gross_amount: &str,
    server_key: &str,
) -> String {
    let mut hasher = Sha512::new();
    hasher.update(order_id.as_bytes());
    hasher.update(status_code.as_bytes());
    hasher.update(gross_amount.as_bytes());
    hasher.update(server_key.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_signature(notification: &GatewayNotification, server_key: &str) -> bool {
    let expected = compute_signature(
        &notification.order_id,
        &notification.status_code,
        &notification.gross_amount,
        server_key,
    );
    constant_time_eq(&expected, &notification.signature_key.to_ascii_lowercase())
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

// =============================================================================
// NOTIFICATION MODEL
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Authorize,
    Capture,
    Settlement,
    Pending,
    Deny,
    Cancel,
    Expire,
    Failure,
    Refund,
    PartialRefund,
    #[serde(other)]
    Unknown,
}

impl TransactionStatus {
    pub fn parse(raw: &str) -> Self {
        serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase()))
            .unwrap_or(TransactionStatus::Unknown)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FraudStatus {
    Accept,
    Challenge,
    Deny,
    #[serde(other)]
    Unknown,
}

/// Payment channel reported by the gateway, used to build a display label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentChannel {
    BankTransfer { bank: Option<String> },
    MandiriBill,
    ConvenienceStore { store: Option<String> },
    CreditCard { bank: Option<String> },
    EWallet(String),
    Qris,
    Other(String),
}

impl PaymentChannel {
    pub fn label(&self) -> String {
        match self {
            PaymentChannel::BankTransfer { bank: Some(bank) } => {
                format!("{} Virtual Account", bank.to_ascii_uppercase())
            }
            PaymentChannel::BankTransfer { bank: None } => "Bank Transfer".to_string(),
            PaymentChannel::MandiriBill => "Mandiri Bill Payment".to_string(),
            PaymentChannel::ConvenienceStore { store: Some(store) } => title_case(store),
            PaymentChannel::ConvenienceStore { store: None } => "Convenience Store".to_string(),
            PaymentChannel::CreditCard { bank: Some(bank) } => {
                format!("Credit Card ({})", bank.to_ascii_uppercase())
            }
            PaymentChannel::CreditCard { bank: None } => "Credit Card".to_string(),
            PaymentChannel::EWallet(kind) => match kind.as_str() {
                "gopay" => "GoPay".to_string(),
                "shopeepay" => "ShopeePay".to_string(),
                other => title_case(other),
            },
            PaymentChannel::Qris => "QRIS".to_string(),
            PaymentChannel::Other(kind) => title_case(&kind.replace('_', " ")),
        }
    }
}

fn title_case(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Wire shape of a notification; only the fields we act on.
#[derive(Debug, Deserialize)]
struct NotificationFields {
    order_id: String,
    #[serde(default)]
    status_code: String,
    #[serde(default, deserialize_with = "string_or_number")]
    gross_amount: String,
    #[serde(default)]
    signature_key: String,
    transaction_status: String,
    #[serde(default)]
    fraud_status: Option<FraudStatus>,
    #[serde(default)]
    payment_type: Option<String>,
    #[serde(default)]
    va_numbers: Vec<VaNumber>,
    #[serde(default)]
    permata_va_number: Option<String>,
    #[serde(default)]
    bank: Option<String>,
    #[serde(default)]
    store: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VaNumber {
    bank: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        serde_json::Value::Null => Ok(String::new()),
        other => Err(serde::de::Error::custom(format!(
            "unexpected gross_amount: {}",
            other
        ))),
    }
}

/// A gateway notification (webhook body or status-query answer).
///
/// `gross_amount` keeps the exact string sent by the gateway because the
/// signature is computed over it. `raw` is the untouched payload, stored as
/// the payment record's proof.
#[derive(Debug, Clone)]
pub struct GatewayNotification {
    pub order_id: String,
    pub status_code: String,
    pub gross_amount: String,
    pub signature_key: String,
    pub transaction_status: TransactionStatus,
    pub fraud_status: Option<FraudStatus>,
    pub channel: Option<PaymentChannel>,
    pub raw: serde_json::Value,
}

impl GatewayNotification {
    pub fn from_payload(raw: serde_json::Value) -> AppResult<Self> {
        let fields: NotificationFields = serde_json::from_value(raw.clone())
            .map_err(|e| AppError::Validation(format!("Malformed notification: {}", e)))?;

        if fields.order_id.trim().is_empty() {
            return Err(AppError::Validation(
                "Notification is missing order_id".to_string(),
            ));
        }

        let channel = fields.payment_type.as_deref().map(|payment_type| {
            match payment_type {
                "bank_transfer" => PaymentChannel::BankTransfer {
                    bank: fields
                        .va_numbers
                        .first()
                        .map(|va| va.bank.clone())
                        .or_else(|| fields.permata_va_number.as_ref().map(|_| "permata".to_string()))
                        .or_else(|| fields.bank.clone()),
                },
                "echannel" => PaymentChannel::MandiriBill,
                "cstore" => PaymentChannel::ConvenienceStore {
                    store: fields.store.clone(),
                },
                "credit_card" => PaymentChannel::CreditCard {
                    bank: fields.bank.clone(),
                },
                "gopay" | "shopeepay" | "dana" | "ovo" => {
                    PaymentChannel::EWallet(payment_type.to_string())
                }
                "qris" => PaymentChannel::Qris,
                other => PaymentChannel::Other(other.to_string()),
            }
        });

        Ok(Self {
            order_id: fields.order_id,
            status_code: fields.status_code,
            gross_amount: fields.gross_amount,
            signature_key: fields.signature_key,
            transaction_status: TransactionStatus::parse(&fields.transaction_status),
            fraud_status: fields.fraud_status,
            channel,
            raw,
        })
    }

    pub fn gross_amount_value(&self) -> Option<Decimal> {
        self.gross_amount.trim().parse().ok()
    }

    pub fn payment_method_label(&self) -> Option<String> {
        self.channel.as_ref().map(PaymentChannel::label)
    }
}
