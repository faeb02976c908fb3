// =============================================================================
// HANDLERS MODULE
// =============================================================================
// HTTP request handlers (controller layer). Each handler extracts its input,
// delegates to the workflow module, and records request metrics.
//
// - Buyer endpoints authenticate with a bearer token (AuthUser extractor).
// - The gateway notification endpoint is unauthenticated; the reconciler
//   verifies the notification signature instead.
// =============================================================================

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;

use crate::auth::AuthUser;
use crate::checkout;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::*;
use crate::reconcile::{self, WebhookOutcome};
use crate::recovery;
use crate::status;
use crate::AppState;

fn observe<T>(method: &str, endpoint: &str, start: Instant, result: &AppResult<T>) {
    let status = match result {
        Ok(_) => StatusCode::OK,
        Err(e) => e.status_code(),
    };
    metrics::record_http_request(method, endpoint, status.as_u16(), start.elapsed().as_secs_f64());
}

// =============================================================================
// HEALTH CHECK ENDPOINTS
// =============================================================================

/// Liveness probe.
///
/// GET /health
pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        service: "order-payment-service".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness probe. Redis only counts when it is configured.
///
/// GET /ready
pub async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    let db_healthy = state.store.health_check().await;

    let redis_healthy = match &state.redis {
        Some(redis) => Some(
            redis::cmd("PING")
                .query_async::<_, String>(&mut redis.clone())
                .await
                .is_ok(),
        ),
        None => None,
    };

    let all_healthy = db_healthy && redis_healthy.unwrap_or(true);
    let response = ReadinessResponse {
        status: if all_healthy { "ready" } else { "not_ready" }.to_string(),
        checks: ReadinessChecks {
            database: db_healthy,
            redis: redis_healthy,
        },
    };

    if all_healthy {
        (StatusCode::OK, Json(response))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(response))
    }
}

// =============================================================================
// METRICS ENDPOINT
// =============================================================================
/// Prometheus metrics in text exposition format.
///
/// GET /metrics
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics_handle.render()
}

// =============================================================================
// CHECKOUT
// =============================================================================
/// Creates an order, reserves its stock and opens a payment session.
///
/// POST /api/v1/checkout
///
/// # Response
/// ```json
/// { "token": "…", "redirect_url": "https://…", "order_id": "…", "order_number": "ORD-20261019-AB12CD" }
/// ```
pub async fn checkout(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(request): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutResponse>> {
    let start = Instant::now();
    let result = checkout::place_order(&state, &user, request).await;
    observe("POST", "/api/v1/checkout", start, &result);
    result.map(Json)
}

// =============================================================================
// GATEWAY NOTIFICATIONS
// =============================================================================
/// Receives asynchronous payment notifications from the gateway.
///
/// POST /api/v1/payments/notification
///
/// Answers 200 for processed and ignored notifications alike so the gateway
/// only retries on signature failures and internal errors.
pub async fn payment_notification(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> AppResult<(StatusCode, Json<WebhookAck>)> {
    let start = Instant::now();
    let result = reconcile::handle_notification(&state, payload).await;
    observe("POST", "/api/v1/payments/notification", start, &result);

    let ack = match result? {
        WebhookOutcome::Processed {
            order_number,
            order_status,
        } => WebhookAck {
            status: "ok".to_string(),
            order_id: order_number,
            order_status: Some(order_status),
            reason: None,
        },
        WebhookOutcome::Ignored { order_id, reason } => WebhookAck {
            status: "ignored".to_string(),
            order_id,
            order_status: None,
            reason: Some(reason.to_string()),
        },
    };

    Ok((StatusCode::OK, Json(ack)))
}

// =============================================================================
// STATUS POLLER & RECOVERY
// =============================================================================
/// POST /api/v1/payments/status
pub async fn payment_status(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(request): Json<StatusCheckRequest>,
) -> AppResult<Json<StatusCheckResponse>> {
    let start = Instant::now();
    let result = status::check_status(&state, &user, request).await;
    observe("POST", "/api/v1/payments/status", start, &result);
    result.map(Json)
}

/// Opens a new payment attempt for an unpaid order.
///
/// POST /api/v1/payments/recover
pub async fn recover_payment(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Json(request): Json<RecoverPaymentRequest>,
) -> AppResult<Json<RecoverPaymentResponse>> {
    let start = Instant::now();
    let result = recovery::recover_payment_url(&state, &user, request).await;
    observe("POST", "/api/v1/payments/recover", start, &result);
    result.map(Json)
}

// =============================================================================
// ORDERS
// =============================================================================
/// GET /api/v1/orders/:id
pub async fn get_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(reference): Path<String>,
) -> AppResult<Json<OrderDetailResponse>> {
    let start = Instant::now();

    let result = async {
        let store = state.store.as_ref();
        let order = status::find_owned_order(store, &user, &reference).await?;
        let items = store.order_lines(order.id).await?;
        let payment = store.find_payment(order.id).await?;
        Ok::<_, AppError>(OrderDetailResponse {
            order,
            items,
            payment,
        })
    }
    .await;

    observe("GET", "/api/v1/orders/:id", start, &result);
    result.map(Json)
}

/// POST /api/v1/orders/:id/cancel
pub async fn cancel_order(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
    Path(reference): Path<String>,
) -> AppResult<Json<Order>> {
    let start = Instant::now();
    let result = status::cancel_order(&state, &user, &reference).await;
    observe("POST", "/api/v1/orders/:id/cancel", start, &result);
    result.map(Json)
}

// =============================================================================
// STORE SETTINGS
// =============================================================================
/// GET /api/v1/settings
pub async fn get_settings(State(state): State<Arc<AppState>>) -> AppResult<Json<StoreSettings>> {
    let settings = state.settings.get(state.store.as_ref()).await?;
    Ok(Json(settings))
}

/// Drops cached settings after an admin edit.
///
/// POST /api/v1/settings/refresh
pub async fn refresh_settings(
    State(state): State<Arc<AppState>>,
    user: AuthUser,
) -> AppResult<Json<StoreSettings>> {
    if !user.is_service() {
        return Err(AppError::Unauthorized(
            "Settings refresh requires the service role".to_string(),
        ));
    }

    state.settings.invalidate().await;
    let settings = state.settings.get(state.store.as_ref()).await?;
    Ok(Json(settings))
}
