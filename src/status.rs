// =============================================================================
// STATUS MODULE
// =============================================================================
// Client-driven reconciliation: the status poller and user cancellation.
//
// The poller prefers an authoritative gateway query and persists what the
// gateway reports. Status hints from the callback URL are echoed back when the
// gateway is unreachable, but never persisted: anyone can forge a query
// string. The poller never touches stock; user cancellation releases it.
// =============================================================================

use uuid::Uuid;

use crate::auth::AuthUser;
use crate::error::{AppError, AppResult};
use crate::gateway::{GatewayNotification, TransactionStatus};
use crate::inventory;
use crate::metrics;
use crate::models::{
    Order, OrderStatus, OrderUpdate, PaymentStatus, StatusCheckRequest, StatusCheckResponse,
    StatusSource,
};
use crate::reconcile::{amount_matches, apply_gateway_status, map_transaction_status};
use crate::store::Store;
use crate::AppState;

/// Resolves an order reference (UUID or order number) to an order owned by
/// `user`. Foreign orders are reported as missing.
pub async fn find_owned_order(
    store: &dyn Store,
    user: &AuthUser,
    reference: &str,
) -> AppResult<Order> {
    let reference = reference.trim();
    let order = match Uuid::parse_str(reference) {
        Ok(id) => store.find_order(id).await?,
        Err(_) => store.find_order_by_number(reference).await?,
    };

    order
        .filter(|order| order.user_id == user.user_id)
        .ok_or_else(|| AppError::NotFound(format!("Order {} not found", reference)))
}

pub async fn check_status(
    state: &AppState,
    user: &AuthUser,
    request: StatusCheckRequest,
) -> AppResult<StatusCheckResponse> {
    let store = state.store.as_ref();
    let order = find_owned_order(store, user, &request.order_id).await?;

    if let Some(notification) = query_gateway(state, &order).await {
        let applied = apply_gateway_status(store, order, &notification, "poller").await?;
        return Ok(StatusCheckResponse {
            order: applied.order,
            payment_status: applied.payment_status,
            source: StatusSource::Gateway,
        });
    }

    let hinted = request
        .transaction_status
        .as_deref()
        .map(TransactionStatus::parse)
        .and_then(|status| map_transaction_status(status, None));

    if let Some(status) = hinted {
        tracing::debug!(
            order_number = %order.order_number,
            hinted = %status,
            status_code = ?request.status_code,
            "Reporting callback status hint without persisting it"
        );
        return Ok(StatusCheckResponse {
            order,
            payment_status: PaymentStatus::from(status),
            source: StatusSource::Callback,
        });
    }

    let payment_status = store
        .find_payment(order.id)
        .await?
        .map(|payment| payment.status)
        .unwrap_or_else(|| PaymentStatus::from(order.status));

    Ok(StatusCheckResponse {
        order,
        payment_status,
        source: StatusSource::Stored,
    })
}

/// Asks the gateway about the order's active attempt. `None` when the
/// gateway is unreachable, does not know the transaction, or reports an
/// amount that does not match the order.
async fn query_gateway(state: &AppState, order: &Order) -> Option<GatewayNotification> {
    let reference = order.gateway_reference();

    let body = match state.gateway.transaction_status(reference).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!(
                order_number = %order.order_number,
                error = %e,
                "Gateway status query failed, falling back"
            );
            return None;
        }
    };

    // Unknown transactions come back as a 404 body without a status
    let notification = GatewayNotification::from_payload(body).ok()?;

    if !amount_matches(order, &notification, state.config.amount_tolerance) {
        tracing::warn!(
            order_number = %order.order_number,
            expected = %order.total,
            received = %notification.gross_amount,
            "Gateway status amount does not match order total"
        );
        return None;
    }

    Some(notification)
}

/// User-initiated cancellation of a still-pending order. Releases the
/// checkout reservation through the same once-only path as the webhook.
pub async fn cancel_order(state: &AppState, user: &AuthUser, reference: &str) -> AppResult<Order> {
    let store = state.store.as_ref();
    let order = find_owned_order(store, user, reference).await?;
    cancel_loaded_order(store, user, order).await
}

/// Cancels `order` as it was read. The write only applies while the stored
/// status is still `pending`, so a settlement landing in between wins and
/// the caller gets `Conflict`.
async fn cancel_loaded_order(
    store: &dyn Store,
    user: &AuthUser,
    order: Order,
) -> AppResult<Order> {
    if order.status != OrderStatus::Pending {
        return Err(AppError::Conflict(format!(
            "Order {} is {} and can no longer be cancelled",
            order.order_number, order.status
        )));
    }

    let order = store
        .update_order(
            order.id,
            &OrderUpdate {
                expected_status: Some(OrderStatus::Pending),
                status: Some(OrderStatus::Cancelled),
                payment_url: Some(None),
                payment_token: Some(None),
                ..OrderUpdate::default()
            },
        )
        .await?;
    store.cancel_pending_payment(order.id).await?;
    metrics::record_transition(OrderStatus::Cancelled.as_str(), "user");

    tracing::info!(
        order_number = %order.order_number,
        user_id = %user.user_id,
        "Order cancelled by buyer"
    );

    let lines = store.order_lines(order.id).await?;
    inventory::release_order_stock(store, &order, &lines).await?;

    Ok(order)
}
