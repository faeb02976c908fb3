// =============================================================================
// RECONCILIATION MODULE
// =============================================================================
// Turns gateway transaction states into order and payment record state.
//
// `apply_gateway_status` is shared by the webhook and the status poller: it
// maps the status, applies the order transition, and upserts the payment
// record. Only the webhook path follows up with stock side effects.
//
// Stock policy: reserved at checkout, released on cancel/fail, never
// decremented again at settlement.
// =============================================================================

use rust_decimal::Decimal;

use crate::error::{AppError, AppResult};
use crate::gateway::{
    verify_signature, FraudStatus, GatewayNotification, TransactionStatus,
};
use crate::inventory;
use crate::metrics;
use crate::models::{Order, OrderStatus, OrderUpdate, PaymentStatus, PaymentUpsert};
use crate::store::Store;
use crate::AppState;

// =============================================================================
// STATUS MAPPING
// =============================================================================

/// Order status implied by a gateway transaction status. `None` means the
/// gateway state carries no order-level meaning (refunds, unknown values).
pub fn map_transaction_status(
    status: TransactionStatus,
    fraud: Option<FraudStatus>,
) -> Option<OrderStatus> {
    match status {
        TransactionStatus::Capture => match fraud {
            Some(FraudStatus::Challenge) => Some(OrderStatus::Pending),
            Some(FraudStatus::Deny) => Some(OrderStatus::Cancelled),
            _ => Some(OrderStatus::Paid),
        },
        TransactionStatus::Settlement => Some(OrderStatus::Paid),
        TransactionStatus::Cancel | TransactionStatus::Deny | TransactionStatus::Expire => {
            Some(OrderStatus::Cancelled)
        }
        TransactionStatus::Failure => Some(OrderStatus::Failed),
        TransactionStatus::Pending | TransactionStatus::Authorize => Some(OrderStatus::Pending),
        TransactionStatus::Refund | TransactionStatus::PartialRefund | TransactionStatus::Unknown => {
            None
        }
    }
}

/// The transition to apply, if any. A paid order cannot be cancelled, so a
/// gateway cancellation after capture fails it instead. Anything the
/// lifecycle does not allow is dropped.
pub fn resolve_transition(current: OrderStatus, mapped: OrderStatus) -> Option<OrderStatus> {
    let target = match (current, mapped) {
        (OrderStatus::Paid, OrderStatus::Cancelled) => OrderStatus::Failed,
        (_, mapped) => mapped,
    };

    if target != current && current.can_transition_to(target) {
        Some(target)
    } else {
        None
    }
}

pub fn amount_matches(order: &Order, notification: &GatewayNotification, tolerance: Decimal) -> bool {
    notification
        .gross_amount_value()
        .map(|amount| (amount - order.total).abs() <= tolerance)
        .unwrap_or(false)
}

// =============================================================================
// SHARED APPLICATION STEP
// =============================================================================

#[derive(Debug, Clone)]
pub struct Applied {
    pub order: Order,
    /// New order status, when this notification moved the order.
    pub transition: Option<OrderStatus>,
    /// Payment record status before this notification.
    pub previous_payment: Option<PaymentStatus>,
    pub payment_status: PaymentStatus,
}

impl Applied {
    pub fn already_paid(&self) -> bool {
        self.previous_payment == Some(PaymentStatus::Paid)
    }
}

/// Applies a gateway status to the order and its payment record. Never
/// touches stock.
///
/// The order write is guarded by the status it was read with. When another
/// writer got there first the order is re-read and the transition resolved
/// again against the fresh status.
pub async fn apply_gateway_status(
    store: &dyn Store,
    order: Order,
    notification: &GatewayNotification,
    source: &str,
) -> AppResult<Applied> {
    let mapped = map_transaction_status(notification.transaction_status, notification.fraud_status);
    let previous_payment = store.find_payment(order.id).await?.map(|p| p.status);

    let mut order = order;
    let mut retried = false;
    let (order, transition) = loop {
        let transition = mapped.and_then(|status| resolve_transition(order.status, status));

        let update = OrderUpdate {
            expected_status: Some(order.status),
            status: transition,
            payment_method: notification.payment_method_label(),
            // A paid order has nothing left to pay
            payment_url: (transition == Some(OrderStatus::Paid)).then_some(None),
            ..OrderUpdate::default()
        };

        if update.status.is_none() && update.payment_method.is_none() && update.payment_url.is_none()
        {
            break (order, transition);
        }

        match store.update_order(order.id, &update).await {
            Ok(updated) => break (updated, transition),
            Err(AppError::Conflict(_)) if !retried => {
                retried = true;
                tracing::info!(
                    order_number = %order.order_number,
                    source,
                    "Order changed concurrently, re-reading before applying gateway status"
                );
                order = store.find_order(order.id).await?.ok_or_else(|| {
                    AppError::NotFound(format!("Order not found: {}", order.order_number))
                })?;
            }
            Err(e) => return Err(e),
        }
    };

    if let Some(status) = mapped {
        if transition.is_none() && status != order.status {
            tracing::warn!(
                order_number = %order.order_number,
                current = %order.status,
                reported = %status,
                transaction_status = ?notification.transaction_status,
                source,
                "Gateway status does not fit order lifecycle, keeping current status"
            );
        }
    }

    let payment_status = match (transition, mapped) {
        (Some(to), _) => PaymentStatus::from(to),
        (None, Some(status)) if status == order.status => PaymentStatus::from(status),
        _ => previous_payment.unwrap_or_else(|| PaymentStatus::from(order.status)),
    };

    store
        .upsert_payment(&PaymentUpsert {
            order_id: order.id,
            amount: order.total,
            status: payment_status,
            payment_proof: notification.raw.clone(),
        })
        .await?;

    if let Some(to) = transition {
        metrics::record_transition(to.as_str(), source);
        tracing::info!(
            order_number = %order.order_number,
            status = %to,
            source,
            "Order status updated from gateway"
        );
    }

    Ok(Applied {
        order,
        transition,
        previous_payment,
        payment_status,
    })
}

// =============================================================================
// WEBHOOK RECONCILER
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum WebhookOutcome {
    Processed {
        order_number: String,
        order_status: OrderStatus,
    },
    /// Acknowledged without acting on it. The gateway must not retry these.
    Ignored {
        order_id: String,
        reason: &'static str,
    },
}

/// Handles one inbound gateway notification.
///
/// Errors: `Validation` for unreadable payloads, `InvalidSignature` when the
/// signature does not verify. Unknown orders, amount mismatches and
/// notifications for superseded payment attempts are `Ignored`.
pub async fn handle_notification(
    state: &AppState,
    payload: serde_json::Value,
) -> AppResult<WebhookOutcome> {
    let store = state.store.as_ref();
    let notification = GatewayNotification::from_payload(payload)?;

    if !verify_signature(&notification, &state.config.gateway.server_key) {
        metrics::record_webhook("invalid_signature", "signature");
        tracing::warn!(
            gateway_order_id = %notification.order_id,
            "Rejected notification with invalid signature"
        );
        return Err(AppError::InvalidSignature);
    }

    let Some(order) = store.find_order_by_number(&notification.order_id).await? else {
        return Ok(ignored(&notification, "order_not_found"));
    };

    if !amount_matches(&order, &notification, state.config.amount_tolerance) {
        tracing::warn!(
            order_number = %order.order_number,
            expected = %order.total,
            received = %notification.gross_amount,
            "Notification amount does not match order total"
        );
        return Ok(ignored(&notification, "amount_mismatch"));
    }

    let mapped = map_transaction_status(notification.transaction_status, notification.fraud_status);
    let superseded = notification.order_id != order.gateway_reference();
    if superseded && mapped != Some(OrderStatus::Paid) {
        // A replaced attempt expiring must not cancel the live one
        return Ok(ignored(&notification, "superseded_attempt"));
    }

    let applied = apply_gateway_status(store, order, &notification, "webhook").await?;
    let order = &applied.order;

    if mapped == Some(OrderStatus::Paid) {
        if applied.already_paid() {
            tracing::info!(
                order_number = %order.order_number,
                "Duplicate settlement notification, no side effects"
            );
        } else if order.status == OrderStatus::Paid {
            tracing::info!(
                order_number = %order.order_number,
                "Payment settled, reserved stock committed"
            );
        } else {
            tracing::warn!(
                order_number = %order.order_number,
                status = %order.status,
                "Payment captured for an order that is no longer payable"
            );
        }
    }

    if order.status.releases_stock() {
        let lines = store.order_lines(order.id).await?;
        inventory::release_order_stock(store, order, &lines).await?;
    }

    metrics::record_webhook("processed", notification_reason(&notification));

    Ok(WebhookOutcome::Processed {
        order_number: order.order_number.clone(),
        order_status: order.status,
    })
}

fn ignored(notification: &GatewayNotification, reason: &'static str) -> WebhookOutcome {
    metrics::record_webhook("ignored", reason);
    tracing::info!(
        gateway_order_id = %notification.order_id,
        reason,
        "Notification acknowledged and ignored"
    );
    WebhookOutcome::Ignored {
        order_id: notification.order_id.clone(),
        reason,
    }
}

fn notification_reason(notification: &GatewayNotification) -> &'static str {
    match notification.transaction_status {
        TransactionStatus::Capture | TransactionStatus::Settlement => "settled",
        TransactionStatus::Cancel | TransactionStatus::Deny | TransactionStatus::Expire => {
            "cancelled"
        }
        TransactionStatus::Failure => "failed",
        TransactionStatus::Pending | TransactionStatus::Authorize => "pending",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthUser;
    use crate::models::RecoverPaymentRequest;
    use crate::recovery::recover_payment_url;
    use crate::testing::{
        notification, seed_order, seed_order_for, test_state, MemoryStore, ScriptedGateway,
        TEST_SERVER_KEY,
    };
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_status_mapping() {
        use TransactionStatus::*;
        assert_eq!(
            map_transaction_status(Capture, Some(FraudStatus::Accept)),
            Some(OrderStatus::Paid)
        );
        assert_eq!(
            map_transaction_status(Capture, Some(FraudStatus::Challenge)),
            Some(OrderStatus::Pending)
        );
        assert_eq!(map_transaction_status(Settlement, None), Some(OrderStatus::Paid));
        for status in [Cancel, Deny, Expire] {
            assert_eq!(map_transaction_status(status, None), Some(OrderStatus::Cancelled));
        }
        assert_eq!(map_transaction_status(Pending, None), Some(OrderStatus::Pending));
        assert_eq!(map_transaction_status(Failure, None), Some(OrderStatus::Failed));
        assert_eq!(map_transaction_status(Refund, None), None);
    }

    #[test]
    fn test_resolve_transition() {
        assert_eq!(
            resolve_transition(OrderStatus::Pending, OrderStatus::Paid),
            Some(OrderStatus::Paid)
        );
        assert_eq!(resolve_transition(OrderStatus::Paid, OrderStatus::Paid), None);
        assert_eq!(
            resolve_transition(OrderStatus::Paid, OrderStatus::Cancelled),
            Some(OrderStatus::Failed)
        );
        assert_eq!(resolve_transition(OrderStatus::Cancelled, OrderStatus::Paid), None);
        assert_eq!(resolve_transition(OrderStatus::Shipped, OrderStatus::Pending), None);
    }

    async fn setup(stock: i32, quantity: i32) -> (Arc<MemoryStore>, Arc<AppState>, Order, uuid::Uuid) {
        let store = Arc::new(MemoryStore::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", stock)]).await;
        let order = seed_order(store.as_ref(), product_id, "M", quantity).await;
        let state = test_state(store.clone(), Arc::new(ScriptedGateway::new()));
        (store, state, order, product_id)
    }

    #[tokio::test]
    async fn test_settlement_marks_paid_without_touching_stock() {
        let (store, state, order, product_id) = setup(5, 2).await;
        assert_eq!(store.stock(product_id, "M").await, 3);

        let payload = notification(&order.order_number, "settlement", "300000.00");
        let outcome = handle_notification(&state, payload).await.unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                order_number: order.order_number.clone(),
                order_status: OrderStatus::Paid,
            }
        );
        let stored = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Paid);
        assert!(stored.payment_url.is_none());
        assert_eq!(stored.payment_method.as_deref(), Some("BCA Virtual Account"));
        assert_eq!(store.stock(product_id, "M").await, 3);

        let payment = store.find_payment(order.id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Paid);
        assert_eq!(payment.payment_proof["transaction_status"], "settlement");
    }

    #[tokio::test]
    async fn test_duplicate_settlement_is_idempotent() {
        let (store, state, order, product_id) = setup(5, 2).await;
        let payload = notification(&order.order_number, "settlement", "300000.00");

        handle_notification(&state, payload.clone()).await.unwrap();
        let outcome = handle_notification(&state, payload).await.unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Processed { order_status: OrderStatus::Paid, .. }
        ));
        assert_eq!(store.stock(product_id, "M").await, 3);
    }

    #[tokio::test]
    async fn test_expire_cancels_and_restores_stock_once() {
        let (store, state, order, product_id) = setup(5, 2).await;
        let payload = notification(&order.order_number, "expire", "300000.00");

        handle_notification(&state, payload.clone()).await.unwrap();
        assert_eq!(store.stock(product_id, "M").await, 5);
        assert_eq!(store.product_stock(product_id).await, 5);

        handle_notification(&state, payload).await.unwrap();
        assert_eq!(store.stock(product_id, "M").await, 5);

        let stored = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert_eq!(
            store.find_payment(order.id).await.unwrap().unwrap().status,
            PaymentStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn test_invalid_signature_is_rejected_without_mutation() {
        let (store, state, order, product_id) = setup(5, 2).await;
        let mut payload = notification(&order.order_number, "expire", "300000.00");
        payload["signature_key"] = json!("deadbeef");

        let result = handle_notification(&state, payload).await;

        assert!(matches!(result, Err(AppError::InvalidSignature)));
        assert_eq!(store.stock(product_id, "M").await, 3);
        assert_eq!(
            store.find_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );
        assert!(store.find_payment(order.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_amount_mismatch_is_ignored() {
        let (store, state, order, _) = setup(5, 2).await;
        let payload = notification(&order.order_number, "settlement", "1000.00");

        let outcome = handle_notification(&state, payload).await.unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Ignored {
                order_id: order.order_number.clone(),
                reason: "amount_mismatch",
            }
        );
        assert_eq!(
            store.find_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_unknown_order_is_ignored() {
        let (_, state, _, _) = setup(5, 2).await;
        let payload = notification("ORD-19700101-NOPE00", "settlement", "300000.00");

        let outcome = handle_notification(&state, payload).await.unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Ignored { reason: "order_not_found", .. }
        ));
    }

    #[tokio::test]
    async fn test_superseded_attempt_cannot_cancel_live_attempt() {
        let (store, state, order, product_id) = setup(5, 2).await;
        let attempt = format!("{}-ATTEMPT-1760000000000", order.order_number);
        store
            .update_order(
                order.id,
                &OrderUpdate {
                    gateway_order_id: Some(attempt.clone()),
                    ..OrderUpdate::default()
                },
            )
            .await
            .unwrap();

        let stale = notification(&order.order_number, "expire", "300000.00");
        let outcome = handle_notification(&state, stale).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Ignored { reason: "superseded_attempt", .. }
        ));
        assert_eq!(store.stock(product_id, "M").await, 3);

        let live = notification(&attempt, "settlement", "300000.00");
        let outcome = handle_notification(&state, live).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Processed { order_status: OrderStatus::Paid, .. }
        ));
    }

    #[tokio::test]
    async fn test_late_settlement_does_not_reopen_cancelled_order() {
        let (store, state, order, product_id) = setup(5, 2).await;

        handle_notification(&state, notification(&order.order_number, "expire", "300000.00"))
            .await
            .unwrap();
        let outcome = handle_notification(
            &state,
            notification(&order.order_number, "settlement", "300000.00"),
        )
        .await
        .unwrap();

        assert!(matches!(
            outcome,
            WebhookOutcome::Processed { order_status: OrderStatus::Cancelled, .. }
        ));
        assert_eq!(store.stock(product_id, "M").await, 5);
        let payment = store.find_payment(order.id).await.unwrap().unwrap();
        assert_eq!(payment.payment_proof["transaction_status"], "settlement");
    }

    #[tokio::test]
    async fn test_settlement_read_before_user_cancel_keeps_cancellation() {
        let (store, _, order, product_id) = setup(5, 2).await;
        let read_before_cancel = order.clone();
        store
            .update_order(
                order.id,
                &OrderUpdate {
                    expected_status: Some(OrderStatus::Pending),
                    status: Some(OrderStatus::Cancelled),
                    ..OrderUpdate::default()
                },
            )
            .await
            .unwrap();

        let payload = notification(&order.order_number, "settlement", "300000.00");
        let parsed = GatewayNotification::from_payload(payload).unwrap();
        let applied = apply_gateway_status(store.as_ref(), read_before_cancel, &parsed, "webhook")
            .await
            .unwrap();

        assert_eq!(applied.transition, None);
        assert_eq!(applied.order.status, OrderStatus::Cancelled);
        assert_eq!(
            store.find_order(order.id).await.unwrap().unwrap().status,
            OrderStatus::Cancelled
        );
        assert_eq!(store.stock(product_id, "M").await, 3);
    }

    #[tokio::test]
    async fn test_settlement_for_older_attempt_after_two_recoveries() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5)]).await;
        let user = AuthUser {
            user_id: uuid::Uuid::new_v4(),
            role: None,
        };
        let order = seed_order_for(store.as_ref(), user.user_id, product_id, "M", 2).await;
        let state = test_state(store.clone(), gateway.clone());

        for method in ["BCA Virtual Account", "QRIS"] {
            recover_payment_url(
                &state,
                &user,
                RecoverPaymentRequest {
                    order_id: order.order_number.clone(),
                    payment_method: Some(method.to_string()),
                },
            )
            .await
            .unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        }

        let sessions = gateway.sessions().await;
        let first_attempt = sessions[0].transaction_details.order_id.clone();
        let live_attempt = sessions[1].transaction_details.order_id.clone();
        assert_ne!(first_attempt, live_attempt);

        let outcome = handle_notification(
            &state,
            notification(&first_attempt, "settlement", "300000.00"),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome,
            WebhookOutcome::Processed {
                order_number: order.order_number.clone(),
                order_status: OrderStatus::Paid,
            }
        );
        let stored = store.find_order(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Paid);
        assert_eq!(stored.gateway_order_id.as_deref(), Some(live_attempt.as_str()));
        assert_eq!(store.stock(product_id, "M").await, 3);

        let stale_expiry = notification(&first_attempt, "expire", "300000.00");
        let outcome = handle_notification(&state, stale_expiry).await.unwrap();
        assert!(matches!(
            outcome,
            WebhookOutcome::Ignored { reason: "superseded_attempt", .. }
        ));
    }

    #[test]
    fn test_signature_helper_uses_server_key() {
        let payload = notification("ORD-1", "settlement", "10.00");
        let parsed = GatewayNotification::from_payload(payload).unwrap();
        assert!(verify_signature(&parsed, TEST_SERVER_KEY));
    }
}
