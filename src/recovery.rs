// =============================================================================
// RECOVERY MODULE
// =============================================================================
// Payment URL recovery and payment method change.
//
// Each recovery opens a new payment attempt under a fresh gateway id, since
// the gateway refuses to reuse a transaction id. The previous pending payment
// record is cancelled first so at most one attempt is active.
// =============================================================================

use chrono::Utc;

use crate::auth::AuthUser;
use crate::checkout::session_request_for;
use crate::error::{AppError, AppResult};
use crate::gateway::MAX_GATEWAY_ORDER_ID_LEN;
use crate::models::{OrderUpdate, PaymentStatus, RecoverPaymentRequest, RecoverPaymentResponse};
use crate::status::find_owned_order;
use crate::AppState;

const ATTEMPT_MARKER: &str = "-ATTEMPT-";

/// `<order_number>-ATTEMPT-<epoch-ms>`, cut to the gateway id limit.
pub fn attempt_order_id(order_number: &str, epoch_ms: i64) -> String {
    format!("{}{}{}", order_number, ATTEMPT_MARKER, epoch_ms)
        .chars()
        .take(MAX_GATEWAY_ORDER_ID_LEN)
        .collect()
}

/// Order number an attempt id was minted from. Any other reference comes
/// back unchanged.
pub fn attempt_base(reference: &str) -> &str {
    reference
        .split_once(ATTEMPT_MARKER)
        .map(|(order_number, _)| order_number)
        .unwrap_or(reference)
}

pub async fn recover_payment_url(
    state: &AppState,
    user: &AuthUser,
    request: RecoverPaymentRequest,
) -> AppResult<RecoverPaymentResponse> {
    let store = state.store.as_ref();
    let order = find_owned_order(store, user, &request.order_id).await?;

    if order.status.is_settled() {
        return Err(AppError::Conflict(format!(
            "Order {} is already paid",
            order.order_number
        )));
    }
    if order.status.is_terminal() {
        return Err(AppError::Conflict(format!(
            "Order {} is {} and can no longer be paid",
            order.order_number, order.status
        )));
    }

    // A settlement may have landed since the order was read
    if let Some(payment) = store.find_payment(order.id).await? {
        if payment.status == PaymentStatus::Paid {
            return Err(AppError::Conflict(format!(
                "Payment for order {} has already succeeded",
                order.order_number
            )));
        }
    }

    if store.cancel_pending_payment(order.id).await? {
        tracing::info!(
            order_number = %order.order_number,
            "Cancelled previous pending payment attempt"
        );
    }

    let attempt_id = attempt_order_id(&order.order_number, Utc::now().timestamp_millis());
    let lines = store.order_lines(order.id).await?;
    let session_request =
        session_request_for(store, &state.config, &order, &lines, &attempt_id).await?;
    let session = state.gateway.create_session(&session_request).await?;

    let order = store
        .update_order(
            order.id,
            &OrderUpdate {
                expected_status: Some(order.status),
                payment_method: request.payment_method,
                payment_url: Some(Some(session.redirect_url.clone())),
                payment_token: Some(Some(session.token)),
                gateway_order_id: Some(attempt_id.clone()),
                ..OrderUpdate::default()
            },
        )
        .await?;

    tracing::info!(
        order_number = %order.order_number,
        gateway_order_id = %attempt_id,
        "New payment attempt created"
    );

    Ok(RecoverPaymentResponse {
        success: true,
        payment_url: session.redirect_url,
        order_number: order.order_number,
    })
}
