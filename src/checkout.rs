// =============================================================================
// CHECKOUT MODULE
// =============================================================================
// Places an order: validates the cart against stock, recomputes the total
// from catalog prices, creates the order with its stock reservation in one
// unit, then opens a payment session with the gateway.
//
// Nothing is written until every check has passed. A gateway failure after
// the order exists leaves it pending without a payment URL; the buyer can
// recover it later through the payment recovery endpoint.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::auth::AuthUser;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::gateway::{
    to_gateway_amount, Callbacks, CustomerDetails, ItemDetail, SessionRequest, ShippingAddress,
    TransactionDetails,
};
use crate::inventory;
use crate::metrics;
use crate::models::{
    CheckoutRequest, CheckoutResponse, NewOrder, NewOrderLine, Order, OrderLine, OrderUpdate,
    Product, ShippingMethod,
};
use crate::store::Store;
use crate::AppState;

/// Gateway limit on item names.
const MAX_ITEM_NAME_LEN: usize = 50;
const SHIPPING_ITEM_ID: &str = "SHIPPING";

pub async fn place_order(
    state: &AppState,
    user: &AuthUser,
    request: CheckoutRequest,
) -> AppResult<CheckoutResponse> {
    let result = place_order_inner(state, user, request).await;
    metrics::record_checkout(match &result {
        Ok(_) => "success",
        Err(AppError::InsufficientStock { .. }) => "insufficient_stock",
        Err(AppError::PriceMismatch { .. }) => "price_mismatch",
        Err(AppError::Validation(_)) => "invalid",
        Err(AppError::Maintenance(_)) => "maintenance",
        Err(AppError::UpstreamGateway(_) | AppError::GatewayTimeout(_)) => "gateway_error",
        Err(_) => "error",
    });
    result
}

async fn place_order_inner(
    state: &AppState,
    user: &AuthUser,
    request: CheckoutRequest,
) -> AppResult<CheckoutResponse> {
    let store = state.store.as_ref();
    validate_request(&request)?;

    let settings = state.settings.get(store).await?;
    if settings.maintenance_mode {
        return Err(AppError::Maintenance(settings.maintenance_message.unwrap_or_else(
            || "The store is temporarily closed for maintenance".to_string(),
        )));
    }

    // ---------------------------------------------------------------------
    // STOCK & PRICE VALIDATION (read-only)
    // ---------------------------------------------------------------------
    let requested = inventory::merge_cart(&request.items);
    inventory::check_availability(store, &requested).await?;

    let mut products: HashMap<Uuid, Product> = HashMap::new();
    for (product_id, _) in requested.keys() {
        if products.contains_key(product_id) {
            continue;
        }
        let product = store
            .get_product(*product_id)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| {
                AppError::Validation(format!("Product {} is not available", product_id))
            })?;
        products.insert(*product_id, product);
    }

    let lines: Vec<NewOrderLine> = requested
        .iter()
        .map(|((product_id, size), quantity)| NewOrderLine {
            product_id: *product_id,
            size: size.clone(),
            quantity: *quantity,
            unit_price: products[product_id].price,
        })
        .collect();

    let order_data = request.order_data;
    let shipping_fee = shipping_fee(&state.config, order_data.shipping_method);
    let total = lines
        .iter()
        .map(|line| line.unit_price * Decimal::from(line.quantity))
        .sum::<Decimal>()
        + shipping_fee;

    if (order_data.total - total).abs() > state.config.amount_tolerance {
        tracing::warn!(
            user_id = %user.user_id,
            submitted = %order_data.total,
            computed = %total,
            "Checkout total does not match catalog prices"
        );
        return Err(AppError::PriceMismatch {
            submitted: order_data.total,
            computed: total,
        });
    }

    // ---------------------------------------------------------------------
    // ORDER + RESERVATION
    // ---------------------------------------------------------------------
    let order = store
        .create_order_with_reservation(
            &NewOrder {
                order_number: generate_order_number(),
                user_id: user.user_id,
                total,
                shipping_fee,
                shipping_method: order_data.shipping_method,
                shipping_address: order_data.shipping_address.trim().to_string(),
                buyer_name: order_data.buyer_name.trim().to_string(),
                buyer_email: order_data.buyer_email.trim().to_string(),
                buyer_phone: order_data.buyer_phone.trim().to_string(),
            },
            &lines,
        )
        .await?;

    for line in &lines {
        metrics::record_stock_mutation("reserve", line.quantity);
    }
    tracing::info!(
        order_number = %order.order_number,
        user_id = %user.user_id,
        total = %order.total,
        lines = lines.len(),
        "Order created and stock reserved"
    );

    inventory::refresh_aggregates(store, products.keys().copied()).await;

    // ---------------------------------------------------------------------
    // PAYMENT SESSION
    // ---------------------------------------------------------------------
    let order_lines = store.order_lines(order.id).await?;
    let session_request =
        session_request_for(store, &state.config, &order, &order_lines, &order.order_number)
            .await?;

    let session = match state.gateway.create_session(&session_request).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(
                order_number = %order.order_number,
                error = %e,
                "Payment session failed, order left pending for recovery"
            );
            return Err(match e {
                AppError::GatewayTimeout(_) => AppError::GatewayTimeout(format!(
                    "Payment for order {} could not be started in time",
                    order.order_number
                )),
                other => AppError::UpstreamGateway(format!(
                    "Could not start payment for order {}: {}",
                    order.order_number, other
                )),
            });
        }
    };

    let order = store
        .update_order(
            order.id,
            &OrderUpdate {
                payment_url: Some(Some(session.redirect_url.clone())),
                payment_token: Some(Some(session.token.clone())),
                gateway_order_id: Some(order.order_number.clone()),
                ..OrderUpdate::default()
            },
        )
        .await?;

    Ok(CheckoutResponse {
        token: session.token,
        redirect_url: session.redirect_url,
        order_id: order.id,
        order_number: order.order_number,
    })
}

fn validate_request(request: &CheckoutRequest) -> AppResult<()> {
    if request.items.is_empty() {
        return Err(AppError::Validation("Cart is empty".to_string()));
    }
    for item in &request.items {
        if item.quantity <= 0 {
            return Err(AppError::Validation(format!(
                "Quantity for product {} must be positive",
                item.product_id
            )));
        }
        if item.size.trim().is_empty() {
            return Err(AppError::Validation(format!(
                "Size is required for product {}",
                item.product_id
            )));
        }
    }

    let data = &request.order_data;
    for (field, value) in [
        ("nama_pembeli", &data.buyer_name),
        ("email_pembeli", &data.buyer_email),
        ("telepon_pembeli", &data.buyer_phone),
        ("shipping_address", &data.shipping_address),
    ] {
        if value.trim().is_empty() {
            return Err(AppError::Validation(format!("{} is required", field)));
        }
    }
    if !data.buyer_email.contains('@') {
        return Err(AppError::Validation("email_pembeli is not a valid email".to_string()));
    }

    Ok(())
}

pub fn shipping_fee(config: &Config, method: ShippingMethod) -> Decimal {
    match method {
        ShippingMethod::Express => config.express_shipping_fee,
        ShippingMethod::Regular => Decimal::ZERO,
    }
}

/// `ORD-YYYYMMDD-XXXXXX`
pub fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Builds the gateway session request for an order. Used by checkout and by
/// payment recovery, which passes a fresh attempt id as `gateway_order_id`.
pub async fn session_request_for(
    store: &dyn Store,
    config: &Config,
    order: &Order,
    lines: &[OrderLine],
    gateway_order_id: &str,
) -> AppResult<SessionRequest> {
    let mut item_details = Vec::with_capacity(lines.len() + 1);
    for line in lines {
        let name = match store.get_product(line.product_id).await? {
            Some(product) => format!("{} ({})", product.name, line.size),
            None => format!("Product ({})", line.size),
        };
        item_details.push(ItemDetail {
            id: format!("{}-{}", line.product_id, line.size),
            price: to_gateway_amount(line.unit_price)?,
            quantity: line.quantity,
            name: name.chars().take(MAX_ITEM_NAME_LEN).collect(),
        });
    }
    if order.shipping_fee > Decimal::ZERO {
        item_details.push(ItemDetail {
            id: SHIPPING_ITEM_ID.to_string(),
            price: to_gateway_amount(order.shipping_fee)?,
            quantity: 1,
            name: format!("Shipping ({})", order.shipping_method.as_str()),
        });
    }

    Ok(SessionRequest {
        transaction_details: TransactionDetails {
            order_id: gateway_order_id.to_string(),
            gross_amount: to_gateway_amount(order.total)?,
        },
        item_details,
        customer_details: CustomerDetails {
            first_name: order.buyer_name.clone(),
            email: order.buyer_email.clone(),
            phone: order.buyer_phone.clone(),
            shipping_address: ShippingAddress {
                first_name: order.buyer_name.clone(),
                phone: order.buyer_phone.clone(),
                address: order.shipping_address.clone(),
            },
        },
        callbacks: Callbacks::for_order(&config.app_base_url, &order.order_number),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CartItem, CheckoutOrderData, OrderStatus, StoreSettings};
    use crate::testing::{test_state, MemoryStore, ScriptedGateway};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn buyer() -> AuthUser {
        AuthUser {
            user_id: Uuid::new_v4(),
            role: None,
        }
    }

    fn request(total: Decimal, method: ShippingMethod, items: Vec<CartItem>) -> CheckoutRequest {
        CheckoutRequest {
            order_data: CheckoutOrderData {
                total,
                buyer_name: "Sari".to_string(),
                buyer_email: "sari@example.com".to_string(),
                buyer_phone: "08123456789".to_string(),
                shipping_address: "Jl. Merdeka 1, Bandung".to_string(),
                shipping_method: method,
            },
            items,
        }
    }

    fn item(product_id: Uuid, size: &str, quantity: i32) -> CartItem {
        CartItem {
            product_id,
            quantity,
            size: size.to_string(),
        }
    }

    #[tokio::test]
    async fn test_checkout_reserves_stock_and_opens_session() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5), ("L", 2)]).await;
        let state = test_state(store.clone(), gateway.clone());

        let response = place_order(
            &state,
            &buyer(),
            request(dec!(300000), ShippingMethod::Regular, vec![item(product_id, "M", 2)]),
        )
        .await
        .unwrap();

        assert_eq!(store.stock(product_id, "M").await, 3);
        assert_eq!(store.product_stock(product_id).await, 5);
        assert_eq!(response.token, "token-1");

        let order = store.find_order(response.order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.total, dec!(300000));
        assert_eq!(order.payment_url.as_deref(), Some(response.redirect_url.as_str()));
        assert_eq!(order.payment_token.as_deref(), Some("token-1"));
        assert!(order.tracking_number.is_none());
        assert!(order.order_number.starts_with("ORD-"));

        let sessions = gateway.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].transaction_details.order_id, order.order_number);
        assert_eq!(sessions[0].transaction_details.gross_amount, 300_000);
        assert!(sessions[0]
            .callbacks
            .finish
            .contains(&format!("order_id={}&", order.order_number)));
    }

    #[tokio::test]
    async fn test_insufficient_stock_persists_nothing() {
        let store = Arc::new(MemoryStore::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 1)]).await;
        let state = test_state(store.clone(), Arc::new(ScriptedGateway::new()));

        let result = place_order(
            &state,
            &buyer(),
            request(dec!(300000), ShippingMethod::Regular, vec![item(product_id, "M", 2)]),
        )
        .await;

        assert!(matches!(result, Err(AppError::InsufficientStock { available: 1, .. })));
        assert_eq!(store.stock(product_id, "M").await, 1);
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_cart_lines_are_checked_together() {
        let store = Arc::new(MemoryStore::new());
        let product_id = store.seed_product("Kemeja", 100_000, &[("M", 2)]).await;
        let state = test_state(store.clone(), Arc::new(ScriptedGateway::new()));

        let result = place_order(
            &state,
            &buyer(),
            request(
                dec!(300000),
                ShippingMethod::Regular,
                vec![item(product_id, "M", 2), item(product_id, "M", 1)],
            ),
        )
        .await;

        assert!(matches!(result, Err(AppError::InsufficientStock { requested: 3, .. })));
        assert_eq!(store.stock(product_id, "M").await, 2);
    }

    #[tokio::test]
    async fn test_tampered_total_is_rejected_before_mutation() {
        let store = Arc::new(MemoryStore::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5)]).await;
        let state = test_state(store.clone(), Arc::new(ScriptedGateway::new()));

        let result = place_order(
            &state,
            &buyer(),
            request(dec!(1000), ShippingMethod::Regular, vec![item(product_id, "M", 2)]),
        )
        .await;

        match result {
            Err(AppError::PriceMismatch { computed, .. }) => assert_eq!(computed, dec!(300000)),
            other => panic!("expected price mismatch, got {:?}", other.map(|r| r.order_number)),
        }
        assert_eq!(store.stock(product_id, "M").await, 5);
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_express_shipping_adds_fee_and_item() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5)]).await;
        let state = test_state(store.clone(), gateway.clone());

        let response = place_order(
            &state,
            &buyer(),
            request(dec!(165000), ShippingMethod::Express, vec![item(product_id, "M", 1)]),
        )
        .await
        .unwrap();

        let order = store.find_order(response.order_id).await.unwrap().unwrap();
        assert_eq!(order.shipping_fee, dec!(15000));
        let session = &gateway.sessions().await[0];
        assert_eq!(session.transaction_details.gross_amount, 165_000);
        let item_sum: i64 = session
            .item_details
            .iter()
            .map(|i| i.price * i.quantity as i64)
            .sum();
        assert_eq!(item_sum, 165_000);
        assert_eq!(session.item_details.last().unwrap().id, SHIPPING_ITEM_ID);
    }

    #[tokio::test]
    async fn test_gateway_failure_leaves_pending_order_without_url() {
        let store = Arc::new(MemoryStore::new());
        let gateway = Arc::new(ScriptedGateway::new());
        gateway.fail_sessions().await;
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5)]).await;
        let state = test_state(store.clone(), gateway);

        let result = place_order(
            &state,
            &buyer(),
            request(dec!(150000), ShippingMethod::Regular, vec![item(product_id, "M", 1)]),
        )
        .await;

        assert!(matches!(result, Err(AppError::UpstreamGateway(_))));
        assert_eq!(store.order_count().await, 1);
        assert_eq!(store.stock(product_id, "M").await, 4);
    }

    #[tokio::test]
    async fn test_maintenance_mode_blocks_checkout() {
        let store = Arc::new(MemoryStore::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5)]).await;
        store
            .set_settings(StoreSettings {
                maintenance_mode: true,
                maintenance_message: None,
            })
            .await;
        let state = test_state(store.clone(), Arc::new(ScriptedGateway::new()));

        let result = place_order(
            &state,
            &buyer(),
            request(dec!(150000), ShippingMethod::Regular, vec![item(product_id, "M", 1)]),
        )
        .await;

        assert!(matches!(result, Err(AppError::Maintenance(_))));
        assert_eq!(store.stock(product_id, "M").await, 5);
    }

    #[tokio::test]
    async fn test_inactive_product_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let product_id = store.seed_product("Kemeja", 150_000, &[("M", 5)]).await;
        store.deactivate(product_id).await;
        let state = test_state(store.clone(), Arc::new(ScriptedGateway::new()));

        let result = place_order(
            &state,
            &buyer(),
            request(dec!(150000), ShippingMethod::Regular, vec![item(product_id, "M", 1)]),
        )
        .await;

        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn test_order_number_format() {
        let number = generate_order_number();
        let parts: Vec<&str> = number.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "ORD");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert!(parts[2].chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
