// =============================================================================
// INVENTORY MODULE
// =============================================================================
// Inventory ledger operations built on the Store primitives.
//
// Stock is reserved when an order is placed and only comes back when the order
// ends up cancelled or failed. Settlement never touches stock.
// =============================================================================

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{CartItem, Order, OrderLine};
use crate::store::Store;

/// Sums quantities per (product, size) so a cart listing the same size twice
/// is checked against stock as one request.
pub fn merge_cart(items: &[CartItem]) -> BTreeMap<(Uuid, String), i32> {
    let mut merged = BTreeMap::new();
    for item in items {
        *merged
            .entry((item.product_id, item.size.trim().to_string()))
            .or_insert(0) += item.quantity;
    }
    merged
}

/// Fails with `InsufficientStock` on the first (product, size) whose
/// requested quantity exceeds what is on hand. Read-only.
pub async fn check_availability(
    store: &dyn Store,
    requested: &BTreeMap<(Uuid, String), i32>,
) -> AppResult<()> {
    for ((product_id, size), quantity) in requested {
        let available = store.get_size_stock(*product_id, size).await?.unwrap_or(0);
        if *quantity > available {
            return Err(AppError::InsufficientStock {
                product_id: *product_id,
                size: size.clone(),
                available,
                requested: *quantity,
            });
        }
    }
    Ok(())
}

/// Rewrites the display stock of each product. Failures are logged and
/// swallowed: the aggregate is a cache, not a source of truth.
pub async fn refresh_aggregates(store: &dyn Store, product_ids: impl IntoIterator<Item = Uuid>) {
    let unique: BTreeSet<Uuid> = product_ids.into_iter().collect();
    for product_id in unique {
        if let Err(e) = store.recompute_product_stock(product_id).await {
            tracing::warn!(%product_id, error = %e, "Failed to recompute aggregate stock");
        }
    }
}

/// Returns an order's reserved stock to the shelf.
///
/// Runs at most once per order: the first caller claims the release marker
/// and restores every line in the same store transaction; later callers get
/// `false` and change nothing. A failed release leaves the marker unset, so
/// a retried notification restores the stock.
pub async fn release_order_stock(
    store: &dyn Store,
    order: &Order,
    lines: &[OrderLine],
) -> AppResult<bool> {
    if !store.release_reservation(order.id).await? {
        tracing::info!(
            order_number = %order.order_number,
            "Stock already released for order"
        );
        return Ok(false);
    }

    for line in lines {
        metrics::record_stock_mutation("release", line.quantity);
        tracing::info!(
            order_number = %order.order_number,
            product_id = %line.product_id,
            size = %line.size,
            quantity = line.quantity,
            "Released reserved stock"
        );
    }

    refresh_aggregates(store, lines.iter().map(|line| line.product_id)).await;

    Ok(true)
}
