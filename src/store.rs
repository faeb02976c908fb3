// =============================================================================
// STORE MODULE
// =============================================================================
// Persistence seam for the checkout and reconciliation workflows.
//
// The PostgreSQL implementation lives in db.rs. Orchestration code only ever
// talks to `dyn Store`.
// =============================================================================

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::AppResult;
use crate::models::{
    NewOrder, NewOrderLine, Order, OrderLine, OrderUpdate, PaymentRecord, PaymentUpsert, Product,
    StoreSettings,
};

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap connectivity probe for the readiness endpoint.
    async fn health_check(&self) -> bool;

    // -------------------------------------------------------------------------
    // CATALOG & INVENTORY LEDGER
    // -------------------------------------------------------------------------
    async fn get_product(&self, product_id: Uuid) -> AppResult<Option<Product>>;

    /// Current stock of one (product, size) row, `None` if the row does not exist.
    async fn get_size_stock(&self, product_id: Uuid, size: &str) -> AppResult<Option<i32>>;

    /// Rewrites the product's aggregate stock as the sum over its sizes.
    async fn recompute_product_stock(&self, product_id: Uuid) -> AppResult<i32>;

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------
    /// Creates the order and its lines and reserves stock for every line as
    /// one unit. Each reservation is a conditional decrement; if any line
    /// cannot be reserved nothing is persisted and `InsufficientStock` is
    /// returned.
    async fn create_order_with_reservation(
        &self,
        order: &NewOrder,
        lines: &[NewOrderLine],
    ) -> AppResult<Order>;

    async fn find_order(&self, order_id: Uuid) -> AppResult<Option<Order>>;

    /// Looks an order up by order number or by the gateway id of its active
    /// payment attempt. An id of an older attempt resolves through its order
    /// number prefix.
    async fn find_order_by_number(&self, reference: &str) -> AppResult<Option<Order>>;

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>>;

    async fn update_order(&self, order_id: Uuid, update: &OrderUpdate) -> AppResult<Order>;

    /// Returns every line of the order to its size row and sets the release
    /// marker, all or nothing. Returns `true` only for the single caller that
    /// flips the marker, so stock is restored at most once. On error neither
    /// the marker nor any line is written and the release can be retried.
    async fn release_reservation(&self, order_id: Uuid) -> AppResult<bool>;

    // -------------------------------------------------------------------------
    // PAYMENT RECORDS
    // -------------------------------------------------------------------------
    async fn find_payment(&self, order_id: Uuid) -> AppResult<Option<PaymentRecord>>;

    /// Inserts or overwrites the single payment record of an order.
    async fn upsert_payment(&self, payment: &PaymentUpsert) -> AppResult<PaymentRecord>;

    /// Moves a `pending` payment record to `cancelled`. Returns whether one was found.
    async fn cancel_pending_payment(&self, order_id: Uuid) -> AppResult<bool>;

    // -------------------------------------------------------------------------
    // SETTINGS
    // -------------------------------------------------------------------------
    async fn load_settings(&self) -> AppResult<StoreSettings>;
}
