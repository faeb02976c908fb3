// =============================================================================
// DATABASE MODULE
// =============================================================================
// PostgreSQL implementation of the Store trait.
//
// - Order creation, line insert and stock reservation share one transaction.
// - Reservations are conditional decrements (`WHERE stock >= $1`), so two
//   concurrent checkouts can never drive a size row below zero.
// - A release claims the order's release marker and restores its lines in
//   one transaction, so it happens exactly once or not at all.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{
    NewOrder, NewOrderLine, Order, OrderLine, OrderUpdate, PaymentRecord, PaymentUpsert, Product,
    StoreSettings,
};
use crate::recovery::attempt_base;
use crate::store::Store;

const ORDER_COLUMNS: &str = "id, order_number, gateway_order_id, user_id, total, shipping_fee, \
     status, payment_method, payment_url, payment_token, tracking_number, shipping_method, \
     shipping_address, buyer_name, buyer_email, buyer_phone, stock_released_at, \
     created_at, updated_at";

const PAYMENT_COLUMNS: &str =
    "id, order_id, amount, status, payment_proof, created_at, updated_at";

const SETTINGS_KEY: &str = "store";

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    // -------------------------------------------------------------------------
    // CONNECTION
    // -------------------------------------------------------------------------
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .min_connections(2)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .idle_timeout(std::time::Duration::from_secs(300))
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        Ok(Self { pool })
    }

    // -------------------------------------------------------------------------
    // MIGRATIONS
    // -------------------------------------------------------------------------
    /// Creates the tables if they don't exist and seeds a small catalog on
    /// an empty database.
    pub async fn run_migrations(&self) -> Result<()> {
        let statements = [
            (
                "products",
                r#"
                CREATE TABLE IF NOT EXISTS products (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    name VARCHAR(255) NOT NULL,
                    price NUMERIC(14, 2) NOT NULL CHECK (price >= 0),
                    category VARCHAR(100),
                    is_active BOOLEAN NOT NULL DEFAULT TRUE,
                    -- Display cache: sum of product_sizes.stock
                    stock INTEGER NOT NULL DEFAULT 0,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "product_sizes",
                r#"
                CREATE TABLE IF NOT EXISTS product_sizes (
                    product_id UUID NOT NULL REFERENCES products(id) ON DELETE CASCADE,
                    size VARCHAR(20) NOT NULL,
                    stock INTEGER NOT NULL DEFAULT 0,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    PRIMARY KEY (product_id, size),
                    CONSTRAINT non_negative_stock CHECK (stock >= 0)
                )
                "#,
            ),
            (
                "orders",
                r#"
                CREATE TABLE IF NOT EXISTS orders (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    order_number VARCHAR(50) UNIQUE NOT NULL,
                    gateway_order_id VARCHAR(50) UNIQUE,
                    user_id UUID NOT NULL,
                    total NUMERIC(14, 2) NOT NULL,
                    shipping_fee NUMERIC(14, 2) NOT NULL DEFAULT 0,
                    status VARCHAR(20) NOT NULL DEFAULT 'pending',
                    payment_method VARCHAR(100),
                    payment_url TEXT,
                    payment_token VARCHAR(255),
                    tracking_number VARCHAR(100),
                    shipping_method VARCHAR(20) NOT NULL,
                    shipping_address TEXT NOT NULL,
                    buyer_name VARCHAR(255) NOT NULL,
                    buyer_email VARCHAR(255) NOT NULL,
                    buyer_phone VARCHAR(50) NOT NULL,
                    stock_released_at TIMESTAMPTZ,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "order_items",
                r#"
                CREATE TABLE IF NOT EXISTS order_items (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    order_id UUID NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    product_id UUID NOT NULL REFERENCES products(id),
                    size VARCHAR(20) NOT NULL,
                    quantity INTEGER NOT NULL CHECK (quantity > 0),
                    unit_price NUMERIC(14, 2) NOT NULL
                )
                "#,
            ),
            (
                "payments",
                r#"
                CREATE TABLE IF NOT EXISTS payments (
                    id UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                    order_id UUID UNIQUE NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                    amount NUMERIC(14, 2) NOT NULL,
                    status VARCHAR(20) NOT NULL,
                    payment_proof JSONB NOT NULL DEFAULT '{}'::jsonb,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "store_settings",
                r#"
                CREATE TABLE IF NOT EXISTS store_settings (
                    key VARCHAR(50) PRIMARY KEY,
                    value JSONB NOT NULL,
                    updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                )
                "#,
            ),
            (
                "idx_orders_user",
                "CREATE INDEX IF NOT EXISTS idx_orders_user ON orders(user_id)",
            ),
            (
                "idx_order_items_order",
                "CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id)",
            ),
        ];

        for (name, sql) in statements {
            sqlx::query(sql)
                .execute(&self.pool)
                .await
                .with_context(|| format!("Failed to create {}", name))?;
        }

        self.seed_sample_catalog().await?;

        Ok(())
    }

    /// Seed a few products with sized stock for local development
    async fn seed_sample_catalog(&self) -> Result<()> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM products")
            .fetch_one(&self.pool)
            .await?;

        if count.0 > 0 {
            return Ok(());
        }

        let sample_products = [
            ("Kemeja Flanel", "150000", "shirts", [("S", 5), ("M", 8), ("L", 6)]),
            ("Hoodie Basic", "225000", "outerwear", [("M", 4), ("L", 4), ("XL", 2)]),
            ("Kaos Polos", "75000", "shirts", [("S", 20), ("M", 25), ("L", 20)]),
        ];

        for (name, price, category, sizes) in sample_products {
            let (product_id,): (Uuid,) = sqlx::query_as(
                r#"
                INSERT INTO products (name, price, category)
                VALUES ($1, $2::numeric, $3)
                RETURNING id
                "#,
            )
            .bind(name)
            .bind(price)
            .bind(category)
            .fetch_one(&self.pool)
            .await?;

            for (size, stock) in sizes {
                sqlx::query(
                    "INSERT INTO product_sizes (product_id, size, stock) VALUES ($1, $2, $3)",
                )
                .bind(product_id)
                .bind(size)
                .bind(stock)
                .execute(&self.pool)
                .await?;
            }

            self.recompute_product_stock(product_id).await?;
        }

        Ok(())
    }
}

#[async_trait]
impl Store for Database {
    async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    // -------------------------------------------------------------------------
    // CATALOG & INVENTORY LEDGER
    // -------------------------------------------------------------------------

    async fn get_product(&self, product_id: Uuid) -> AppResult<Option<Product>> {
        let product = sqlx::query_as::<_, Product>(
            r#"
            SELECT id, name, price, category, is_active, stock
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(product_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(product)
    }

    async fn get_size_stock(&self, product_id: Uuid, size: &str) -> AppResult<Option<i32>> {
        let row: Option<(i32,)> =
            sqlx::query_as("SELECT stock FROM product_sizes WHERE product_id = $1 AND size = $2")
                .bind(product_id)
                .bind(size)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(stock,)| stock))
    }

    async fn recompute_product_stock(&self, product_id: Uuid) -> AppResult<i32> {
        let (stock,): (i32,) = sqlx::query_as(
            r#"
            UPDATE products
            SET stock = COALESCE(
                    (SELECT SUM(stock) FROM product_sizes WHERE product_id = $1), 0
                )::integer,
                updated_at = NOW()
            WHERE id = $1
            RETURNING stock
            "#,
        )
        .bind(product_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(stock)
    }

    // -------------------------------------------------------------------------
    // ORDERS
    // -------------------------------------------------------------------------

    async fn create_order_with_reservation(
        &self,
        order: &NewOrder,
        lines: &[NewOrderLine],
    ) -> AppResult<Order> {
        let mut tx = self.pool.begin().await?;

        let created = sqlx::query_as::<_, Order>(&format!(
            r#"
            INSERT INTO orders (order_number, gateway_order_id, user_id, total, shipping_fee,
                                status, shipping_method, shipping_address,
                                buyer_name, buyer_email, buyer_phone)
            VALUES ($1, $1, $2, $3, $4, 'pending', $5, $6, $7, $8, $9)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(&order.order_number)
        .bind(order.user_id)
        .bind(order.total)
        .bind(order.shipping_fee)
        .bind(order.shipping_method)
        .bind(&order.shipping_address)
        .bind(&order.buyer_name)
        .bind(&order.buyer_email)
        .bind(&order.buyer_phone)
        .fetch_one(&mut *tx)
        .await?;

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO order_items (order_id, product_id, size, quantity, unit_price)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(created.id)
            .bind(line.product_id)
            .bind(&line.size)
            .bind(line.quantity)
            .bind(line.unit_price)
            .execute(&mut *tx)
            .await?;
        }

        for line in lines {
            let reserved = sqlx::query(
                r#"
                UPDATE product_sizes
                SET stock = stock - $1, updated_at = NOW()
                WHERE product_id = $2 AND size = $3 AND stock >= $1
                "#,
            )
            .bind(line.quantity)
            .bind(line.product_id)
            .bind(&line.size)
            .execute(&mut *tx)
            .await?;

            if reserved.rows_affected() == 0 {
                let available: Option<(i32,)> = sqlx::query_as(
                    "SELECT stock FROM product_sizes WHERE product_id = $1 AND size = $2",
                )
                .bind(line.product_id)
                .bind(&line.size)
                .fetch_optional(&mut *tx)
                .await?;

                tx.rollback().await?;

                return Err(AppError::InsufficientStock {
                    product_id: line.product_id,
                    size: line.size.clone(),
                    available: available.map(|(stock,)| stock).unwrap_or(0),
                    requested: line.quantity,
                });
            }
        }

        tx.commit().await?;

        Ok(created)
    }

    async fn find_order(&self, order_id: Uuid) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn find_order_by_number(&self, reference: &str) -> AppResult<Option<Order>> {
        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            SELECT {ORDER_COLUMNS}
            FROM orders
            WHERE order_number = $1 OR gateway_order_id = $1 OR order_number = $2
            LIMIT 1
            "#
        ))
        .bind(reference)
        .bind(attempt_base(reference))
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }

    async fn order_lines(&self, order_id: Uuid) -> AppResult<Vec<OrderLine>> {
        let lines = sqlx::query_as::<_, OrderLine>(
            r#"
            SELECT id, order_id, product_id, size, quantity, unit_price
            FROM order_items
            WHERE order_id = $1
            ORDER BY product_id, size
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(lines)
    }

    async fn update_order(&self, order_id: Uuid, update: &OrderUpdate) -> AppResult<Order> {
        let order = sqlx::query_as::<_, Order>(&format!(
            r#"
            UPDATE orders
            SET status = COALESCE($2::text, status),
                payment_method = COALESCE($3::text, payment_method),
                payment_url = CASE WHEN $4::boolean THEN $5::text ELSE payment_url END,
                payment_token = CASE WHEN $6::boolean THEN $7::text ELSE payment_token END,
                gateway_order_id = COALESCE($8::text, gateway_order_id),
                updated_at = NOW()
            WHERE id = $1 AND ($9::text IS NULL OR status = $9::text)
            RETURNING {ORDER_COLUMNS}
            "#
        ))
        .bind(order_id)
        .bind(update.status)
        .bind(update.payment_method.as_deref())
        .bind(update.payment_url.is_some())
        .bind(update.payment_url.clone().flatten())
        .bind(update.payment_token.is_some())
        .bind(update.payment_token.clone().flatten())
        .bind(update.gateway_order_id.as_deref())
        .bind(update.expected_status)
        .fetch_optional(&self.pool)
        .await?;

        match order {
            Some(order) => Ok(order),
            None => match self.find_order(order_id).await? {
                Some(current) => Err(AppError::Conflict(format!(
                    "Order {} is {}, expected {}",
                    current.order_number,
                    current.status,
                    update
                        .expected_status
                        .map(|s| s.as_str())
                        .unwrap_or("unchanged")
                ))),
                None => Err(AppError::NotFound(format!("Order not found: {}", order_id))),
            },
        }
    }

    async fn release_reservation(&self, order_id: Uuid) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;

        let claimed = sqlx::query(
            r#"
            UPDATE orders
            SET stock_released_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND stock_released_at IS NULL
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        if claimed.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        // Lines for the same size are summed so each row is updated once
        sqlx::query(
            r#"
            UPDATE product_sizes ps
            SET stock = GREATEST(ps.stock + released.quantity, 0), updated_at = NOW()
            FROM (
                SELECT product_id, size, SUM(quantity)::integer AS quantity
                FROM order_items
                WHERE order_id = $1
                GROUP BY product_id, size
            ) AS released
            WHERE ps.product_id = released.product_id AND ps.size = released.size
            "#,
        )
        .bind(order_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(true)
    }

    // -------------------------------------------------------------------------
    // PAYMENT RECORDS
    // -------------------------------------------------------------------------

    async fn find_payment(&self, order_id: Uuid) -> AppResult<Option<PaymentRecord>> {
        let payment = sqlx::query_as::<_, PaymentRecord>(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1"
        ))
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    async fn upsert_payment(&self, payment: &PaymentUpsert) -> AppResult<PaymentRecord> {
        let record = sqlx::query_as::<_, PaymentRecord>(&format!(
            r#"
            INSERT INTO payments (order_id, amount, status, payment_proof)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (order_id) DO UPDATE
            SET amount = EXCLUDED.amount,
                status = EXCLUDED.status,
                payment_proof = EXCLUDED.payment_proof,
                updated_at = NOW()
            RETURNING {PAYMENT_COLUMNS}
            "#
        ))
        .bind(payment.order_id)
        .bind(payment.amount)
        .bind(payment.status)
        .bind(&payment.payment_proof)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn cancel_pending_payment(&self, order_id: Uuid) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'cancelled', updated_at = NOW()
            WHERE order_id = $1 AND status = 'pending'
            "#,
        )
        .bind(order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // -------------------------------------------------------------------------
    // SETTINGS
    // -------------------------------------------------------------------------

    async fn load_settings(&self) -> AppResult<StoreSettings> {
        let row: Option<(serde_json::Value,)> =
            sqlx::query_as("SELECT value FROM store_settings WHERE key = $1")
                .bind(SETTINGS_KEY)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((value,)) => serde_json::from_value(value)
                .map_err(|e| AppError::Internal(format!("Malformed store settings: {}", e))),
            None => Ok(StoreSettings::default()),
        }
    }
}
