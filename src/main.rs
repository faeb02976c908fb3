// =============================================================================
// ORDER PAYMENT SERVICE - Main Entry Point
// =============================================================================
// Checkout and payment reconciliation for the storefront.
//
// WHAT THIS SERVICE DOES:
// - Places orders and reserves their stock at checkout
// - Opens hosted payment sessions with the payment gateway
// - Reconciles gateway notifications against orders, payments and stock
// - Serves the client-side status poller and payment URL recovery
// - Exposes Prometheus metrics for observability
// =============================================================================

// -----------------------------------------------------------------------------
// MODULE DECLARATIONS
// -----------------------------------------------------------------------------
mod auth;        // Bearer token extractor (auth.rs)
mod checkout;    // Checkout orchestrator (checkout.rs)
mod config;      // Configuration loading (config.rs)
mod db;          // PostgreSQL store (db.rs)
mod error;       // Error types (error.rs)
mod gateway;     // Payment gateway client and notifications (gateway.rs)
mod handlers;    // HTTP request handlers (handlers.rs)
mod inventory;   // Stock reservation and release (inventory.rs)
mod metrics;     // Prometheus metrics setup (metrics.rs)
mod models;      // Data structures (models.rs)
mod reconcile;   // Gateway notification reconciler (reconcile.rs)
mod recovery;    // Payment URL recovery (recovery.rs)
mod settings;    // Store settings cache (settings.rs)
mod status;      // Status poller and user cancellation (status.rs)
mod store;       // Persistence trait (store.rs)

#[cfg(test)]
mod testing;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::db::Database;
use crate::gateway::{MidtransClient, PaymentGateway};
use crate::metrics::setup_metrics;
use crate::settings::SettingsCache;
use crate::store::Store;

// -----------------------------------------------------------------------------
// APPLICATION STATE
// -----------------------------------------------------------------------------
// Shared by every handler through State<Arc<AppState>>. The store and the
// gateway sit behind traits so the workflows run against test doubles.
pub struct AppState {
    pub config: Config,

    // PostgreSQL in production
    pub store: Arc<dyn Store>,

    pub gateway: Arc<dyn PaymentGateway>,

    // Maintenance flag cache (process memory, then Redis, then database)
    pub settings: SettingsCache,

    // Only used by the readiness probe and the settings cache
    pub redis: Option<redis::aio::ConnectionManager>,

    // Renders metrics in Prometheus format
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
}

// -----------------------------------------------------------------------------
// ROUTER
// -----------------------------------------------------------------------------
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        // ----- Health & Readiness Endpoints -----
        .route("/health", get(handlers::health_check))
        .route("/ready", get(handlers::readiness_check))

        // ----- Metrics Endpoint -----
        .route("/metrics", get(handlers::metrics_handler))

        // ----- Checkout & Payments -----
        .route("/api/v1/checkout", post(handlers::checkout))
        .route(
            "/api/v1/payments/notification",
            post(handlers::payment_notification),
        )
        .route("/api/v1/payments/status", post(handlers::payment_status))
        .route("/api/v1/payments/recover", post(handlers::recover_payment))

        // ----- Orders -----
        .route("/api/v1/orders/:id", get(handlers::get_order))
        .route("/api/v1/orders/:id/cancel", post(handlers::cancel_order))

        // ----- Store Settings -----
        .route("/api/v1/settings", get(handlers::get_settings))
        .route("/api/v1/settings/refresh", post(handlers::refresh_settings))

        // ----- Middleware Layers -----
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// -----------------------------------------------------------------------------
// MAIN FUNCTION
// -----------------------------------------------------------------------------
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------------------------
    // STEP 1: Load environment variables
    // -------------------------------------------------------------------------
    dotenvy::dotenv().ok();

    // -------------------------------------------------------------------------
    // STEP 2: Initialize logging/tracing
    // -------------------------------------------------------------------------
    // RUST_LOG controls log levels, e.g. RUST_LOG=info,order_payment_service=debug
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,order_payment_service=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting Order Payment Service...");

    // -------------------------------------------------------------------------
    // STEP 3: Load configuration
    // -------------------------------------------------------------------------
    let config = Config::from_env()?;
    info!(port = config.port, "Configuration loaded");

    // -------------------------------------------------------------------------
    // STEP 4: Set up Prometheus metrics
    // -------------------------------------------------------------------------
    let metrics_handle = setup_metrics()?;
    info!("Prometheus metrics initialized");

    // -------------------------------------------------------------------------
    // STEP 5: Connect to PostgreSQL database
    // -------------------------------------------------------------------------
    let db = Database::connect(&config.database_url).await?;
    info!("Connected to PostgreSQL");

    db.run_migrations().await?;
    info!("Database migrations completed");

    // -------------------------------------------------------------------------
    // STEP 6: Connect to Redis (optional)
    // -------------------------------------------------------------------------
    // Without Redis the settings cache stays in process memory
    let redis = match &config.redis_url {
        Some(url) => {
            let client = redis::Client::open(url.as_str())?;
            let conn = redis::aio::ConnectionManager::new(client).await?;
            info!("Connected to Redis");
            Some(conn)
        }
        None => {
            warn!("REDIS_URL not set, settings cache is process-local");
            None
        }
    };

    // -------------------------------------------------------------------------
    // STEP 7: Payment gateway client
    // -------------------------------------------------------------------------
    let gateway = MidtransClient::new(config.gateway.clone())?;
    info!(snap_url = %config.gateway.snap_url, "Payment gateway client ready");

    // -------------------------------------------------------------------------
    // STEP 8: Create application state
    // -------------------------------------------------------------------------
    let port = config.port;
    let state = Arc::new(AppState {
        settings: SettingsCache::new(config.settings_ttl, redis.clone()),
        config,
        store: Arc::new(db),
        gateway: Arc::new(gateway),
        redis,
        metrics_handle,
    });

    // -------------------------------------------------------------------------
    // STEP 9: Start the HTTP server
    // -------------------------------------------------------------------------
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Order Payment Service is listening");

    axum::serve(listener, app(state)).await?;

    Ok(())
}
