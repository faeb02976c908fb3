// =============================================================================
// CONFIGURATION MODULE
// =============================================================================
// Loads configuration from environment variables into a typed Config.
// Missing or malformed values fail at startup, not on the first request.
// =============================================================================

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use std::env;
use std::time::Duration;

const DEFAULT_SNAP_URL: &str = "https://app.sandbox.midtrans.com";
const DEFAULT_GATEWAY_API_URL: &str = "https://api.sandbox.midtrans.com";

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server port (default: 8003)
    pub port: u16,

    /// PostgreSQL connection URL
    pub database_url: String,

    /// Redis connection URL. Without it the settings cache is process-local.
    pub redis_url: Option<String>,

    /// HS256 secret used to verify bearer tokens issued by the identity provider
    pub jwt_secret: String,

    /// Payment gateway credentials and endpoints
    pub gateway: GatewayConfig,

    /// Public base URL of the storefront; gateway callback URLs hang off it
    pub app_base_url: String,

    /// Flat surcharge for express shipping
    pub express_shipping_fee: Decimal,

    /// Largest difference tolerated between two amounts that should match
    /// (client total vs. server total, notification amount vs. order total)
    pub amount_tolerance: Decimal,

    /// How long store settings are served from cache
    pub settings_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Server key; used for basic auth and notification signatures
    pub server_key: String,

    /// Base URL of the hosted checkout (session) API
    pub snap_url: String,

    /// Base URL of the transaction status API
    pub api_url: String,

    /// Timeout applied to every gateway HTTP call
    pub timeout: Duration,
}

impl Config {
    /// Creates a Config by reading environment variables.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            port: env::var("PORT")
                .unwrap_or_else(|_| "8003".to_string())
                .parse()
                .context("Failed to parse PORT as a number")?,

            database_url: env::var("DATABASE_URL")
                .context("DATABASE_URL environment variable is required")?,

            redis_url: env::var("REDIS_URL").ok().filter(|url| !url.is_empty()),

            jwt_secret: env::var("JWT_SECRET")
                .context("JWT_SECRET environment variable is required")?,

            gateway: GatewayConfig {
                server_key: env::var("GATEWAY_SERVER_KEY")
                    .context("GATEWAY_SERVER_KEY environment variable is required")?,
                snap_url: env::var("GATEWAY_SNAP_URL")
                    .unwrap_or_else(|_| DEFAULT_SNAP_URL.to_string()),
                api_url: env::var("GATEWAY_API_URL")
                    .unwrap_or_else(|_| DEFAULT_GATEWAY_API_URL.to_string()),
                timeout: Duration::from_secs(
                    env::var("GATEWAY_TIMEOUT_SECS")
                        .unwrap_or_else(|_| "15".to_string())
                        .parse()
                        .context("Failed to parse GATEWAY_TIMEOUT_SECS as a number")?,
                ),
            },

            app_base_url: env::var("APP_BASE_URL")
                .context("APP_BASE_URL environment variable is required")?
                .trim_end_matches('/')
                .to_string(),

            express_shipping_fee: env::var("EXPRESS_SHIPPING_FEE")
                .unwrap_or_else(|_| "15000".to_string())
                .parse()
                .context("Failed to parse EXPRESS_SHIPPING_FEE as a decimal")?,

            amount_tolerance: env::var("AMOUNT_TOLERANCE")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .context("Failed to parse AMOUNT_TOLERANCE as a decimal")?,

            settings_ttl: Duration::from_secs(
                env::var("SETTINGS_CACHE_TTL_SECS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .context("Failed to parse SETTINGS_CACHE_TTL_SECS as a number")?,
            ),
        })
    }
}
