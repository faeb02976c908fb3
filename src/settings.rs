// =============================================================================
// SETTINGS MODULE
// =============================================================================
// Short-lived cache of the store settings (maintenance mode).
//
// Reads go process memory, then Redis, then the database. `invalidate` drops
// both cache tiers so the next read hits the database.
// =============================================================================

use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use crate::error::AppResult;
use crate::models::StoreSettings;
use crate::store::Store;

const REDIS_KEY: &str = "settings:store";

struct Cached {
    settings: StoreSettings,
    loaded_at: Instant,
}

pub struct SettingsCache {
    ttl: Duration,
    local: RwLock<Option<Cached>>,
    redis: Option<redis::aio::ConnectionManager>,
}

impl SettingsCache {
    pub fn new(ttl: Duration, redis: Option<redis::aio::ConnectionManager>) -> Self {
        Self {
            ttl,
            local: RwLock::new(None),
            redis,
        }
    }

    pub async fn get(&self, store: &dyn Store) -> AppResult<StoreSettings> {
        if let Some(cached) = self.local.read().await.as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.settings.clone());
            }
        }

        let settings = match self.read_redis().await {
            Some(settings) => settings,
            None => {
                let settings = store.load_settings().await?;
                self.write_redis(&settings).await;
                settings
            }
        };

        *self.local.write().await = Some(Cached {
            settings: settings.clone(),
            loaded_at: Instant::now(),
        });

        Ok(settings)
    }

    pub async fn invalidate(&self) {
        *self.local.write().await = None;

        if let Some(redis) = &self.redis {
            let result: Result<(), _> = redis::cmd("DEL")
                .arg(REDIS_KEY)
                .query_async(&mut redis.clone())
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "Failed to drop cached settings from Redis");
            }
        }

        tracing::info!("Store settings cache invalidated");
    }

    // Redis failures degrade to a database read; they never fail the request.
    async fn read_redis(&self) -> Option<StoreSettings> {
        let redis = self.redis.as_ref()?;
        let cached: Option<String> = redis::cmd("GET")
            .arg(REDIS_KEY)
            .query_async(&mut redis.clone())
            .await
            .ok()?;
        serde_json::from_str(&cached?).ok()
    }

    async fn write_redis(&self, settings: &StoreSettings) {
        let Some(redis) = &self.redis else {
            return;
        };
        let Ok(json) = serde_json::to_string(settings) else {
            return;
        };
        let result: Result<(), _> = redis::cmd("SETEX")
            .arg(REDIS_KEY)
            .arg(self.ttl.as_secs().max(1))
            .arg(json)
            .query_async(&mut redis.clone())
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Failed to cache settings in Redis");
        }
    }
}
