//! TTL-cached inventory reads using a moka cache.
//!
//! The executor consults the inventory several times per cycle
//! (progress, craft pre-checks, completion gates). A short-lived cache
//! keeps that to one bot round-trip; anything older than the TTL falls
//! back to HTTP. Actions that change the inventory invalidate.

use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::domain::errors::DomainResult;
use crate::domain::models::world::InventoryItem;
use crate::domain::ports::BotInterface;

/// Default TTL for the cached inventory snapshot.
const INVENTORY_CACHE_TTL_SECS: u64 = 5;

/// There is one bot, so one logical cache entry.
const INVENTORY_KEY: u8 = 0;

/// Cached inventory decorator over the bot interface.
pub struct CachedInventory {
    bot: Arc<dyn BotInterface>,
    inventory: Cache<u8, Arc<Vec<InventoryItem>>>,
}

impl CachedInventory {
    /// Create with the default TTL.
    pub fn new(bot: Arc<dyn BotInterface>) -> Self {
        Self::with_ttl(bot, Duration::from_secs(INVENTORY_CACHE_TTL_SECS))
    }

    /// Create with a custom TTL.
    pub fn with_ttl(bot: Arc<dyn BotInterface>, ttl: Duration) -> Self {
        let inventory = Cache::builder()
            .max_capacity(1)
            .time_to_live(ttl)
            .build();
        Self { bot, inventory }
    }

    /// Read the inventory, serving from cache within the TTL.
    pub async fn read(&self) -> DomainResult<Vec<InventoryItem>> {
        if let Some(cached) = self.inventory.get(&INVENTORY_KEY).await {
            return Ok((*cached).clone());
        }

        // Cache miss - fetch from the bot and populate.
        let fresh = self.bot.inventory().await?;
        self.inventory
            .insert(INVENTORY_KEY, Arc::new(fresh.clone()))
            .await;
        Ok(fresh)
    }

    /// Drop the cached snapshot (after actions that change inventory).
    pub async fn invalidate(&self) {
        self.inventory.invalidate(&INVENTORY_KEY).await;
    }
}
