//! Game-interface port.
//!
//! The minecraft-interface process is an external collaborator; the core
//! only sees this trait. The HTTP adapter normalizes every transport and
//! bot-side failure into [`ActionResponse`] / [`DomainError`].

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::action::{ActionRequest, ActionResponse};
use crate::domain::models::world::{
    BotHealth, BotState, InventoryItem, NearbyBlock, OccupancyGrid, ScanBounds,
};

#[async_trait]
pub trait BotInterface: Send + Sync {
    /// Probe interface liveness.
    async fn health(&self) -> DomainResult<BotHealth>;

    /// Read the bot's vitals and position.
    async fn state(&self) -> DomainResult<BotState>;

    /// Read the aggregated inventory.
    async fn inventory(&self) -> DomainResult<Vec<InventoryItem>>;

    /// Scan named blocks within the given radius of the bot.
    async fn nearby_blocks(&self, radius: u32) -> DomainResult<Vec<NearbyBlock>>;

    /// Scan a world volume into an occupancy grid.
    async fn world_scan(&self, bounds: ScanBounds) -> DomainResult<OccupancyGrid>;

    /// Dispatch an action and block until the interface reports back.
    async fn execute_action(&self, request: ActionRequest) -> DomainResult<ActionResponse>;
}
