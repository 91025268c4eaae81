//! HTTP client for the minecraft-interface process.
//!
//! Normalizes transport errors and bot-side failure shapes into the
//! domain's [`ActionResponse`]. The `/action` endpoint blocks until the
//! interface reports the action outcome.

use async_trait::async_trait;
use base64::prelude::{Engine, BASE64_STANDARD};
use serde::Deserialize;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::action::{ActionOutcome, ActionRequest, ActionResponse, FailureCode};
use crate::domain::models::world::{
    BotHealth, BotState, InventoryItem, NearbyBlock, OccupancyGrid, ScanBounds,
};
use crate::domain::ports::BotInterface;

/// Default timeout for blocking action dispatch.
const ACTION_TIMEOUT: Duration = Duration::from_secs(60);
/// Timeout for read endpoints.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw `/action` wire response before normalization.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireActionResponse {
    #[serde(default)]
    ok: bool,
    #[serde(default)]
    outcome: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    failure_code: Option<String>,
}

/// Raw `/world-scan` response.
#[derive(Debug, Deserialize)]
struct WireScanResponse {
    dims: (u32, u32, u32),
    /// Base64-encoded occupancy bytes
    grid: String,
}

pub struct HttpBotClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBotClient {
    pub fn new(base_url: impl Into<String>) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(ACTION_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn normalize(wire: WireActionResponse) -> ActionResponse {
        let outcome = match wire.outcome.as_deref() {
            Some("shadow") => ActionOutcome::Shadow,
            Some("error") => ActionOutcome::Error,
            _ => ActionOutcome::Executed,
        };
        ActionResponse {
            ok: wire.ok,
            outcome,
            data: wire.data,
            error: wire.error,
            failure_code: wire.failure_code.map(FailureCode::new),
            shadow_blocked: outcome == ActionOutcome::Shadow,
        }
    }
}

#[async_trait]
impl BotInterface for HttpBotClient {
    async fn health(&self) -> DomainResult<BotHealth> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(READ_TIMEOUT)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DomainError::BotInterface(format!(
                "health returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn state(&self) -> DomainResult<BotState> {
        let response = self
            .client
            .get(self.url("/state"))
            .timeout(READ_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(response.json().await?)
    }

    async fn inventory(&self) -> DomainResult<Vec<InventoryItem>> {
        let response = self
            .client
            .get(self.url("/inventory"))
            .timeout(READ_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(response.json().await?)
    }

    async fn nearby_blocks(&self, radius: u32) -> DomainResult<Vec<NearbyBlock>> {
        let response = self
            .client
            .get(self.url("/nearby-blocks"))
            .query(&[("radius", radius)])
            .timeout(READ_TIMEOUT)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(response.json().await?)
    }

    async fn world_scan(&self, bounds: ScanBounds) -> DomainResult<OccupancyGrid> {
        let response = self
            .client
            .get(self.url("/world-scan"))
            .query(&[
                ("x1", bounds.x1),
                ("y1", bounds.y1),
                ("z1", bounds.z1),
                ("x2", bounds.x2),
                ("y2", bounds.y2),
                ("z2", bounds.z2),
            ])
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        let wire: WireScanResponse = response.json().await?;
        let cells = BASE64_STANDARD
            .decode(&wire.grid)
            .map_err(|e| DomainError::BotInterface(format!("invalid occupancy grid: {e}")))?;
        Ok(OccupancyGrid {
            dims: wire.dims,
            cells,
        })
    }

    async fn execute_action(&self, request: ActionRequest) -> DomainResult<ActionResponse> {
        let timeout = request
            .timeout
            .map_or(ACTION_TIMEOUT, Duration::from_millis);
        let response = self
            .client
            .post(self.url("/action"))
            .timeout(timeout)
            .json(&request)
            .send()
            .await?;

        // 5xx is an infra failure, not a leaf result.
        if response.status().is_server_error() {
            return Ok(ActionResponse::infra_error(format!(
                "bot interface returned {}",
                response.status()
            )));
        }
        let wire: WireActionResponse = response.json().await?;
        Ok(Self::normalize(wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_action_normalization() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/action")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "ok": false,
                    "outcome": "executed",
                    "error": "contract violated",
                    "failureCode": "CONTRACT_VIOLATION",
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = HttpBotClient::new(server.url()).unwrap();
        let response = client
            .execute_action(ActionRequest::new("craft_recipe", json!({})))
            .await
            .unwrap();

        mock.assert_async().await;
        assert!(!response.ok);
        assert!(!response.is_infra_failure());
        assert!(response.failure_code.unwrap().is_deterministic());
    }

    #[tokio::test]
    async fn test_shadow_outcome_sets_blocked_flag() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/action")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!({"ok": true, "outcome": "shadow"}).to_string())
            .create_async()
            .await;

        let client = HttpBotClient::new(server.url()).unwrap();
        let response = client
            .execute_action(ActionRequest::new("move_to", json!({})))
            .await
            .unwrap();
        assert!(response.shadow_blocked);
        assert_eq!(response.outcome, ActionOutcome::Shadow);
    }

    #[tokio::test]
    async fn test_server_error_is_infra_failure() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/action")
            .with_status(503)
            .create_async()
            .await;

        let client = HttpBotClient::new(server.url()).unwrap();
        let response = client
            .execute_action(ActionRequest::new("move_to", json!({})))
            .await
            .unwrap();
        assert!(response.is_infra_failure());
    }

    #[tokio::test]
    async fn test_inventory_fetch() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/inventory")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(json!([{"name": "oak_log", "count": 5}]).to_string())
            .create_async()
            .await;

        let client = HttpBotClient::new(server.url()).unwrap();
        let inventory = client.inventory().await.unwrap();
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory[0].name, "oak_log");
    }
}
