//! Fire-and-forget dashboard task-update sink.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{DashboardSink, TaskUpdate};

pub struct HttpDashboardSink {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDashboardSink {
    pub fn new(base_url: impl Into<String>) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            // Short timeout: the dashboard must never slow the executor.
            .timeout(Duration::from_secs(2))
            .build()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl DashboardSink for HttpDashboardSink {
    async fn task_update(&self, update: &TaskUpdate) -> DomainResult<()> {
        self.client
            .post(format!("{}/api/task-updates", self.base_url))
            .json(update)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(())
    }
}
