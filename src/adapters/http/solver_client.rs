//! HTTP client for the Sterling solver service.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::solver::{
    EpisodeAck, EpisodeReport, NavigationRequest, PlanRequest, PlanResponse, RecipeInfo,
    SterlingSolver,
};

const SOLVE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpSolverClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSolverClient {
    pub fn new(base_url: impl Into<String>) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(SOLVE_TIMEOUT)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| DomainError::Solver(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn post_json<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> DomainResult<Resp> {
        let response = self
            .client
            .post(self.url(path))
            .json(request)
            .send()
            .await
            .map_err(|e| DomainError::Solver(e.to_string()))?
            .error_for_status()
            .map_err(|e| DomainError::Solver(e.to_string()))?;
        response
            .json()
            .await
            .map_err(|e| DomainError::Solver(e.to_string()))
    }
}

#[async_trait]
impl SterlingSolver for HttpSolverClient {
    async fn generate_plan(&self, request: &PlanRequest) -> DomainResult<PlanResponse> {
        self.post_json("/plan/generate", request).await
    }

    async fn introspect_recipe(&self, item: &str) -> DomainResult<Option<RecipeInfo>> {
        let response = self
            .client
            .get(self.url(&format!("/recipes/{item}")))
            .send()
            .await
            .map_err(|e| DomainError::Solver(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response
            .error_for_status()
            .map_err(|e| DomainError::Solver(e.to_string()))?;
        Ok(Some(response.json().await.map_err(|e| {
            DomainError::Solver(e.to_string())
        })?))
    }

    async fn solve_navigation(&self, request: &NavigationRequest) -> DomainResult<PlanResponse> {
        self.post_json("/solve-navigation", request).await
    }

    async fn report_episode(&self, report: &EpisodeReport) -> DomainResult<EpisodeAck> {
        self.post_json("/episodes", report).await
    }

    async fn health(&self) -> DomainResult<bool> {
        let response = self
            .client
            .get(self.url("/health"))
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| DomainError::Solver(e.to_string()))?;
        Ok(response.status().is_success())
    }
}
