//! Sterling solver port.
//!
//! Sterling is an external service producing structured step plans with
//! digests and join keys. Recipe knowledge also lives there; the core
//! never reimplements recipe logic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::models::task::{ItemStack, Step, TaskId, TaskKind, TaskParameters};
use crate::domain::models::world::{OccupancyGrid, Position};

/// Solver domains a plan request can be routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverDomain {
    Building,
    Crafting,
    ToolProgression,
    Navigation,
}

impl SolverDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Building => "building",
            Self::Crafting => "crafting",
            Self::ToolProgression => "tool-progression",
            Self::Navigation => "navigation",
        }
    }
}

/// Plan generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub title: String,
    pub kind: TaskKind,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: TaskParameters,
    /// Current world state snapshot when available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub world_state: Option<serde_json::Value>,
    /// Failure context passed by the repair gate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_context: Option<String>,
}

/// Plan generation response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanResponse {
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_steps_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
}

/// Recipe introspection result.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeInfo {
    #[serde(default)]
    pub requires_table: bool,
    #[serde(default)]
    pub inputs: Vec<ItemStack>,
}

/// Navigation solve request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationRequest {
    pub start: Position,
    pub goal: Position,
    #[serde(default)]
    pub tolerance_xz: f64,
    #[serde(default)]
    pub tolerance_y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<OccupancyGrid>,
}

/// Execution episode report sent back to the solver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeReport {
    pub task_id: TaskId,
    pub domain: SolverDomain,
    pub outcome_class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_bundle_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_stats: Option<serde_json::Value>,
}

/// Acknowledgement from an episode report.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodeAck {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episode_hash: Option<String>,
}

#[async_trait]
pub trait SterlingSolver: Send + Sync {
    /// Generate a step plan for a task.
    async fn generate_plan(&self, request: &PlanRequest) -> DomainResult<PlanResponse>;

    /// Introspect a craftable item's recipe, if known.
    async fn introspect_recipe(&self, item: &str) -> DomainResult<Option<RecipeInfo>>;

    /// Solve a navigation request against a scanned world volume.
    async fn solve_navigation(&self, request: &NavigationRequest) -> DomainResult<PlanResponse>;

    /// Report an execution episode outcome. Fire-and-forget at call sites.
    async fn report_episode(&self, report: &EpisodeReport) -> DomainResult<EpisodeAck>;

    /// Solver liveness probe.
    async fn health(&self) -> DomainResult<bool>;
}

/// Hierarchical navigation macro planner (Rig E).
#[async_trait]
pub trait MacroPlanner: Send + Sync {
    /// Propose a macro route, or None to fall through to the base solver.
    async fn macro_route(&self, request: &NavigationRequest) -> DomainResult<Option<PlanResponse>>;
}

/// Feedback store consumed by the macro planner.
#[async_trait]
pub trait FeedbackStore: Send + Sync {
    async fn record_navigation_outcome(&self, task_id: TaskId, success: bool, detail: &str);
}
