//! Step verification records and baseline snapshots.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;
use super::world::{InventoryItem, Position};

/// Outcome of a step verification pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Verified,
    Skipped,
    Failed,
}

impl VerificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verified => "verified",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }

    /// Whether step progression may continue on this outcome.
    pub fn allows_progress(&self) -> bool {
        matches!(self, Self::Verified | Self::Skipped)
    }
}

/// Ephemeral per-step verification record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionVerification {
    pub task_id: TaskId,
    pub step_id: String,
    pub action_type: String,
    pub expected_result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_result: Option<String>,
    pub verified: bool,
    pub status: VerificationStatus,
    pub timestamp: DateTime<Utc>,
}

impl ActionVerification {
    pub fn new(
        task_id: TaskId,
        step_id: impl Into<String>,
        action_type: impl Into<String>,
        expected_result: impl Into<String>,
        status: VerificationStatus,
    ) -> Self {
        Self {
            task_id,
            step_id: step_id.into(),
            action_type: action_type.into(),
            expected_result: expected_result.into(),
            actual_result: None,
            verified: matches!(status, VerificationStatus::Verified),
            status,
            timestamp: Utc::now(),
        }
    }

    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual_result = Some(actual.into());
        self
    }
}

/// Baseline world snapshot captured when a step starts.
///
/// Verifiers compare post-execution state against this baseline; the
/// snapshot is keyed `(task_id, step_id)` and cleared on terminal
/// transitions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepSnapshot {
    pub ts: DateTime<Utc>,
    pub position: Position,
    pub food: f64,
    pub health: f64,
    pub inventory_total: u32,
    pub inventory_by_name: BTreeMap<String, u32>,
}

impl StepSnapshot {
    pub fn capture(position: Position, food: f64, health: f64, inventory: &[InventoryItem]) -> Self {
        let mut by_name = BTreeMap::new();
        let mut total = 0u32;
        for item in inventory {
            total = total.saturating_add(item.count);
            *by_name.entry(item.name.clone()).or_insert(0) += item.count;
        }
        Self {
            ts: Utc::now(),
            position,
            food,
            health,
            inventory_total: total,
            inventory_by_name: by_name,
        }
    }

    /// Count held at snapshot time for any of the given names.
    pub fn count_of(&self, names: &[String]) -> u32 {
        names
            .iter()
            .filter_map(|name| self.inventory_by_name.get(name))
            .sum()
    }
}
