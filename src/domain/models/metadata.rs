//! Typed task metadata with reserved solver namespaces.
//!
//! Incoming metadata from task originators is an open JSON map; creation
//! projects it through [`METADATA_ALLOWLIST`] into this typed record.
//! The `solver` namespace is merged as a whole object, the `sterling`
//! namespace is carried opaquely.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::action::FailureCode;
use super::goal::{GoalBinding, GoalKey};
use super::origin::TaskOrigin;
use super::requirement::Requirement;
use super::task::TaskId;

/// Keys copied from incoming metadata at creation. Everything else is
/// dropped with a dev-mode warning, once per key.
pub const METADATA_ALLOWLIST: &[&str] = &["goalKey", "subtaskKey", "taskProvenance", "sterling"];

/// Join keys tying a building plan to the solver invocation that
/// produced it. Episode reports are only linked when these cohere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinKeys {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solver_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_bundle_hash: Option<String>,
}

/// Opaque solve-result payload carried until episode reporting consumes
/// it. Coherent only when its bundle hash matches the join keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolveSubstrate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome_class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_stats: Option<serde_json::Value>,
}

/// Feasibility-gate advice payload attached by the solver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigGMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feasible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Replan bookkeeping for feasibility-gate rejections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RigGReplan {
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

/// Per-task building execution budget accounting.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionBudgetState {
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_attempt_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
}

/// Solver provenance namespace, merged whole at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolverMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_template_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_solve_join_keys: Option<JoinKeys>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub building_solve_result_substrate: Option<SolveSubstrate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rig_g: Option<RigGMeta>,
    #[serde(default)]
    pub rig_g_checked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rig_g_replan: Option<RigGReplan>,
    #[serde(default)]
    pub replan_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggested_parallelism: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub episode_hash_slots: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_binding_failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_budget: Option<ExecutionBudgetState>,
}

/// Typed task metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub child_task_ids: Vec<TaskId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirement: Option<Requirement>,
    /// Immutable after finalize
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<TaskOrigin>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_binding: Option<GoalBinding>,
    /// Opaque solver provenance carried through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sterling: Option<serde_json::Value>,
    #[serde(default)]
    pub solver: SolverMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_eligible_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub shadow_observation_count: u32,
    #[serde(default)]
    pub verify_fail_count: u32,
    #[serde(default)]
    pub prereq_injection_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_key: Option<GoalKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_code: Option<FailureCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_provenance: Option<String>,
    /// Skeleton-stage marker set by the goal resolver, cleared at finalize
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "_stage")]
    pub stage: Option<String>,
}

fn default_max_retries() -> u32 {
    3
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskMetadata {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            child_task_ids: Vec::new(),
            tags: Vec::new(),
            requirement: None,
            origin: None,
            goal_binding: None,
            sterling: None,
            solver: SolverMeta::default(),
            blocked_reason: None,
            blocked_at: None,
            next_eligible_at: None,
            shadow_observation_count: 0,
            verify_fail_count: 0,
            prereq_injection_count: 0,
            parent_task_id: None,
            subtask_key: None,
            goal_key: None,
            fail_reason: None,
            failure_code: None,
            task_provenance: None,
            stage: None,
        }
    }

    /// Marker value used on goal-resolver skeletons.
    pub const STAGE_SKELETON: &'static str = "skeleton";

    pub fn is_skeleton(&self) -> bool {
        self.stage.as_deref() == Some(Self::STAGE_SKELETON)
    }
}

/// Outcome of projecting an incoming metadata map.
#[derive(Debug, Default)]
pub struct MetadataProjection {
    pub metadata: TaskMetadata,
    /// Keys that were outside the allowlist and dropped
    pub dropped_keys: Vec<String>,
}

/// Project an open incoming metadata map through the allowlist.
///
/// Copies `goalKey` (empty coerced to absent), `subtaskKey`,
/// `taskProvenance`, the opaque `sterling` namespace, and merges a
/// `solver` object whole. Every other key is reported back as dropped.
pub fn project_incoming_metadata(
    incoming: &serde_json::Map<String, serde_json::Value>,
) -> MetadataProjection {
    let mut projection = MetadataProjection::default();
    let metadata = &mut projection.metadata;

    for (key, value) in incoming {
        match key.as_str() {
            "goalKey" => {
                metadata.goal_key = value.as_str().and_then(GoalKey::new);
            }
            "subtaskKey" => {
                metadata.subtask_key = value.as_str().map(str::to_string);
            }
            "taskProvenance" => {
                metadata.task_provenance = value.as_str().map(str::to_string);
            }
            "sterling" => {
                metadata.sterling = Some(value.clone());
            }
            // The solver namespace is merged whole, not key-by-key.
            "solver" => match serde_json::from_value::<SolverMeta>(value.clone()) {
                Ok(solver) => metadata.solver = solver,
                Err(err) => {
                    tracing::warn!(error = %err, "Discarding malformed solver namespace");
                    projection.dropped_keys.push(key.clone());
                }
            },
            other => projection.dropped_keys.push(other.to_string()),
        }
    }

    projection
}

/// Mutable subset accepted by the metadata update API.
///
/// `goal_binding` and `origin` fields are present so callers can hand
/// over whole patches, but the store strips them: both are controlled by
/// dedicated APIs.
#[derive(Debug, Clone, Default)]
pub struct MetadataPatch {
    pub tags: Option<Vec<String>>,
    pub max_retries: Option<u32>,
    pub requirement: Option<Option<Requirement>>,
    pub sterling: Option<serde_json::Value>,
    pub blocked_reason: Option<Option<String>>,
    pub next_eligible_at: Option<Option<DateTime<Utc>>>,
    pub fail_reason: Option<Option<String>>,
    /// Stripped on apply
    pub goal_binding: Option<GoalBinding>,
    /// Stripped on apply
    pub origin: Option<TaskOrigin>,
}

impl MetadataPatch {
    /// Whether the patch carries fields that the update API refuses.
    pub fn has_guarded_fields(&self) -> bool {
        self.goal_binding.is_some() || self.origin.is_some()
    }

    /// Apply the patch to a metadata record, ignoring guarded fields.
    pub fn apply_to(&self, metadata: &mut TaskMetadata) {
        if let Some(tags) = &self.tags {
            metadata.tags.clone_from(tags);
        }
        if let Some(max_retries) = self.max_retries {
            metadata.max_retries = max_retries;
        }
        if let Some(requirement) = &self.requirement {
            metadata.requirement.clone_from(requirement);
        }
        if let Some(sterling) = &self.sterling {
            metadata.sterling = Some(sterling.clone());
        }
        if let Some(blocked_reason) = &self.blocked_reason {
            match blocked_reason {
                Some(reason) => {
                    metadata.blocked_reason = Some(reason.clone());
                    metadata.blocked_at = Some(Utc::now());
                }
                None => {
                    metadata.blocked_reason = None;
                    metadata.blocked_at = None;
                }
            }
        }
        if let Some(next_eligible_at) = self.next_eligible_at {
            metadata.next_eligible_at = next_eligible_at;
        }
        if let Some(fail_reason) = &self.fail_reason {
            metadata.fail_reason.clone_from(fail_reason);
        }
        metadata.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_projection_allowlist() {
        let incoming = json!({
            "goalKey": "gk-1",
            "subtaskKey": "sk-1",
            "taskProvenance": "prereq:craft",
            "sterling": {"committedIrDigest": "abc"},
            "retryCount": 9,
            "blockedReason": "smuggled",
        });
        let serde_json::Value::Object(map) = incoming else {
            panic!("expected object")
        };
        let projection = project_incoming_metadata(&map);

        assert_eq!(projection.metadata.goal_key.as_ref().unwrap().as_str(), "gk-1");
        assert_eq!(projection.metadata.subtask_key.as_deref(), Some("sk-1"));
        assert_eq!(
            projection.metadata.task_provenance.as_deref(),
            Some("prereq:craft")
        );
        assert!(projection.metadata.sterling.is_some());
        // Smuggled keys never land
        assert_eq!(projection.metadata.retry_count, 0);
        assert!(projection.metadata.blocked_reason.is_none());
        let mut dropped = projection.dropped_keys.clone();
        dropped.sort();
        assert_eq!(dropped, vec!["blockedReason", "retryCount"]);
    }

    #[test]
    fn test_projection_empty_goal_key_coerced() {
        let serde_json::Value::Object(map) = json!({"goalKey": ""}) else {
            panic!("expected object")
        };
        let projection = project_incoming_metadata(&map);
        assert!(projection.metadata.goal_key.is_none());
    }

    #[test]
    fn test_solver_namespace_merged_whole() {
        let serde_json::Value::Object(map) = json!({
            "solver": {
                "stepsDigest": "0xAAAA",
                "buildingPlanId": "plan-7",
                "buildingSolveJoinKeys": {"planId": "plan-7", "bundleHash": "bh"},
            }
        }) else {
            panic!("expected object")
        };
        let projection = project_incoming_metadata(&map);
        assert_eq!(projection.metadata.solver.steps_digest.as_deref(), Some("0xAAAA"));
        assert_eq!(
            projection
                .metadata
                .solver
                .building_solve_join_keys
                .as_ref()
                .unwrap()
                .plan_id
                .as_deref(),
            Some("plan-7")
        );
        assert!(projection.dropped_keys.is_empty());
    }

    #[test]
    fn test_patch_strips_guarded_fields() {
        let mut metadata = TaskMetadata::new();
        let patch = MetadataPatch {
            tags: Some(vec!["urgent".into()]),
            origin: Some(TaskOrigin::new(crate::domain::models::origin::OriginKind::Api)),
            ..Default::default()
        };
        assert!(patch.has_guarded_fields());
        patch.apply_to(&mut metadata);
        assert_eq!(metadata.tags, vec!["urgent".to_string()]);
        assert!(metadata.origin.is_none());
    }

    #[test]
    fn test_patch_blocked_reason_backfills_timestamp() {
        let mut metadata = TaskMetadata::new();
        let patch = MetadataPatch {
            blocked_reason: Some(Some("waiting_on_prereq".into())),
            ..Default::default()
        };
        patch.apply_to(&mut metadata);
        assert!(metadata.blocked_at.is_some());

        let clear = MetadataPatch {
            blocked_reason: Some(None),
            ..Default::default()
        };
        clear.apply_to(&mut metadata);
        assert!(metadata.blocked_at.is_none());
    }
}
