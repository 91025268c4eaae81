//! Goal-binding control plane types.
//!
//! A goal-bound task carries a [`GoalBinding`] tying it to the goal
//! instance that spawned it. Holds are protocol-level pause markers with
//! typed reasons; they ride on the binding rather than on task status so
//! that pause/resume survives status churn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::{TaskId, TaskStatus};

/// Canonical goal deduplication key.
///
/// Never empty: every ingress coerces the empty string to absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GoalKey(String);

impl GoalKey {
    /// Build a key, coercing the empty string to `None`.
    pub fn new(key: impl Into<String>) -> Option<Self> {
        let key = key.into();
        if key.is_empty() {
            None
        } else {
            Some(Self(key))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for GoalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a goal-bound task is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    ManualPause,
    Preempted,
    MaterialsMissing,
    Unsafe,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ManualPause => "manual_pause",
            Self::Preempted => "preempted",
            Self::MaterialsMissing => "materials_missing",
            Self::Unsafe => "unsafe",
        }
    }
}

/// Protocol-level pause marker on a goal-bound task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hold {
    pub reason: HoldReason,
    pub held_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resume_hints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_review_at: Option<DateTime<Utc>>,
}

impl Hold {
    pub fn new(reason: HoldReason) -> Self {
        Self {
            reason,
            held_at: Utc::now(),
            resume_hints: Vec::new(),
            next_review_at: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.resume_hints.push(hint.into());
        self
    }
}

/// Binding between a task and the goal instance that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoalBinding {
    pub goal_id: String,
    pub goal_key: GoalKey,
    pub goal_type: String,
    pub instance_id: String,
    /// Name of the verifier that can re-check goal satisfaction
    pub verifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<Hold>,
}

impl GoalBinding {
    pub fn new(
        goal_id: impl Into<String>,
        goal_key: GoalKey,
        goal_type: impl Into<String>,
        instance_id: impl Into<String>,
        verifier: impl Into<String>,
    ) -> Self {
        Self {
            goal_id: goal_id.into(),
            goal_key,
            goal_type: goal_type.into(),
            instance_id: instance_id.into(),
            verifier: verifier.into(),
            hold: None,
        }
    }

    pub fn is_held(&self) -> bool {
        self.hold.is_some()
    }
}

/// Goal status values surfaced to the goal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GoalStatus {
    Active,
    Suspended,
    Completed,
    Failed,
}

impl GoalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "ACTIVE",
            Self::Suspended => "SUSPENDED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// One protocol effect produced by a lifecycle hook.
///
/// Effects targeting the originating task ("self-holds") are applied
/// in-memory before that task's own persist; everything else is
/// serialized through the drain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEffect {
    ApplyHold { task_id: TaskId, hold: Hold },
    ClearHold { task_id: TaskId },
    UpdateTaskStatus { task_id: TaskId, status: TaskStatus },
    UpdateGoalStatus {
        goal_id: String,
        status: GoalStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl SyncEffect {
    /// The task this effect targets, when it targets a task at all.
    pub fn target_task(&self) -> Option<TaskId> {
        match self {
            Self::ApplyHold { task_id, .. }
            | Self::ClearHold { task_id }
            | Self::UpdateTaskStatus { task_id, .. } => Some(*task_id),
            Self::UpdateGoalStatus { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApplyHold { .. } => "apply_hold",
            Self::ClearHold { .. } => "clear_hold",
            Self::UpdateTaskStatus { .. } => "update_task_status",
            Self::UpdateGoalStatus { .. } => "update_goal_status",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_goal_key_rejects_empty() {
        assert!(GoalKey::new("").is_none());
        assert_eq!(GoalKey::new("g1").unwrap().as_str(), "g1");
    }

    #[test]
    fn test_hold_reason_labels() {
        assert_eq!(HoldReason::ManualPause.as_str(), "manual_pause");
        assert_eq!(HoldReason::Unsafe.as_str(), "unsafe");
    }

    #[test]
    fn test_effect_target_partitioning() {
        let id = uuid::Uuid::new_v4();
        let apply = SyncEffect::ApplyHold {
            task_id: id,
            hold: Hold::new(HoldReason::Preempted),
        };
        assert_eq!(apply.target_task(), Some(id));

        let goal = SyncEffect::UpdateGoalStatus {
            goal_id: "g".into(),
            status: GoalStatus::Suspended,
            reason: None,
        };
        assert_eq!(goal.target_task(), None);
    }
}
