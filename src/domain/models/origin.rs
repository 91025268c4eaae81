//! Task origin stamping.
//!
//! Every finalized task carries an immutable origin record describing the
//! pathway that created it. The record is stamped exactly once by the
//! finalizer and stripped from every later metadata patch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::goal::GoalKey;
use super::task::{Task, TaskId, TaskSource};

/// Creation pathway discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginKind {
    Api,
    Cognition,
    Executor,
    GoalResolver,
    GoalSource,
    Unknown,
}

impl OriginKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Cognition => "cognition",
            Self::Executor => "executor",
            Self::GoalResolver => "goal_resolver",
            Self::GoalSource => "goal_source",
            Self::Unknown => "unknown",
        }
    }
}

/// Immutable provenance record stamped at finalize time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOrigin {
    pub kind: OriginKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_goal_key: Option<GoalKey>,
    pub created_at: DateTime<Utc>,
}

impl TaskOrigin {
    pub fn new(kind: OriginKind) -> Self {
        Self {
            kind,
            name: None,
            parent_task_id: None,
            parent_goal_key: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_parent(mut self, parent: TaskId) -> Self {
        self.parent_task_id = Some(parent);
        self
    }

    pub fn with_goal_key(mut self, key: GoalKey) -> Self {
        self.parent_goal_key = Some(key);
        self
    }
}

/// Infer the origin of a task about to be finalized.
///
/// Rules, first match wins:
/// 1. a provenance marker means an executor-spawned subtask
/// 2. autonomous tasks come from cognition
/// 3. goal-sourced tasks split on whether the resolver bound them
/// 4. everything else entered through the API surface
pub fn infer_task_origin(task: &Task) -> TaskOrigin {
    if task.metadata.task_provenance.is_some() {
        let mut origin = TaskOrigin::new(OriginKind::Executor);
        origin.name.clone_from(&task.metadata.task_provenance);
        origin.parent_task_id = task.metadata.parent_task_id;
        return origin;
    }
    if task.source == TaskSource::Autonomous {
        return TaskOrigin::new(OriginKind::Cognition);
    }
    if task.source == TaskSource::Goal {
        return match &task.metadata.goal_binding {
            Some(binding) => {
                TaskOrigin::new(OriginKind::GoalResolver).with_goal_key(binding.goal_key.clone())
            }
            None => TaskOrigin::new(OriginKind::GoalSource),
        };
    }
    TaskOrigin::new(OriginKind::Api)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::goal::GoalBinding;
    use crate::domain::models::task::TaskKind;

    fn task(source: TaskSource) -> Task {
        Task::new("t", TaskKind::new(TaskKind::GATHERING), source)
    }

    #[test]
    fn test_provenance_beats_source() {
        let mut t = task(TaskSource::Autonomous);
        t.metadata.task_provenance = Some("prereq:craft".into());
        assert_eq!(infer_task_origin(&t).kind, OriginKind::Executor);
    }

    #[test]
    fn test_autonomous_maps_to_cognition() {
        assert_eq!(
            infer_task_origin(&task(TaskSource::Autonomous)).kind,
            OriginKind::Cognition
        );
    }

    #[test]
    fn test_goal_split_on_binding() {
        let mut bound = task(TaskSource::Goal);
        bound.metadata.goal_binding = Some(GoalBinding::new(
            "g1",
            GoalKey::new("key").unwrap(),
            "build_shelter",
            "i1",
            "shelter_verifier",
        ));
        assert_eq!(infer_task_origin(&bound).kind, OriginKind::GoalResolver);

        let unbound = task(TaskSource::Goal);
        assert_eq!(infer_task_origin(&unbound).kind, OriginKind::GoalSource);
    }

    #[test]
    fn test_default_is_api() {
        assert_eq!(infer_task_origin(&task(TaskSource::Manual)).kind, OriginKind::Api);
        assert_eq!(infer_task_origin(&task(TaskSource::Planner)).kind, OriginKind::Api);
    }
}
