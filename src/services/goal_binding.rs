//! Goal-binding lifecycle hooks.
//!
//! Hooks observe a status or progress mutation on a goal-bound task and
//! return the protocol effects it implies. They never mutate anything
//! themselves: the caller applies self-targeted effects in-memory before
//! its own persist and hands the rest to the drain.

use crate::domain::models::goal::{GoalStatus, Hold, HoldReason, SyncEffect};
use crate::domain::models::task::{Task, TaskStatus};

/// Produces protocol effects from task lifecycle transitions.
#[derive(Debug, Clone)]
pub struct GoalBindingHooks {
    enabled: bool,
}

impl GoalBindingHooks {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Effects implied by `task` moving to `new_status`.
    ///
    /// `goal_siblings` are the other non-terminal tasks bound to the same
    /// goal; the caller collects them from the store before persisting.
    pub fn on_task_status_changed(
        &self,
        task: &Task,
        new_status: TaskStatus,
        goal_siblings: &[Task],
    ) -> Vec<SyncEffect> {
        if !self.enabled {
            return Vec::new();
        }
        let Some(binding) = &task.metadata.goal_binding else {
            return Vec::new();
        };

        let mut effects = Vec::new();
        match new_status {
            TaskStatus::Active => {
                // One runner per goal: everything else bound to this goal
                // yields until the runner reaches a terminal state.
                for sibling in goal_siblings {
                    if sibling.id == task.id || sibling.is_terminal() {
                        continue;
                    }
                    if sibling.status == TaskStatus::Active
                        || sibling.status == TaskStatus::Pending
                    {
                        effects.push(SyncEffect::ApplyHold {
                            task_id: sibling.id,
                            hold: Hold::new(HoldReason::Preempted),
                        });
                        effects.push(SyncEffect::UpdateTaskStatus {
                            task_id: sibling.id,
                            status: TaskStatus::Paused,
                        });
                    }
                }
                effects.push(SyncEffect::UpdateGoalStatus {
                    goal_id: binding.goal_id.clone(),
                    status: GoalStatus::Active,
                    reason: None,
                });
            }
            TaskStatus::Paused => {
                // Observers must never see paused without a hold.
                if binding.hold.is_none() {
                    effects.push(SyncEffect::ApplyHold {
                        task_id: task.id,
                        hold: Hold::new(HoldReason::ManualPause),
                    });
                }
                effects.push(SyncEffect::UpdateGoalStatus {
                    goal_id: binding.goal_id.clone(),
                    status: GoalStatus::Suspended,
                    reason: task.metadata.blocked_reason.clone(),
                });
            }
            TaskStatus::Pending => {
                // Resume clears protocol-applied holds; materials holds
                // stay until the materials check clears them.
                if binding.hold.as_ref().is_some_and(|h| {
                    matches!(h.reason, HoldReason::ManualPause | HoldReason::Preempted)
                }) {
                    effects.push(SyncEffect::ClearHold { task_id: task.id });
                }
            }
            TaskStatus::Completed => {
                if binding.hold.is_some() {
                    effects.push(SyncEffect::ClearHold { task_id: task.id });
                }
                effects.push(SyncEffect::UpdateGoalStatus {
                    goal_id: binding.goal_id.clone(),
                    status: GoalStatus::Completed,
                    reason: None,
                });
            }
            TaskStatus::Failed => {
                if binding.hold.is_some() {
                    effects.push(SyncEffect::ClearHold { task_id: task.id });
                }
                effects.push(SyncEffect::UpdateGoalStatus {
                    goal_id: binding.goal_id.clone(),
                    status: GoalStatus::Failed,
                    reason: task.metadata.fail_reason.clone(),
                });
            }
            TaskStatus::PendingPlanning | TaskStatus::Unplannable => {}
        }
        effects
    }

    /// Effects implied by a progress update. Material holds are released
    /// when the task reports forward progress again.
    pub fn on_task_progress_updated(&self, task: &Task, progress: f64) -> Vec<SyncEffect> {
        if !self.enabled {
            return Vec::new();
        }
        let Some(binding) = &task.metadata.goal_binding else {
            return Vec::new();
        };
        if progress > task.progress
            && binding
                .hold
                .as_ref()
                .is_some_and(|h| h.reason == HoldReason::MaterialsMissing)
        {
            return vec![SyncEffect::ClearHold { task_id: task.id }];
        }
        Vec::new()
    }
}

/// Split effects into self-targeted (applied in-memory pre-persist) and
/// the remainder for the drain.
pub fn partition_effects(
    effects: Vec<SyncEffect>,
    originating_task: crate::domain::models::task::TaskId,
) -> (Vec<SyncEffect>, Vec<SyncEffect>) {
    effects
        .into_iter()
        .partition(|effect| effect.target_task() == Some(originating_task))
}
