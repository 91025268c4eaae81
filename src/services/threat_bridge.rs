//! Threat-hold bridge.
//!
//! Each executor cycle reads the threat signal from the bot interface
//! and reconciles `unsafe` holds: high threat pauses active work, low
//! threat releases tasks that were paused for safety. The bridge only
//! uses the public hold/status APIs; it never touches the store.

use std::sync::Arc;

use crate::domain::models::goal::{Hold, HoldReason};
use crate::domain::models::task::{Task, TaskStatus};
use crate::domain::ports::BotInterface;
use crate::services::task_service::{MutationOrigin, TaskService};

/// Threat level at or above which active tasks are held.
const THREAT_HOLD_THRESHOLD: f64 = 0.7;

/// Threat level at or below which unsafe holds are released.
const THREAT_RELEASE_THRESHOLD: f64 = 0.3;

/// Discrete threat assessment for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatAssessment {
    Hold,
    Release,
    Steady,
}

/// Pure classification of the raw threat signal.
pub fn assess_threat(threat_level: f64, hostiles_nearby: u32) -> ThreatAssessment {
    if threat_level >= THREAT_HOLD_THRESHOLD || hostiles_nearby >= 3 {
        ThreatAssessment::Hold
    } else if threat_level <= THREAT_RELEASE_THRESHOLD && hostiles_nearby == 0 {
        ThreatAssessment::Release
    } else {
        ThreatAssessment::Steady
    }
}

pub struct ThreatBridge {
    bot: Arc<dyn BotInterface>,
}

impl ThreatBridge {
    pub fn new(bot: Arc<dyn BotInterface>) -> Self {
        Self { bot }
    }

    /// Evaluate holds over active tasks and unsafe-paused tasks.
    /// Returns the number of tasks whose hold state changed.
    pub async fn evaluate(&self, service: &TaskService) -> usize {
        let Ok(state) = self.bot.state().await else {
            // No signal; leave holds untouched rather than guessing.
            return 0;
        };
        let assessment = assess_threat(state.threat_level, state.hostiles_nearby);
        if assessment == ThreatAssessment::Steady {
            return 0;
        }

        let candidates = service.non_terminal_tasks().await;
        let mut changed = 0;

        match assessment {
            ThreatAssessment::Hold => {
                for task in candidates
                    .iter()
                    .filter(|t| t.status == TaskStatus::Active || t.status == TaskStatus::Pending)
                    .filter(|t| t.metadata.goal_binding.is_some())
                {
                    if self.hold_unsafe(service, task).await {
                        changed += 1;
                    }
                }
            }
            ThreatAssessment::Release => {
                for task in candidates.iter().filter(|t| {
                    t.status == TaskStatus::Paused && has_unsafe_hold(t)
                }) {
                    if self.release_unsafe(service, task).await {
                        changed += 1;
                    }
                }
            }
            ThreatAssessment::Steady => {}
        }
        changed
    }

    async fn hold_unsafe(&self, service: &TaskService, task: &Task) -> bool {
        if has_unsafe_hold(task) {
            return false;
        }
        tracing::warn!(task_id = %task.id, "Threat detected; applying unsafe hold");
        let hold = Hold::new(HoldReason::Unsafe).with_hint("threat level subsided");
        if service.apply_hold(task.id, hold).await.is_err() {
            return false;
        }
        if task.status != TaskStatus::Paused {
            if let Err(err) = service
                .update_status(task.id, TaskStatus::Paused, MutationOrigin::Protocol)
                .await
            {
                tracing::warn!(task_id = %task.id, error = %err, "Unsafe pause failed");
                return false;
            }
        }
        true
    }

    async fn release_unsafe(&self, service: &TaskService, task: &Task) -> bool {
        tracing::info!(task_id = %task.id, "Threat subsided; releasing unsafe hold");
        if service.clear_hold(task.id).await.is_err() {
            return false;
        }
        service
            .update_status(task.id, TaskStatus::Pending, MutationOrigin::Protocol)
            .await
            .is_ok()
    }
}

fn has_unsafe_hold(task: &Task) -> bool {
    task.metadata
        .goal_binding
        .as_ref()
        .and_then(|b| b.hold.as_ref())
        .is_some_and(|h| h.reason == HoldReason::Unsafe)
}
