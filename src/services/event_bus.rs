//! Typed lifecycle event bus.
//!
//! Every task mutation emits a structured event. Consumers (SSE bridge,
//! cognition review, event-store writer) subscribe to one broadcast
//! channel; publishing never blocks and never fails the mutation path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::models::goal::GoalStatus;
use crate::domain::models::task::{TaskId, TaskStatus};

/// Why the executor produced no work this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleReason {
    NoTasks,
    AllInBackoff,
    CircuitBreakerOpen,
    BlockedOnPrereq,
    ManualPause,
}

impl IdleReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoTasks => "no_tasks",
            Self::AllInBackoff => "all_in_backoff",
            Self::CircuitBreakerOpen => "circuit_breaker_open",
            Self::BlockedOnPrereq => "blocked_on_prereq",
            Self::ManualPause => "manual_pause",
        }
    }
}

/// Discriminated lifecycle event payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EventPayload {
    TaskAdded {
        task_id: TaskId,
        title: String,
        kind: String,
        source: String,
        priority: f64,
    },
    HighPriorityAdded {
        task_id: TaskId,
        priority: f64,
    },
    TaskStatusChanged {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },
    TaskProgressUpdated {
        task_id: TaskId,
        progress: f64,
    },
    TaskCompleted {
        task_id: TaskId,
    },
    TaskFailed {
        task_id: TaskId,
        reason: Option<String>,
    },
    SolverUnavailable {
        task_id: TaskId,
        reason: String,
    },
    ShadowMode {
        task_id: TaskId,
        observation_count: u32,
    },
    RigGReplanScheduled {
        task_id: TaskId,
        attempt: u32,
        delay_ms: u64,
    },
    RigGReplanExhausted {
        task_id: TaskId,
        attempts: u32,
    },
    UnknownLeafRejected {
        task_id: TaskId,
        step_id: String,
        leaf: String,
    },
    ExecutorBudget {
        task_id: TaskId,
        reason: String,
    },
    GoalBindingDrift {
        task_id: TaskId,
        reason: String,
    },
    IntentParamsUnserializable {
        goal_type: String,
        detail: String,
    },
    IdlePeriod {
        reason: IdleReason,
        active_count: usize,
        eligible_count: usize,
    },
    GoalStatusUpdated {
        goal_id: String,
        status: GoalStatus,
        reason: Option<String>,
    },
    ProtocolEffectFailed {
        source_task: TaskId,
        effect_kinds: Vec<String>,
        error: String,
    },
    EmergencyStopEngaged,
}

impl EventPayload {
    /// Discriminant name, used as the persisted `event_type`.
    pub fn variant_name(&self) -> &'static str {
        match self {
            Self::TaskAdded { .. } => "task_added",
            Self::HighPriorityAdded { .. } => "high_priority_added",
            Self::TaskStatusChanged { .. } => "task_status_changed",
            Self::TaskProgressUpdated { .. } => "task_progress_updated",
            Self::TaskCompleted { .. } => "completed",
            Self::TaskFailed { .. } => "failed",
            Self::SolverUnavailable { .. } => "solver_unavailable",
            Self::ShadowMode { .. } => "shadow_mode",
            Self::RigGReplanScheduled { .. } => "rig_g_replan_scheduled",
            Self::RigGReplanExhausted { .. } => "rig_g_replan_exhausted",
            Self::UnknownLeafRejected { .. } => "unknown_leaf_rejected",
            Self::ExecutorBudget { .. } => "executor_budget",
            Self::GoalBindingDrift { .. } => "goal_binding_drift",
            Self::IntentParamsUnserializable { .. } => "intent_params_unserializable",
            Self::IdlePeriod { .. } => "idle_period",
            Self::GoalStatusUpdated { .. } => "goal_status_updated",
            Self::ProtocolEffectFailed { .. } => "protocol_effect_failed",
            Self::EmergencyStopEngaged => "emergency_stop",
        }
    }

    /// Task this event concerns, when any.
    pub fn task_id(&self) -> Option<TaskId> {
        match self {
            Self::TaskAdded { task_id, .. }
            | Self::HighPriorityAdded { task_id, .. }
            | Self::TaskStatusChanged { task_id, .. }
            | Self::TaskProgressUpdated { task_id, .. }
            | Self::TaskCompleted { task_id }
            | Self::TaskFailed { task_id, .. }
            | Self::SolverUnavailable { task_id, .. }
            | Self::ShadowMode { task_id, .. }
            | Self::RigGReplanScheduled { task_id, .. }
            | Self::RigGReplanExhausted { task_id, .. }
            | Self::UnknownLeafRejected { task_id, .. }
            | Self::ExecutorBudget { task_id, .. }
            | Self::GoalBindingDrift { task_id, .. }
            | Self::ProtocolEffectFailed {
                source_task: task_id,
                ..
            } => Some(*task_id),
            Self::IntentParamsUnserializable { .. }
            | Self::IdlePeriod { .. }
            | Self::GoalStatusUpdated { .. }
            | Self::EmergencyStopEngaged => None,
        }
    }
}

/// Envelope carrying sequencing and timing metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanningEvent {
    pub id: Uuid,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

/// Broadcast-based event bus with monotonic sequencing.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PlanningEvent>,
    sequence: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Publish an event. Send errors (no subscribers) are ignored.
    pub fn publish(&self, payload: EventPayload) -> PlanningEvent {
        let event = PlanningEvent {
            id: Uuid::new_v4(),
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst),
            timestamp: Utc::now(),
            payload,
        };
        let _ = self.sender.send(event.clone());
        event
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PlanningEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
