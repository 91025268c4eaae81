//! Task domain model.
//!
//! Tasks are the unit of work the executor drives against the bot. A task
//! carries an ordered step plan produced by the Sterling solver, opaque
//! parameters from its originator, and a typed metadata record with
//! reserved solver namespaces.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::metadata::TaskMetadata;
use super::world::Position;

/// Unique task identifier.
pub type TaskId = Uuid;

/// Status of a task in the planning pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Task is waiting to be picked up by the executor
    Pending,
    /// Task has started executing (first step dispatched)
    Active,
    /// Solver emitted a blocked sentinel; waiting for planning capacity
    PendingPlanning,
    /// Task is held by a management action or a protocol hold
    Paused,
    /// Feasibility gate rejected the plan; replan scheduled
    Unplannable,
    /// Task finished successfully
    Completed,
    /// Task failed (deterministic failure or retry exhaustion)
    Failed,
}

impl Default for TaskStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::PendingPlanning => "pending_planning",
            Self::Paused => "paused",
            Self::Unplannable => "unplannable",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "pending_planning" => Some(Self::PendingPlanning),
            "paused" => Some(Self::Paused),
            "unplannable" => Some(Self::Unplannable),
            "completed" | "complete" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Valid transitions from this status.
    pub fn valid_transitions(&self) -> &'static [TaskStatus] {
        match self {
            Self::Pending => &[
                Self::Active,
                Self::Paused,
                Self::PendingPlanning,
                Self::Unplannable,
                Self::Completed,
                Self::Failed,
            ],
            Self::Active => &[
                Self::Pending,
                Self::Paused,
                Self::Unplannable,
                Self::Completed,
                Self::Failed,
            ],
            Self::PendingPlanning => &[
                Self::Pending,
                Self::Active,
                Self::Paused,
                Self::Completed,
                Self::Failed,
            ],
            Self::Paused => &[Self::Pending, Self::Active, Self::Completed, Self::Failed],
            Self::Unplannable => &[Self::Pending, Self::Failed],
            Self::Completed => &[],
            Self::Failed => &[],
        }
    }

    pub fn can_transition_to(&self, new_status: Self) -> bool {
        self.valid_transitions().contains(&new_status)
    }
}

/// Where a task was injected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskSource {
    /// Produced by the macro planner
    Planner,
    /// Produced by the goal resolver control plane
    Goal,
    /// Injected by an intrusive-thought pathway
    Intrusive,
    /// Spawned autonomously from cognition signals
    Autonomous,
    /// Submitted by an operator
    Manual,
    /// Converted from a cognitive thought
    Cognition,
}

impl Default for TaskSource {
    fn default() -> Self {
        Self::Manual
    }
}

impl TaskSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Goal => "goal",
            Self::Intrusive => "intrusive",
            Self::Autonomous => "autonomous",
            Self::Manual => "manual",
            Self::Cognition => "cognition",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "planner" => Some(Self::Planner),
            "goal" => Some(Self::Goal),
            "intrusive" => Some(Self::Intrusive),
            "autonomous" => Some(Self::Autonomous),
            "manual" => Some(Self::Manual),
            "cognition" => Some(Self::Cognition),
            _ => None,
        }
    }
}

/// Free-form task classification tag.
///
/// Kinds are open-ended; the well-known values below get dedicated
/// routing in the executor and goal resolver.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskKind(String);

impl TaskKind {
    pub const GATHERING: &'static str = "gathering";
    pub const MINING: &'static str = "mining";
    pub const CRAFTING: &'static str = "crafting";
    pub const BUILDING: &'static str = "building";
    pub const PLACEMENT: &'static str = "placement";
    pub const ADVISORY_ACTION: &'static str = "advisory_action";
    pub const COGNITIVE_REFLECTION: &'static str = "cognitive_reflection";
    pub const STERLING_IR: &'static str = "sterling_ir";

    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_building(&self) -> bool {
        self.0 == Self::BUILDING
    }

    pub fn is_crafting(&self) -> bool {
        self.0 == Self::CRAFTING
    }

    pub fn is_advisory(&self) -> bool {
        self.0 == Self::ADVISORY_ACTION
    }

    pub fn is_cognitive_reflection(&self) -> bool {
        self.0 == Self::COGNITIVE_REFLECTION
    }

    pub fn is_sterling_ir(&self) -> bool {
        self.0 == Self::STERLING_IR
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskKind {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A named item quantity carried by step metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemStack {
    pub item: String,
    pub count: u32,
}

impl ItemStack {
    pub fn new(item: impl Into<String>, count: u32) -> Self {
        Self {
            item: item.into(),
            count,
        }
    }
}

/// Machine-readable execution metadata attached to a step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepMeta {
    /// Atomic action name dispatched to the bot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leaf: Option<String>,
    /// Leaf arguments (validated against the per-leaf contract table)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub produces: Vec<ItemStack>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub consumes: Vec<ItemStack>,
    #[serde(default)]
    pub executable: bool,
    /// Blocked sentinel marker emitted by the solver
    #[serde(default)]
    pub blocked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workstation: Option<String>,
}

/// One entry in a task's ordered plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub label: String,
    pub order: u32,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_duration_ms: Option<u64>,
    #[serde(default)]
    pub meta: StepMeta,
}

impl Step {
    pub fn new(label: impl Into<String>, order: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            label: label.into(),
            order,
            done: false,
            started_at: None,
            completed_at: None,
            actual_duration_ms: None,
            meta: StepMeta::default(),
        }
    }

    /// Build an executable leaf step.
    pub fn leaf(label: impl Into<String>, order: u32, leaf: impl Into<String>) -> Self {
        let mut step = Self::new(label, order);
        step.meta.leaf = Some(leaf.into());
        step.meta.executable = true;
        step
    }

    /// Build the solver-unavailable blocked sentinel.
    pub fn blocked_sentinel(reason: impl Into<String>) -> Self {
        let reason = reason.into();
        let mut step = Self::new("blocked", 0);
        step.meta.blocked = true;
        step.meta.blocked_reason = Some(reason);
        step
    }

    pub fn with_args(mut self, args: serde_json::Value) -> Self {
        self.meta.args = Some(args);
        self
    }

    pub fn with_produces(mut self, produces: Vec<ItemStack>) -> Self {
        self.meta.produces = produces;
        self
    }

    pub fn with_consumes(mut self, consumes: Vec<ItemStack>) -> Self {
        self.meta.consumes = consumes;
        self
    }

    /// A step is dispatchable when it carries a leaf or an executable flag.
    pub fn is_executable(&self) -> bool {
        self.meta.executable || self.meta.leaf.is_some()
    }

    /// Mark the step as started, recording the timestamp.
    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Mark the step done, recording completion time and duration.
    pub fn complete(&mut self) {
        let now = Utc::now();
        self.done = true;
        self.completed_at = Some(now);
        if let Some(started) = self.started_at {
            let elapsed = (now - started).num_milliseconds();
            self.actual_duration_ms = Some(u64::try_from(elapsed.max(0)).unwrap_or(0));
        }
    }
}

/// Opaque key/value payload handed over by the task originator.
///
/// Well-known fields are typed; everything else rides in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent_params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipe: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qty: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pos: Option<Position>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A unit of work driven by the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub kind: TaskKind,
    pub source: TaskSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// Scheduling weight in [0,1]
    pub priority: f64,
    /// Urgency weight in [0,1]
    pub urgency: f64,
    /// Completion fraction in [0,1]
    pub progress: f64,
    pub status: TaskStatus,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub parameters: TaskParameters,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

impl Task {
    pub fn new(title: impl Into<String>, kind: TaskKind, source: TaskSource) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            description: String::new(),
            kind,
            source,
            category: None,
            priority: 0.5,
            urgency: 0.5,
            progress: 0.0,
            status: TaskStatus::Pending,
            steps: Vec::new(),
            parameters: TaskParameters::default(),
            metadata: TaskMetadata::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority.clamp(0.0, 1.0);
        self
    }

    pub fn with_steps(mut self, steps: Vec<Step>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_parameters(mut self, parameters: TaskParameters) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn can_transition_to(&self, new_status: TaskStatus) -> bool {
        self.status.can_transition_to(new_status)
    }

    /// Transition to a new status, updating lifecycle timestamps.
    pub fn transition_to(&mut self, new_status: TaskStatus) -> Result<(), String> {
        if !self.can_transition_to(new_status) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.status.as_str(),
                new_status.as_str()
            ));
        }
        self.apply_status(new_status);
        Ok(())
    }

    /// Force a status, bypassing the state machine. Recovery paths only;
    /// every call site shows up in logs.
    pub fn force_status(&mut self, new_status: TaskStatus, reason: &str) {
        tracing::warn!(
            task_id = %self.id,
            from = %self.status.as_str(),
            to = %new_status.as_str(),
            reason,
            "Forcing task status transition"
        );
        self.apply_status(new_status);
    }

    fn apply_status(&mut self, new_status: TaskStatus) {
        self.status = new_status;
        let now = Utc::now();
        self.metadata.updated_at = now;
        match new_status {
            TaskStatus::Active => {
                if self.metadata.started_at.is_none() {
                    self.metadata.started_at = Some(now);
                }
            }
            TaskStatus::Completed | TaskStatus::Failed => {
                self.metadata.completed_at = Some(now);
            }
            _ => {}
        }
    }

    /// Set a blocked reason, backfilling `blocked_at`.
    pub fn set_blocked(&mut self, reason: impl Into<String>) {
        self.metadata.blocked_reason = Some(reason.into());
        self.metadata.blocked_at = Some(Utc::now());
        self.metadata.updated_at = Utc::now();
    }

    /// Clear the blocked reason and its timestamp.
    pub fn clear_blocked(&mut self) {
        self.metadata.blocked_reason = None;
        self.metadata.blocked_at = None;
        self.metadata.updated_at = Utc::now();
    }

    /// Whether any step in the plan is dispatchable.
    pub fn has_executable_plan(&self) -> bool {
        self.steps.iter().any(Step::is_executable)
    }

    /// Next not-done executable step, in plan order.
    pub fn next_executable_step(&self) -> Option<&Step> {
        self.steps.iter().filter(|s| !s.done).find(|s| s.is_executable())
    }

    /// Whether the plan is a single blocked sentinel.
    pub fn has_blocked_sentinel(&self) -> bool {
        self.steps.len() == 1 && self.steps[0].meta.blocked
    }

    /// Whether every step in the plan is done.
    pub fn all_steps_done(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.done)
    }
}

/// Normalize a priority or urgency input to [0,1].
///
/// String labels map `low`/`medium`/`high` to 0.3/0.5/0.8; numbers are
/// clamped; anything else falls back to 0.5.
pub fn normalize_weight(input: Option<&serde_json::Value>) -> f64 {
    match input {
        Some(serde_json::Value::String(label)) => match label.to_lowercase().as_str() {
            "low" => 0.3,
            "high" => 0.8,
            _ => 0.5,
        },
        Some(serde_json::Value::Number(n)) => n.as_f64().map_or(0.5, |v| v.clamp(0.0, 1.0)),
        _ => 0.5,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_roundtrip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Active,
            TaskStatus::PendingPlanning,
            TaskStatus::Paused,
            TaskStatus::Unplannable,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            assert_eq!(TaskStatus::from_str(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Paused.is_terminal());
        assert!(!TaskStatus::Unplannable.is_terminal());
    }

    #[test]
    fn test_transition_timestamps() {
        let mut task = Task::new("mine stone", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        assert!(task.metadata.started_at.is_none());

        task.transition_to(TaskStatus::Active).unwrap();
        assert!(task.metadata.started_at.is_some());

        task.transition_to(TaskStatus::Completed).unwrap();
        assert!(task.metadata.completed_at.is_some());
        assert!(task.is_terminal());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut task = Task::new("t", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        task.transition_to(TaskStatus::Failed).unwrap();
        assert!(task.transition_to(TaskStatus::Pending).is_err());
        assert!(task.transition_to(TaskStatus::Active).is_err());
    }

    #[test]
    fn test_unplannable_replan_path() {
        let mut task = Task::new("build", TaskKind::new(TaskKind::BUILDING), TaskSource::Goal);
        task.transition_to(TaskStatus::Unplannable).unwrap();
        // Replan success returns the task to the queue
        task.transition_to(TaskStatus::Pending).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[test]
    fn test_blocked_reason_sets_blocked_at() {
        let mut task = Task::new("t", TaskKind::new(TaskKind::CRAFTING), TaskSource::Manual);
        task.set_blocked("waiting_on_prereq");
        assert!(task.metadata.blocked_at.is_some());
        task.clear_blocked();
        assert!(task.metadata.blocked_reason.is_none());
        assert!(task.metadata.blocked_at.is_none());
    }

    #[test]
    fn test_next_executable_step_skips_done() {
        let mut s1 = Step::leaf("dig", 0, "acquire_material");
        s1.done = true;
        let s2 = Step::leaf("craft", 1, "craft_recipe");
        let task = Task::new("t", TaskKind::new(TaskKind::CRAFTING), TaskSource::Manual)
            .with_steps(vec![s1, s2]);
        assert_eq!(task.next_executable_step().unwrap().label, "craft");
    }

    #[test]
    fn test_blocked_sentinel_detection() {
        let task = Task::new("t", TaskKind::new(TaskKind::BUILDING), TaskSource::Goal)
            .with_steps(vec![Step::blocked_sentinel("solver unavailable")]);
        assert!(task.has_blocked_sentinel());
        assert!(!task.has_executable_plan());
    }

    #[test]
    fn test_normalize_weight() {
        use serde_json::json;
        assert!((normalize_weight(Some(&json!("low"))) - 0.3).abs() < f64::EPSILON);
        assert!((normalize_weight(Some(&json!("medium"))) - 0.5).abs() < f64::EPSILON);
        assert!((normalize_weight(Some(&json!("high"))) - 0.8).abs() < f64::EPSILON);
        assert!((normalize_weight(Some(&json!(1.7))) - 1.0).abs() < f64::EPSILON);
        assert!((normalize_weight(Some(&json!(-0.2))) - 0.0).abs() < f64::EPSILON);
        assert!((normalize_weight(Some(&json!(0.65))) - 0.65).abs() < f64::EPSILON);
        assert!((normalize_weight(None) - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_step_duration_recorded() {
        let mut step = Step::leaf("move", 0, "move_to");
        step.start();
        step.complete();
        assert!(step.done);
        assert!(step.actual_duration_ms.is_some());
    }
}
