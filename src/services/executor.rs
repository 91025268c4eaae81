//! Autonomous executor loop.
//!
//! A periodic, reentrancy-guarded cycle: threat holds, eligibility
//! filtering, task selection, step dispatch with snapshot/verify
//! contracts, deterministic-failure fast path, retry policy with the
//! Sterling repair gate, and prerequisite injection. Shadow mode
//! observes everything and dispatches nothing.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde_json::Value;
use tokio::sync::{watch, Mutex, RwLock};

use crate::adapters::cache::CachedInventory;
use crate::domain::errors::DomainResult;
use crate::domain::models::action::{ActionRequest, ActionResponse, ExecutorMode, FailureCode};
use crate::domain::models::config::{BudgetConfig, ExecutorConfig};
use crate::domain::models::metadata::{ExecutionBudgetState, RigGReplan};
use crate::domain::models::requirement::{Requirement, RequirementKind};
use crate::domain::models::task::{Task, TaskId, TaskKind, TaskSource, TaskStatus};
use crate::domain::models::verification::{StepSnapshot, VerificationStatus};
use crate::domain::models::world::InventoryItem;
use crate::domain::ports::BotInterface;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::event_bus::{EventPayload, IdleReason};
use crate::services::prereq_injector::{InjectionOutcome, PrereqInjector, WAITING_ON_PREREQ};
use crate::services::rate_limiter::StepRateLimiter;
use crate::services::step_execution::{
    is_building_leaf, mcp_fallback, step_to_leaf_execution, validate_leaf_args, LeafExecution,
    StepMappingError,
};
use crate::services::sterling_planner::{advise_execution, steps_digest, PlanOutcome};
use crate::services::task_service::{MutationOrigin, NewTaskRequest, TaskService};
use crate::services::threat_bridge::ThreatBridge;
use crate::services::verification::VerificationEngine;

/// Statuses the executor will pick work from.
const ELIGIBLE_STATUSES: &[TaskStatus] = &[TaskStatus::Pending, TaskStatus::Active];

/// Verification failures before a step is force-completed.
const VERIFY_BACKOFF_BASE_MS: i64 = 5_000;
const VERIFY_BACKOFF_CAP_MS: i64 = 30_000;

/// Sterling repair attempts before a retry-exhausted task fails.
const MAX_REPAIR_ATTEMPTS: u32 = 2;

/// Rig G replan schedule: attempts 1..=3 with delays 5s/15s/45s.
const RIG_G_MAX_ATTEMPTS: u32 = 3;
const RIG_G_BASE_DELAY_MS: u64 = 5_000;

/// Cycles between status log lines.
const STATUS_LOG_EVERY_CYCLES: u64 = 30;

/// What one cycle did; returned for observability and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A previous tick is still running.
    ReentrySkipped,
    /// The infra circuit breaker is open.
    BreakerOpen,
    /// Nothing eligible; the reason classifies the whole active set.
    Idle(IdleReason),
    /// A cognitive reflection was converted to subtasks.
    ReflectionConverted { task_id: TaskId, spawned: usize },
    /// A prerequisite subtask was injected; the parent is blocked.
    PrereqInjected { task_id: TaskId },
    /// Inventory progress satisfied the requirement; task completed.
    ProgressCompleted { task_id: TaskId },
    /// A step was dispatched and its verification resolved.
    StepDispatched {
        task_id: TaskId,
        step_id: String,
        verification: VerificationStatus,
    },
    /// Shadow mode observed the intended step without dispatching.
    ShadowObserved { task_id: TaskId },
    /// The rate limiter had no capacity this cycle.
    RateLimited,
    /// The selected task became blocked this cycle.
    Blocked { task_id: TaskId, reason: String },
    /// The selected task failed this cycle.
    TaskFailed { task_id: TaskId, reason: String },
    /// The dispatch hit an infra failure; the task is untouched.
    InfraFailure { task_id: TaskId },
    /// A replan was installed and the task returned to the queue.
    Replanned { task_id: TaskId },
    /// The emergency stop is engaged.
    Stopped,
}

/// Aggregated executor counters, surfaced on the periodic status line.
#[derive(Debug, Default)]
pub struct ExecutorStats {
    cycles: AtomicU64,
    dispatched: AtomicU64,
    verified: AtomicU64,
    failures: AtomicU64,
    idle: AtomicU64,
}

/// Point-in-time copy of the executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStatsSnapshot {
    pub cycles: u64,
    pub dispatched: u64,
    pub verified: u64,
    pub failures: u64,
    pub idle: u64,
}

impl ExecutorStats {
    fn record(&self, outcome: &CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        match outcome {
            CycleOutcome::StepDispatched { verification, .. } => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                if verification.allows_progress() {
                    self.verified.fetch_add(1, Ordering::Relaxed);
                } else {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                }
            }
            CycleOutcome::TaskFailed { .. } | CycleOutcome::InfraFailure { .. } => {
                self.failures.fetch_add(1, Ordering::Relaxed);
            }
            CycleOutcome::Idle(_) | CycleOutcome::BreakerOpen => {
                self.idle.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    fn snapshot(&self) -> ExecutorStatsSnapshot {
        ExecutorStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            verified: self.verified.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            idle: self.idle.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide emergency stop control.
#[derive(Clone)]
pub struct EmergencyStop {
    tx: Arc<watch::Sender<bool>>,
}

impl EmergencyStop {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn engage(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_engaged(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Wiring for the executor.
pub struct ExecutorDeps {
    pub service: Arc<TaskService>,
    pub bot: Arc<dyn BotInterface>,
    pub verification: VerificationEngine,
    pub prereq: PrereqInjector,
    pub threat: ThreatBridge,
    pub breaker: CircuitBreaker,
    pub executor_config: ExecutorConfig,
    pub budget_config: BudgetConfig,
    pub stop_rx: watch::Receiver<bool>,
}

pub struct Executor {
    self_ref: Weak<Executor>,
    service: Arc<TaskService>,
    bot: Arc<dyn BotInterface>,
    verification: VerificationEngine,
    prereq: PrereqInjector,
    threat: ThreatBridge,
    breaker: Mutex<CircuitBreaker>,
    limiter: StepRateLimiter,
    inventory: CachedInventory,
    mode: RwLock<ExecutorMode>,
    snapshots: Mutex<HashMap<(TaskId, String), StepSnapshot>>,
    tick_in_flight: AtomicBool,
    last_idle_event: Mutex<Option<DateTime<Utc>>>,
    last_budget_event: Mutex<Option<DateTime<Utc>>>,
    stats: ExecutorStats,
    config: ExecutorConfig,
    budget_config: BudgetConfig,
    stop_rx: watch::Receiver<bool>,
}

impl Executor {
    pub fn new(deps: ExecutorDeps) -> Arc<Self> {
        let limiter = StepRateLimiter::new(deps.executor_config.max_steps_per_minute);
        let inventory = CachedInventory::new(deps.bot.clone());
        let mode = deps.executor_config.mode;
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            service: deps.service,
            bot: deps.bot,
            verification: deps.verification,
            prereq: deps.prereq,
            threat: deps.threat,
            breaker: Mutex::new(deps.breaker),
            limiter,
            inventory,
            mode: RwLock::new(mode),
            snapshots: Mutex::new(HashMap::new()),
            tick_in_flight: AtomicBool::new(false),
            last_idle_event: Mutex::new(None),
            last_budget_event: Mutex::new(None),
            stats: ExecutorStats::default(),
            config: deps.executor_config,
            budget_config: deps.budget_config,
            stop_rx: deps.stop_rx,
        })
    }

    pub async fn mode(&self) -> ExecutorMode {
        *self.mode.read().await
    }

    /// Flip shadow/live at runtime.
    pub async fn set_mode(&self, mode: ExecutorMode) {
        let mut current = self.mode.write().await;
        if *current != mode {
            tracing::info!(from = current.as_str(), to = mode.as_str(), "Executor mode switched");
            *current = mode;
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Current aggregated counters.
    pub fn stats(&self) -> ExecutorStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run the periodic loop until the emergency stop engages.
    pub async fn run(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let starting_mode = self.mode().await;
        tracing::info!(
            poll_ms = self.config.poll_ms,
            mode = starting_mode.as_str(),
            "Executor loop starting"
        );
        loop {
            if *stop_rx.borrow() {
                break;
            }
            let outcome = self.run_cycle().await;
            tracing::debug!(?outcome, "Executor cycle finished");

            let stats = self.stats();
            if stats.cycles > 0 && stats.cycles % STATUS_LOG_EVERY_CYCLES == 0 {
                let status_mode = self.mode().await;
                tracing::info!(
                    cycles = stats.cycles,
                    dispatched = stats.dispatched,
                    verified = stats.verified,
                    failures = stats.failures,
                    idle = stats.idle,
                    mode = status_mode.as_str(),
                    "Executor status"
                );
            }

            let sleep_ms = self.jittered_poll_ms();
            tokio::select! {
                _ = tokio::time::sleep(std::time::Duration::from_millis(sleep_ms)) => {}
                _ = stop_rx.changed() => {}
            }
        }
        self.service
            .publish_and_persist(EventPayload::EmergencyStopEngaged);
        tracing::info!("Executor loop stopped");
    }

    /// Deterministic sub-period jitter derived from the clock.
    fn jittered_poll_ms(&self) -> u64 {
        let base = self.config.poll_ms.max(10);
        let spread = (base / 10).max(1);
        let offset = u64::from(Utc::now().timestamp_subsec_millis()) % (2 * spread);
        base - spread + offset
    }

    // ==================================================================
    // One cycle
    // ==================================================================

    /// Execute one scheduler cycle.
    pub async fn run_cycle(&self) -> CycleOutcome {
        if self.is_stopped() {
            return CycleOutcome::Stopped;
        }

        // 1. Reentrancy guard: one tick in flight at a time.
        if self
            .tick_in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return CycleOutcome::ReentrySkipped;
        }
        let outcome = self.run_cycle_inner().await;
        self.tick_in_flight.store(false, Ordering::SeqCst);
        self.stats.record(&outcome);
        outcome
    }

    async fn run_cycle_inner(&self) -> CycleOutcome {
        let now = Utc::now();

        // 2. Circuit breaker.
        if !self.breaker.lock().await.allows(now) {
            self.maybe_emit_idle(IdleReason::CircuitBreakerOpen, 0, 0).await;
            return CycleOutcome::BreakerOpen;
        }

        // 3. Threat-hold bridge (may mutate tasks).
        self.threat.evaluate(&self.service).await;

        // 4. Re-fetch after the bridge.
        let mut tasks = self.service.non_terminal_tasks().await;

        // 5. Shadow auto-unblock on live switch.
        if self.mode().await.is_live() {
            self.unblock_shadow_tasks(&tasks).await;
            tasks = self.service.non_terminal_tasks().await;
        }

        // 6. Blocked-TTL auto-fail.
        self.auto_fail_expired(&tasks, now).await;
        let tasks = self.service.non_terminal_tasks().await;

        // 7. Eligibility filter.
        let eligible: Vec<&Task> = tasks
            .iter()
            .filter(|t| ELIGIBLE_STATUSES.contains(&t.status))
            .filter(|t| t.metadata.blocked_reason.is_none())
            .filter(|t| t.metadata.next_eligible_at.is_none_or(|at| at <= now))
            .collect();

        // 8. Idle classification over the full active set.
        if eligible.is_empty() {
            let reason = classify_idle(&tasks, now);
            self.maybe_emit_idle(reason, tasks.len(), 0).await;
            return CycleOutcome::Idle(reason);
        }

        // 9. Selection: highest priority, oldest first.
        let selected = eligible
            .iter()
            .max_by(|a, b| {
                a.priority
                    .partial_cmp(&b.priority)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.metadata.created_at.cmp(&a.metadata.created_at))
            })
            .copied()
            .cloned();
        let Some(task) = selected else {
            return CycleOutcome::Idle(IdleReason::NoTasks);
        };

        self.drive_task(task, now).await
    }

    async fn drive_task(&self, task: Task, now: DateTime<Utc>) -> CycleOutcome {
        // 10. Cognitive-reflection short-circuit.
        if task.kind.is_cognitive_reflection() {
            return self.handle_reflection(&task).await;
        }

        // 11. Crafting-table prerequisite evaluation.
        if task.kind.is_crafting() {
            if let Some(outcome) = self.ensure_crafting_prereqs(&task).await {
                return outcome;
            }
        }

        // 12. Inventory-based progress.
        if let Some(outcome) = self.apply_inventory_progress(&task).await {
            return outcome;
        }

        // 13.–17. Executable-plan path.
        let mcp_only = self.config.mcp_only;
        if !mcp_only {
            if let Some(step) = task.next_executable_step().cloned() {
                return self.drive_step(&task, &step, now).await;
            }
        }

        // 18. MCP fallback for plan-less tasks.
        if let Some(execution) = mcp_fallback(&task.kind, &task.parameters) {
            return self
                .dispatch_execution(&task, "mcp-fallback", execution, now, true)
                .await;
        }

        // Nothing dispatchable: block so the TTL policy can reap it.
        let _ = self
            .service
            .mutate_task(task.id, |t| t.set_blocked("no-executable-plan"))
            .await;
        CycleOutcome::Blocked {
            task_id: task.id,
            reason: "no-executable-plan".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Step 5/6 helpers
    // ------------------------------------------------------------------

    async fn unblock_shadow_tasks(&self, tasks: &[Task]) {
        for task in tasks
            .iter()
            .filter(|t| t.metadata.blocked_reason.as_deref() == Some("shadow_mode"))
        {
            tracing::info!(task_id = %task.id, "Live mode active; clearing shadow block");
            let _ = self
                .service
                .mutate_task(task.id, |t| {
                    // Observation count survives the unblock.
                    t.clear_blocked();
                })
                .await;
        }
    }

    async fn auto_fail_expired(&self, tasks: &[Task], now: DateTime<Utc>) {
        for task in tasks {
            let Some(reason) = task.metadata.blocked_reason.as_deref() else {
                continue;
            };
            let Some(ttl_ms) = self.blocked_ttl_for(reason) else {
                continue;
            };
            let Some(blocked_at) = task.metadata.blocked_at else {
                continue;
            };
            if now - blocked_at < ChronoDuration::milliseconds(ttl_ms) {
                continue;
            }
            let fail_reason = format!("blocked_ttl_expired:{reason}");
            tracing::warn!(task_id = %task.id, reason, "Blocked TTL expired; failing task");
            let _ = self
                .service
                .mutate_task(task.id, |t| {
                    t.metadata.fail_reason = Some(fail_reason.clone());
                })
                .await;
            let _ = self
                .service
                .update_status(task.id, TaskStatus::Failed, MutationOrigin::Runtime)
                .await;
        }
    }

    /// Per-reason TTL; `None` is exempt from auto-fail.
    fn blocked_ttl_for(&self, reason: &str) -> Option<i64> {
        match reason {
            // Operator-facing and solver-parked tasks wait indefinitely.
            "advisory_action" => None,
            r if r.starts_with("sterling_unavailable") => None,
            r if r.starts_with("rig_g_replan") => None,
            _ => Some(self.config.blocked_ttl_ms),
        }
    }

    // ------------------------------------------------------------------
    // Step 8: idle events
    // ------------------------------------------------------------------

    async fn maybe_emit_idle(&self, reason: IdleReason, active: usize, eligible: usize) {
        let mut last = self.last_idle_event.lock().await;
        let now = Utc::now();
        let throttle = ChronoDuration::milliseconds(self.config.idle_event_throttle_ms);
        if last.is_some_and(|at| now - at < throttle) {
            return;
        }
        *last = Some(now);
        self.service.publish_and_persist(EventPayload::IdlePeriod {
            reason,
            active_count: active,
            eligible_count: eligible,
        });
    }

    // ------------------------------------------------------------------
    // Step 10: cognitive reflection
    // ------------------------------------------------------------------

    /// Convert an actionable reflection into subtasks; otherwise keep it
    /// active so cognition can revisit it.
    async fn handle_reflection(&self, task: &Task) -> CycleOutcome {
        let actionable = task
            .parameters
            .extra
            .get("subTasks")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if actionable.is_empty() {
            if task.status == TaskStatus::Pending {
                let _ = self
                    .service
                    .update_status(task.id, TaskStatus::Active, MutationOrigin::Runtime)
                    .await;
            }
            return CycleOutcome::ReflectionConverted {
                task_id: task.id,
                spawned: 0,
            };
        }

        let mut spawned = 0;
        for entry in &actionable {
            let Some(title) = entry.get("title").and_then(Value::as_str) else {
                continue;
            };
            let kind = entry
                .get("kind")
                .and_then(Value::as_str)
                .unwrap_or(TaskKind::GATHERING);
            let mut request =
                NewTaskRequest::new(title, TaskKind::new(kind), TaskSource::Autonomous);
            request.description = format!("Spawned from reflection '{}'", task.title);
            if let Some(item) = entry.get("item").and_then(Value::as_str) {
                request.parameters.item = Some(item.to_string());
            }
            if let Some(count) = entry.get("count").and_then(Value::as_u64) {
                request.parameters.count = u32::try_from(count).ok();
            }
            request.metadata = serde_json::json!({
                "taskProvenance": "cognitive_reflection",
                "parentTaskId": task.id.to_string(),
            })
            .as_object()
            .cloned()
            .unwrap_or_default();

            if self.service.add_task(request).await.is_ok() {
                spawned += 1;
            }
        }

        if spawned > 0 {
            let _ = self
                .service
                .update_progress(task.id, 1.0, Some(TaskStatus::Completed))
                .await;
        }
        CycleOutcome::ReflectionConverted {
            task_id: task.id,
            spawned,
        }
    }

    // ------------------------------------------------------------------
    // Step 11: crafting-table prerequisites
    // ------------------------------------------------------------------

    async fn ensure_crafting_prereqs(&self, task: &Task) -> Option<CycleOutcome> {
        let recipe = task.parameters.recipe.clone()?;
        let requires_table = match self
            .prereq
            .solver_recipe_requires_table(&recipe)
            .await
        {
            Ok(requires) => requires,
            Err(_) => return None,
        };
        if !requires_table {
            return None;
        }

        let inventory = self.inventory.read().await.unwrap_or_default();
        if has_item(&inventory, "crafting_table") {
            return None;
        }

        // Nearby-world scan within 20 blocks.
        if let Ok(blocks) = self.bot.nearby_blocks(20).await {
            if blocks
                .iter()
                .any(|b| b.name.eq_ignore_ascii_case("crafting_table"))
            {
                tracing::debug!(task_id = %task.id, "Using existing crafting table nearby");
                return None;
            }
        }

        // Decide craft vs gather and inject.
        let can_craft_table = inventory
            .iter()
            .any(|item| item.name.contains("plank") || item.name.contains("log"));
        let outcome = if can_craft_table {
            self.prereq
                .inject_named(
                    &self.service,
                    task,
                    TaskKind::CRAFTING,
                    "crafting_table",
                    1,
                    "Craft a crafting table".to_string(),
                )
                .await
        } else {
            self.prereq
                .inject_named(
                    &self.service,
                    task,
                    TaskKind::GATHERING,
                    "oak_log",
                    1,
                    "Gather wood for a crafting table".to_string(),
                )
                .await
        };

        match outcome {
            Ok(InjectionOutcome::Injected { .. }) => Some(CycleOutcome::PrereqInjected {
                task_id: task.id,
            }),
            Ok(InjectionOutcome::Duplicate { .. }) => Some(CycleOutcome::Blocked {
                task_id: task.id,
                reason: WAITING_ON_PREREQ.to_string(),
            }),
            Ok(InjectionOutcome::CapExhausted | InjectionOutcome::NotNeeded) | Err(_) => None,
        }
    }

    // ------------------------------------------------------------------
    // Step 12: inventory-based progress
    // ------------------------------------------------------------------

    async fn apply_inventory_progress(&self, task: &Task) -> Option<CycleOutcome> {
        let requirement = resolve_requirement(task)?;
        let inventory = self.inventory.read().await.ok()?;

        let progress = requirement.progress(&inventory);
        if requirement.satisfied_by(&inventory) {
            // For craft requirements the pattern is the output item, so
            // satisfaction already implies the output is present.
            let _ = self
                .service
                .update_progress(task.id, 1.0, Some(TaskStatus::Completed))
                .await;
            return Some(CycleOutcome::ProgressCompleted { task_id: task.id });
        }
        if (progress - task.progress).abs() > f64::EPSILON {
            let _ = self.service.update_progress(task.id, progress, None).await;
        }
        None
    }

    // ------------------------------------------------------------------
    // Steps 13–17: the executable-plan path
    // ------------------------------------------------------------------

    async fn drive_step(
        &self,
        task: &Task,
        step: &crate::domain::models::task::Step,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        // Extraction + legacy normalization.
        let execution = match step_to_leaf_execution(step) {
            Ok(execution) => execution,
            Err(StepMappingError::UnknownLeaf(leaf)) => {
                return self.reject_unknown_leaf(task, &step.id, &leaf).await;
            }
            Err(StepMappingError::MappingFailure(detail)) => {
                return self
                    .fail_deterministic(task, FailureCode::new(FailureCode::MAPPING_FAILURE), &detail)
                    .await;
            }
        };

        // Per-leaf contract validation.
        if let Err(violation) = validate_leaf_args(&execution.leaf, &execution.args) {
            let reason = format!("invalid-args: {violation}");
            let _ = self
                .service
                .mutate_task(task.id, |t| t.set_blocked(reason.clone()))
                .await;
            return CycleOutcome::Blocked {
                task_id: task.id,
                reason,
            };
        }

        // Craft pre-check: missing inputs route through the injector.
        if execution.leaf == "craft_recipe" {
            if let Some(outcome) = self.precheck_craft_inputs(task, &execution).await {
                return outcome;
            }
        }

        self.dispatch_execution(task, &step.id, execution, now, false)
            .await
    }

    async fn reject_unknown_leaf(&self, task: &Task, step_id: &str, leaf: &str) -> CycleOutcome {
        let reason = format!("unknown-leaf:{leaf}");
        let step_id_owned = step_id.to_string();
        let leaf_owned = leaf.to_string();
        let _ = self
            .service
            .mutate_task(task.id, |t| {
                if let Some(step) = t.steps.iter_mut().find(|s| s.id == step_id_owned) {
                    step.meta.executable = false;
                }
                t.set_blocked(reason.clone());
            })
            .await;
        self.service
            .publish_and_persist(EventPayload::UnknownLeafRejected {
                task_id: task.id,
                step_id: step_id.to_string(),
                leaf: leaf_owned,
            });
        CycleOutcome::Blocked {
            task_id: task.id,
            reason,
        }
    }

    async fn precheck_craft_inputs(
        &self,
        task: &Task,
        execution: &LeafExecution,
    ) -> Option<CycleOutcome> {
        let recipe = execution.args.get("recipe").and_then(Value::as_str)?;
        let inventory = self.inventory.read().await.ok()?;
        match self
            .prereq
            .inject_for_craft(&self.service, task, recipe, &inventory)
            .await
        {
            Ok(InjectionOutcome::Injected { .. }) => Some(CycleOutcome::PrereqInjected {
                task_id: task.id,
            }),
            Ok(InjectionOutcome::Duplicate { .. }) => Some(CycleOutcome::Blocked {
                task_id: task.id,
                reason: WAITING_ON_PREREQ.to_string(),
            }),
            Ok(InjectionOutcome::CapExhausted | InjectionOutcome::NotNeeded) => None,
            Err(err) => {
                tracing::debug!(task_id = %task.id, error = %err, "Craft pre-check skipped");
                None
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn dispatch_execution(
        &self,
        task: &Task,
        step_id: &str,
        execution: LeafExecution,
        now: DateTime<Utc>,
        is_fallback: bool,
    ) -> CycleOutcome {
        let live = self.mode().await.is_live();

        // Shadow mode: observe, record, never dispatch, never consume.
        if !live {
            return self.observe_shadow(task, step_id, &execution).await;
        }

        // Rate limiter: bail before any side effects when empty.
        if self.limiter.available_tokens().await < 1.0 {
            return CycleOutcome::RateLimited;
        }

        // Building execution budget.
        if is_building_leaf(&execution.leaf) && !self.budget_config.disabled {
            if let Some(outcome) = self.enforce_budget(task, now).await {
                return outcome;
            }
        }

        // Rig G gate + baseline snapshot (start_task_step).
        match self.start_task_step(task, step_id, false).await {
            Ok(true) => {}
            Ok(false) => {
                return self.handle_rig_g_rejection(task).await;
            }
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "start_task_step failed");
                self.breaker.lock().await.record_failure(now);
                return CycleOutcome::InfraFailure { task_id: task.id };
            }
        }

        // Token consumed only after start_task_step succeeded.
        if !self.limiter.try_acquire().await {
            return CycleOutcome::RateLimited;
        }

        // Dispatch.
        let request = ActionRequest {
            action_type: execution.leaf.clone(),
            parameters: execution.args.clone(),
            timeout: task.parameters.timeout_ms,
        }
        .with_nav_scope(task.id);

        let mut stop_rx = self.stop_rx.clone();
        let response = tokio::select! {
            response = self.bot.execute_action(request) => response,
            _ = stop_rx.changed() => {
                tracing::warn!(task_id = %task.id, "Emergency stop during dispatch; abandoning step");
                return CycleOutcome::Stopped;
            }
        };

        let response = match response {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "Bot dispatch transport failure");
                self.breaker.lock().await.record_failure(now);
                return CycleOutcome::InfraFailure { task_id: task.id };
            }
        };

        if response.is_infra_failure() {
            self.breaker.lock().await.record_failure(now);
            return CycleOutcome::InfraFailure { task_id: task.id };
        }
        self.breaker.lock().await.record_success();

        if response.shadow_blocked {
            return self.observe_shadow(task, step_id, &execution).await;
        }

        if !response.ok {
            return self.handle_action_failure(task, &response, now).await;
        }

        // 14. Verification.
        self.verify_and_progress(task, step_id, &execution, is_fallback)
            .await
    }

    /// Shadow observation: record the intent, block on shadow_mode.
    async fn observe_shadow(
        &self,
        task: &Task,
        step_id: &str,
        execution: &LeafExecution,
    ) -> CycleOutcome {
        tracing::info!(
            task_id = %task.id,
            step_id,
            leaf = %execution.leaf,
            args = %execution.args,
            "Shadow mode: would dispatch leaf"
        );
        // Shadow evaluation of the feasibility gate emits events only.
        let _ = self.start_task_step(task, step_id, true).await;
        let count = self
            .service
            .mutate_task(task.id, |t| {
                t.metadata.shadow_observation_count += 1;
                t.set_blocked("shadow_mode");
                t.metadata.shadow_observation_count
            })
            .await
            .unwrap_or(0);
        self.service.publish_and_persist(EventPayload::ShadowMode {
            task_id: task.id,
            observation_count: count,
        });
        CycleOutcome::ShadowObserved { task_id: task.id }
    }

    /// Rig G gate + snapshot capture. Returns Ok(false) when the gate
    /// rejects execution. The dry-run path evaluates the same advice but
    /// never mutates.
    async fn start_task_step(
        &self,
        task: &Task,
        step_id: &str,
        dry_run: bool,
    ) -> DomainResult<bool> {
        if let Some(rig_g) = &task.metadata.solver.rig_g {
            if !task.metadata.solver.rig_g_checked {
                let advice = advise_execution(rig_g);
                if dry_run {
                    tracing::info!(
                        task_id = %task.id,
                        should_proceed = advice.should_proceed,
                        "Rig G shadow evaluation"
                    );
                } else {
                    self.service
                        .mutate_task(task.id, |t| t.metadata.solver.rig_g_checked = true)
                        .await?;
                    if !advice.should_proceed {
                        return Ok(false);
                    }
                }
            }
        }

        if dry_run {
            return Ok(true);
        }

        // Baseline snapshot, awaited so verification has it.
        let state = self.bot.state().await?;
        let inventory = self.bot.inventory().await.unwrap_or_default();
        let snapshot = StepSnapshot::capture(state.position, state.food, state.health, &inventory);
        self.snapshots
            .lock()
            .await
            .insert((task.id, step_id.to_string()), snapshot);

        // First step start activates the task.
        if task.status == TaskStatus::Pending {
            self.service
                .update_status(task.id, TaskStatus::Active, MutationOrigin::Runtime)
                .await?;
        }
        let step_id_owned = step_id.to_string();
        self.service
            .mutate_task(task.id, move |t| {
                if let Some(step) = t.steps.iter_mut().find(|s| s.id == step_id_owned) {
                    step.start();
                }
            })
            .await?;
        Ok(true)
    }

    async fn handle_rig_g_rejection(&self, task: &Task) -> CycleOutcome {
        tracing::warn!(task_id = %task.id, "Rig G gate rejected execution; scheduling replan");
        let _ = self
            .service
            .update_status(task.id, TaskStatus::Unplannable, MutationOrigin::Runtime)
            .await;
        self.schedule_rig_g_replan(task.id).await;
        CycleOutcome::Blocked {
            task_id: task.id,
            reason: "rig_g_rejected".to_string(),
        }
    }

    // ------------------------------------------------------------------
    // Rig G replan scheduling
    // ------------------------------------------------------------------

    /// Schedule the next replan attempt with exponential delay
    /// (5s, 15s, 45s). At exhaustion the task blocks permanently.
    pub fn schedule_rig_g_replan(
        &self,
        task_id: TaskId,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let Some(task) = self.service.get_task(task_id).await else {
                return;
            };
            let attempt = task
                .metadata
                .solver
                .rig_g_replan
                .as_ref()
                .map_or(0, |r| r.attempt)
                + 1;

            if attempt > RIG_G_MAX_ATTEMPTS {
                let reason = format!("rig_g_replan_exhausted: {RIG_G_MAX_ATTEMPTS} attempts");
                self.service
                    .publish_and_persist(EventPayload::RigGReplanExhausted {
                        task_id,
                        attempts: RIG_G_MAX_ATTEMPTS,
                    });
                let _ = self
                    .service
                    .mutate_task(task_id, |t| t.set_blocked(reason.clone()))
                    .await;
                return;
            }

            let delay_ms = RIG_G_BASE_DELAY_MS * 3_u64.pow(attempt - 1);
            let next_at = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);
            let _ = self
                .service
                .mutate_task(task_id, |t| {
                    let replan = t
                        .metadata
                        .solver
                        .rig_g_replan
                        .get_or_insert_with(RigGReplan::default);
                    replan.attempt = attempt;
                    replan.next_attempt_at = Some(next_at);
                })
                .await;
            self.service
                .publish_and_persist(EventPayload::RigGReplanScheduled {
                    task_id,
                    attempt,
                    delay_ms,
                });

            let Some(executor) = self.self_ref.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
                executor.execute_rig_g_replan(task_id).await;
            });
        })
    }

    /// Run one replan attempt: regenerate, compare digests, install or
    /// stop.
    pub async fn execute_rig_g_replan(&self, task_id: TaskId) {
        let Some(task) = self.service.get_task(task_id).await else {
            return;
        };
        if task.is_terminal() {
            return;
        }
        let previous_digest = task.metadata.solver.steps_digest.clone();

        let outcome = match self
            .service
            .planner()
            .regenerate_plan(&task, "rig_g_infeasible")
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(task_id = %task_id, error = %err, "Rig G replan generation failed");
                self.schedule_rig_g_replan(task_id).await;
                return;
            }
        };

        match outcome {
            PlanOutcome::Steps { steps, route } => {
                let new_digest = steps_digest(&steps);
                if previous_digest.as_deref() == Some(new_digest.as_str()) {
                    tracing::info!(
                        task_id = %task_id,
                        digest = %new_digest,
                        "Replan produced identical steps; stopping"
                    );
                    // Attempt count stays; the next trigger escalates.
                    self.schedule_rig_g_replan(task_id).await;
                    return;
                }
                let _ = self
                    .service
                    .mutate_task(task_id, move |t| {
                        t.steps = steps;
                        t.metadata.solver.steps_digest = Some(new_digest.clone());
                        t.metadata.solver.rig_g_checked = false;
                        t.clear_blocked();
                    })
                    .await;
                let _ = self
                    .service
                    .update_status(task_id, TaskStatus::Pending, MutationOrigin::Runtime)
                    .await;
                tracing::info!(task_id = %task_id, "Replan installed; task requeued");
            }
            PlanOutcome::Blocked { reason } => {
                tracing::warn!(task_id = %task_id, reason, "Replan blocked; rescheduling");
                self.schedule_rig_g_replan(task_id).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // Step 17: building execution budget
    // ------------------------------------------------------------------

    async fn enforce_budget(&self, task: &Task, now: DateTime<Utc>) -> Option<CycleOutcome> {
        let budget = task
            .metadata
            .solver
            .execution_budget
            .clone()
            .unwrap_or_default();

        let violation = if budget.attempts >= self.budget_config.max_attempts {
            Some(format!(
                "budget-exhausted:attempts>{}",
                self.budget_config.max_attempts
            ))
        } else if budget.first_attempt_at.is_some_and(|first| {
            now - first > ChronoDuration::milliseconds(self.budget_config.max_elapsed_ms)
        }) {
            Some(format!(
                "budget-exhausted:elapsed>{}ms",
                self.budget_config.max_elapsed_ms
            ))
        } else {
            None
        };

        if let Some(reason) = violation {
            let _ = self
                .service
                .mutate_task(task.id, |t| t.set_blocked(reason.clone()))
                .await;
            self.emit_budget_event(task.id, &reason).await;
            return Some(CycleOutcome::Blocked {
                task_id: task.id,
                reason,
            });
        }

        // Min-interval pacing defers without blocking.
        if let Some(last) = budget.last_attempt_at {
            let min_interval = ChronoDuration::milliseconds(self.budget_config.min_interval_ms);
            if now - last < min_interval {
                let next = last + min_interval;
                let _ = self
                    .service
                    .mutate_task(task.id, |t| t.metadata.next_eligible_at = Some(next))
                    .await;
                return Some(CycleOutcome::RateLimited);
            }
        }

        let _ = self
            .service
            .mutate_task(task.id, move |t| {
                let state = t
                    .metadata
                    .solver
                    .execution_budget
                    .get_or_insert_with(ExecutionBudgetState::default);
                state.attempts += 1;
                state.first_attempt_at.get_or_insert(now);
                state.last_attempt_at = Some(now);
            })
            .await;
        None
    }

    async fn emit_budget_event(&self, task_id: TaskId, reason: &str) {
        let mut last = self.last_budget_event.lock().await;
        let now = Utc::now();
        if last.is_some_and(|at| now - at < ChronoDuration::seconds(60)) {
            return;
        }
        *last = Some(now);
        self.service.publish_and_persist(EventPayload::ExecutorBudget {
            task_id,
            reason: reason.to_string(),
        });
    }

    // ------------------------------------------------------------------
    // Steps 14–16: verification, fast path, retry policy
    // ------------------------------------------------------------------

    async fn verify_and_progress(
        &self,
        task: &Task,
        step_id: &str,
        execution: &LeafExecution,
        is_fallback: bool,
    ) -> CycleOutcome {
        let baseline = self
            .snapshots
            .lock()
            .await
            .get(&(task.id, step_id.to_string()))
            .cloned();
        let Some(baseline) = baseline else {
            // No baseline means start_task_step was skipped; pass with a
            // skip rather than inventing a verification result.
            return self
                .complete_step(task, step_id, VerificationStatus::Skipped, is_fallback)
                .await;
        };

        let verification = self
            .verification
            .verify_step(task.id, step_id, &execution.leaf, &execution.args, &baseline)
            .await;

        match verification.status {
            VerificationStatus::Verified | VerificationStatus::Skipped => {
                self.snapshots
                    .lock()
                    .await
                    .remove(&(task.id, step_id.to_string()));
                self.complete_step(task, step_id, verification.status, is_fallback)
                    .await
            }
            VerificationStatus::Failed => self.handle_verify_failure(task, step_id).await,
        }
    }

    async fn handle_verify_failure(&self, task: &Task, step_id: &str) -> CycleOutcome {
        let fails = self
            .service
            .mutate_task(task.id, |t| {
                t.metadata.verify_fail_count += 1;
                t.metadata.verify_fail_count
            })
            .await
            .unwrap_or(1);

        if fails >= self.config.max_verify_fails {
            tracing::warn!(
                task_id = %task.id,
                step_id,
                fails,
                "Verification failed repeatedly; force-completing step"
            );
            return self
                .complete_step(task, step_id, VerificationStatus::Skipped, false)
                .await;
        }

        let backoff_ms = (VERIFY_BACKOFF_BASE_MS * i64::from(fails)).min(VERIFY_BACKOFF_CAP_MS);
        let next = Utc::now() + ChronoDuration::milliseconds(backoff_ms);
        let _ = self
            .service
            .mutate_task(task.id, |t| t.metadata.next_eligible_at = Some(next))
            .await;
        CycleOutcome::StepDispatched {
            task_id: task.id,
            step_id: step_id.to_string(),
            verification: VerificationStatus::Failed,
        }
    }

    async fn complete_step(
        &self,
        task: &Task,
        step_id: &str,
        status: VerificationStatus,
        is_fallback: bool,
    ) -> CycleOutcome {
        let step_id_owned = step_id.to_string();
        let all_done = self
            .service
            .mutate_task(task.id, move |t| {
                if let Some(step) = t.steps.iter_mut().find(|s| s.id == step_id_owned) {
                    step.complete();
                }
                t.metadata.verify_fail_count = 0;
                t.all_steps_done()
            })
            .await
            .unwrap_or(false);

        let finished = if is_fallback {
            // Fallback executions have no plan; a verified dispatch is
            // the whole task unless an inventory requirement gates it.
            resolve_requirement(task).is_none()
        } else {
            all_done && self.inventory_gate_satisfied(task).await
        };

        if finished {
            let _ = self
                .service
                .update_progress(task.id, 1.0, Some(TaskStatus::Completed))
                .await;
            self.clear_snapshots_for(task.id).await;
        } else if !is_fallback {
            let done = task.steps.iter().filter(|s| s.done).count() + 1;
            let total = task.steps.len().max(1);
            #[allow(clippy::cast_precision_loss)]
            let progress = (done as f64 / total as f64).clamp(0.0, 1.0);
            let _ = self.service.update_progress(task.id, progress, None).await;
        }

        CycleOutcome::StepDispatched {
            task_id: task.id,
            step_id: step_id.to_string(),
            verification: status,
        }
    }

    /// Final-completion gate: a task with an inventory requirement only
    /// completes when the requirement holds.
    async fn inventory_gate_satisfied(&self, task: &Task) -> bool {
        let Some(requirement) = resolve_requirement(task) else {
            return true;
        };
        match self.inventory.read().await {
            Ok(inventory) => requirement.satisfied_by(&inventory),
            Err(_) => false,
        }
    }

    /// Steps 15–16: deterministic fast path, then the retry policy with
    /// the Sterling repair gate.
    async fn handle_action_failure(
        &self,
        task: &Task,
        response: &ActionResponse,
        now: DateTime<Utc>,
    ) -> CycleOutcome {
        let error = response
            .error
            .clone()
            .unwrap_or_else(|| "action failed".to_string());

        // 15. Deterministic failures never retry.
        if let Some(code) = response
            .failure_code
            .as_ref()
            .filter(|code| code.is_deterministic())
        {
            return self.fail_deterministic(task, code.clone(), &error).await;
        }

        // 16. Exponential backoff, then the repair gate.
        let retry_count = self
            .service
            .mutate_task(task.id, |t| {
                t.metadata.retry_count += 1;
                t.metadata.retry_count
            })
            .await
            .unwrap_or(1);

        if retry_count < task.metadata.max_retries {
            let backoff_ms =
                (1_000_i64 * 2_i64.saturating_pow(retry_count)).min(self.config.max_backoff_ms as i64);
            let next = now + ChronoDuration::milliseconds(backoff_ms);
            let _ = self
                .service
                .mutate_task(task.id, |t| t.metadata.next_eligible_at = Some(next))
                .await;
            tracing::info!(
                task_id = %task.id,
                retry_count,
                backoff_ms,
                error,
                "Action failed; backing off"
            );
            return CycleOutcome::StepDispatched {
                task_id: task.id,
                step_id: String::new(),
                verification: VerificationStatus::Failed,
            };
        }

        // Repair gate: a genuinely different plan resets the retry loop.
        if self.attempt_repair(task, &error).await {
            return CycleOutcome::Replanned { task_id: task.id };
        }

        let _ = self
            .service
            .mutate_task(task.id, |t| {
                t.set_blocked("max-retries-exceeded");
                t.metadata.fail_reason = Some("max-retries-exceeded".to_string());
            })
            .await;
        let _ = self
            .service
            .update_status(task.id, TaskStatus::Failed, MutationOrigin::Runtime)
            .await;
        CycleOutcome::TaskFailed {
            task_id: task.id,
            reason: "max-retries-exceeded".to_string(),
        }
    }

    async fn attempt_repair(&self, task: &Task, failure_context: &str) -> bool {
        let attempts = task.metadata.solver.replan_attempts;
        if attempts >= MAX_REPAIR_ATTEMPTS {
            return false;
        }
        let _ = self
            .service
            .mutate_task(task.id, |t| t.metadata.solver.replan_attempts += 1)
            .await;

        let outcome = match self
            .service
            .planner()
            .regenerate_plan(task, failure_context)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "Repair replan failed");
                return false;
            }
        };

        let PlanOutcome::Steps { steps, route: _ } = outcome else {
            return false;
        };
        let new_digest = steps_digest(&steps);
        if task.metadata.solver.steps_digest.as_deref() == Some(new_digest.as_str()) {
            tracing::info!(task_id = %task.id, "Repair produced identical steps; no repair");
            return false;
        }

        let _ = self
            .service
            .mutate_task(task.id, move |t| {
                t.steps = steps;
                t.metadata.solver.steps_digest = Some(new_digest.clone());
                t.metadata.retry_count = 0;
                t.metadata.next_eligible_at = None;
            })
            .await;
        tracing::info!(task_id = %task.id, "Repair plan installed; retry loop reset");
        true
    }

    async fn fail_deterministic(
        &self,
        task: &Task,
        code: FailureCode,
        error: &str,
    ) -> CycleOutcome {
        let reason = format!("deterministic-failure:{code}");
        tracing::warn!(task_id = %task.id, %code, error, "Deterministic failure; failing immediately");
        // No retry increment, no backoff.
        let _ = self
            .service
            .mutate_task(task.id, |t| {
                t.set_blocked(reason.clone());
                t.metadata.failure_code = Some(code.clone());
                t.metadata.fail_reason = Some(reason.clone());
            })
            .await;
        let _ = self
            .service
            .update_status(task.id, TaskStatus::Failed, MutationOrigin::Runtime)
            .await;
        CycleOutcome::TaskFailed {
            task_id: task.id,
            reason,
        }
    }

    /// Drop verification snapshots for a terminal task.
    pub async fn clear_snapshots_for(&self, task_id: TaskId) {
        self.snapshots
            .lock()
            .await
            .retain(|(id, _), _| *id != task_id);
    }

    /// Check the shared secret guarding the emergency-stop surface.
    /// An unset token leaves the surface open (local deployments).
    pub fn emergency_stop_authorized(&self, provided: Option<&str>) -> bool {
        match &self.config.emergency_token {
            Some(expected) => provided == Some(expected.as_str()),
            None => true,
        }
    }
}

/// Classify why nothing is eligible, over the full active set.
fn classify_idle(tasks: &[Task], now: DateTime<Utc>) -> IdleReason {
    if tasks.is_empty() {
        return IdleReason::NoTasks;
    }
    let manual_paused = tasks.iter().filter(|t| {
        t.status == TaskStatus::Paused
            || t.metadata
                .goal_binding
                .as_ref()
                .and_then(|b| b.hold.as_ref())
                .is_some()
    });
    let blocked_on_prereq = tasks
        .iter()
        .filter(|t| t.metadata.blocked_reason.as_deref() == Some(WAITING_ON_PREREQ));
    let in_backoff = tasks
        .iter()
        .filter(|t| t.metadata.next_eligible_at.is_some_and(|at| at > now));

    let manual = manual_paused.count();
    let prereq = blocked_on_prereq.count();
    let backoff = in_backoff.count();

    if manual > 0 && manual >= prereq && manual >= backoff {
        IdleReason::ManualPause
    } else if prereq > 0 && prereq >= backoff {
        IdleReason::BlockedOnPrereq
    } else if backoff > 0 {
        IdleReason::AllInBackoff
    } else {
        // Everything active is blocked for other reasons; from the
        // scheduler's view there is no runnable work.
        IdleReason::NoTasks
    }
}

/// Requirement resolution: explicit metadata first, then a derivation
/// from the task's kind and parameters.
fn resolve_requirement(task: &Task) -> Option<Requirement> {
    if let Some(requirement) = &task.metadata.requirement {
        return Some(requirement.clone());
    }
    let quantity = task.parameters.count.or(task.parameters.qty).unwrap_or(1);
    match task.kind.as_str() {
        TaskKind::GATHERING => task
            .parameters
            .item
            .as_ref()
            .map(|item| Requirement::new(RequirementKind::Collect, item.clone(), quantity)),
        TaskKind::MINING => task
            .parameters
            .item
            .as_ref()
            .or(task.parameters.block_type.as_ref())
            .map(|item| Requirement::new(RequirementKind::Mine, item.clone(), quantity)),
        TaskKind::CRAFTING => task
            .parameters
            .recipe
            .as_ref()
            .map(|recipe| Requirement::new(RequirementKind::Craft, recipe.clone(), quantity)),
        _ => None,
    }
}

fn has_item(inventory: &[InventoryItem], name: &str) -> bool {
    inventory
        .iter()
        .any(|item| item.name.eq_ignore_ascii_case(name) && item.count > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_idle_empty() {
        assert_eq!(classify_idle(&[], Utc::now()), IdleReason::NoTasks);
    }

    #[test]
    fn test_classify_idle_backoff() {
        let mut task = Task::new("t", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        task.metadata.next_eligible_at = Some(Utc::now() + ChronoDuration::seconds(30));
        assert_eq!(classify_idle(&[task], Utc::now()), IdleReason::AllInBackoff);
    }

    #[test]
    fn test_classify_idle_prereq() {
        let mut task = Task::new("t", TaskKind::new(TaskKind::CRAFTING), TaskSource::Manual);
        task.set_blocked(WAITING_ON_PREREQ);
        assert_eq!(
            classify_idle(&[task], Utc::now()),
            IdleReason::BlockedOnPrereq
        );
    }

    #[test]
    fn test_classify_idle_manual_pause_wins() {
        let mut paused = Task::new("p", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        paused.force_status(TaskStatus::Paused, "test");
        let mut backoff = Task::new("b", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        backoff.metadata.next_eligible_at = Some(Utc::now() + ChronoDuration::seconds(30));
        assert_eq!(
            classify_idle(&[paused, backoff.clone()], Utc::now()),
            IdleReason::ManualPause
        );
        assert_eq!(classify_idle(&[backoff], Utc::now()), IdleReason::AllInBackoff);
    }

    #[test]
    fn test_stats_record_mapping() {
        let stats = ExecutorStats::default();
        let task_id = uuid::Uuid::new_v4();

        stats.record(&CycleOutcome::Idle(IdleReason::NoTasks));
        stats.record(&CycleOutcome::BreakerOpen);
        stats.record(&CycleOutcome::StepDispatched {
            task_id,
            step_id: "s1".into(),
            verification: VerificationStatus::Verified,
        });
        stats.record(&CycleOutcome::StepDispatched {
            task_id,
            step_id: "s1".into(),
            verification: VerificationStatus::Failed,
        });
        stats.record(&CycleOutcome::TaskFailed {
            task_id,
            reason: "max-retries-exceeded".into(),
        });
        stats.record(&CycleOutcome::ShadowObserved { task_id });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.cycles, 6);
        assert_eq!(snapshot.dispatched, 2);
        assert_eq!(snapshot.verified, 1);
        assert_eq!(snapshot.failures, 2);
        assert_eq!(snapshot.idle, 2);
    }

    #[test]
    fn test_stats_skipped_verification_counts_as_progress() {
        let stats = ExecutorStats::default();
        stats.record(&CycleOutcome::StepDispatched {
            task_id: uuid::Uuid::new_v4(),
            step_id: "s1".into(),
            verification: VerificationStatus::Skipped,
        });
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.verified, 1);
        assert_eq!(snapshot.failures, 0);
    }

    #[test]
    fn test_emergency_token_check() {
        use crate::domain::models::config::BreakerConfig;
        use crate::services::verification::VerificationEngine;
        use crate::services::{
            EventBus, EventStoreHandle, GoalBindingHooks, GoalResolver, PrereqInjector,
            ProtocolEffectsDrain, SterlingPlanner, TaskServiceDeps, ThreatBridge,
        };
        use std::sync::Arc;

        struct NullBot;
        #[async_trait::async_trait]
        impl crate::domain::ports::BotInterface for NullBot {
            async fn health(&self) -> DomainResult<crate::domain::models::world::BotHealth> {
                Ok(crate::domain::models::world::BotHealth::default())
            }
            async fn state(&self) -> DomainResult<crate::domain::models::world::BotState> {
                Ok(crate::domain::models::world::BotState::default())
            }
            async fn inventory(&self) -> DomainResult<Vec<InventoryItem>> {
                Ok(Vec::new())
            }
            async fn nearby_blocks(
                &self,
                _radius: u32,
            ) -> DomainResult<Vec<crate::domain::models::world::NearbyBlock>> {
                Ok(Vec::new())
            }
            async fn world_scan(
                &self,
                _bounds: crate::domain::models::world::ScanBounds,
            ) -> DomainResult<crate::domain::models::world::OccupancyGrid> {
                Ok(crate::domain::models::world::OccupancyGrid {
                    dims: (0, 0, 0),
                    cells: Vec::new(),
                })
            }
            async fn execute_action(
                &self,
                _request: ActionRequest,
            ) -> DomainResult<ActionResponse> {
                Ok(ActionResponse::executed())
            }
        }

        struct NullSolver;
        #[async_trait::async_trait]
        impl crate::domain::ports::SterlingSolver for NullSolver {
            async fn generate_plan(
                &self,
                _request: &crate::domain::ports::PlanRequest,
            ) -> DomainResult<crate::domain::ports::PlanResponse> {
                Ok(crate::domain::ports::PlanResponse::default())
            }
            async fn introspect_recipe(
                &self,
                _item: &str,
            ) -> DomainResult<Option<crate::domain::ports::RecipeInfo>> {
                Ok(None)
            }
            async fn solve_navigation(
                &self,
                _request: &crate::domain::ports::NavigationRequest,
            ) -> DomainResult<crate::domain::ports::PlanResponse> {
                Ok(crate::domain::ports::PlanResponse::default())
            }
            async fn report_episode(
                &self,
                _report: &crate::domain::ports::EpisodeReport,
            ) -> DomainResult<crate::domain::ports::EpisodeAck> {
                Ok(crate::domain::ports::EpisodeAck::default())
            }
            async fn health(&self) -> DomainResult<bool> {
                Ok(true)
            }
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let _guard = runtime.enter();

        let bot: Arc<dyn crate::domain::ports::BotInterface> = Arc::new(NullBot);
        let solver: Arc<dyn crate::domain::ports::SterlingSolver> = Arc::new(NullSolver);
        let bus = EventBus::default();
        let store = Arc::new(tokio::sync::RwLock::new(
            crate::services::task_store::TaskStore::new(),
        ));
        let (drain_tx, _drain_rx) = ProtocolEffectsDrain::channel();
        let service = TaskService::new(TaskServiceDeps {
            store: store.clone(),
            bus: bus.clone(),
            planner: Arc::new(SterlingPlanner::new(solver.clone())),
            resolver: Arc::new(GoalResolver::new(store, bus)),
            hooks: GoalBindingHooks::new(false),
            drain_tx,
            event_store: EventStoreHandle::disabled(),
            dashboard: None,
            bot: None,
            goal_resolver_enabled: false,
            strict_finalize: false,
        });
        let (_stop, stop_rx) = EmergencyStop::new();
        let executor = Executor::new(ExecutorDeps {
            service,
            bot: bot.clone(),
            verification: VerificationEngine::new(
                bot.clone(),
                crate::domain::models::config::VerificationConfig::default(),
            ),
            prereq: PrereqInjector::new(solver),
            threat: ThreatBridge::new(bot),
            breaker: CircuitBreaker::new(BreakerConfig::default()),
            executor_config: ExecutorConfig {
                emergency_token: Some("secret".into()),
                ..Default::default()
            },
            budget_config: BudgetConfig::default(),
            stop_rx,
        });

        assert!(executor.emergency_stop_authorized(Some("secret")));
        assert!(!executor.emergency_stop_authorized(Some("wrong")));
        assert!(!executor.emergency_stop_authorized(None));
    }

    #[test]
    fn test_resolve_requirement_derivation() {
        let mut task = Task::new("gather", TaskKind::new(TaskKind::GATHERING), TaskSource::Manual);
        task.parameters.item = Some("oak_log".into());
        task.parameters.count = Some(4);
        let requirement = resolve_requirement(&task).unwrap();
        assert_eq!(requirement.kind, RequirementKind::Collect);
        assert_eq!(requirement.quantity, 4);

        let mut craft = Task::new("craft", TaskKind::new(TaskKind::CRAFTING), TaskSource::Manual);
        craft.parameters.recipe = Some("stick".into());
        assert_eq!(resolve_requirement(&craft).unwrap().kind, RequirementKind::Craft);

        let reflection = Task::new(
            "reflect",
            TaskKind::new(TaskKind::COGNITIVE_REFLECTION),
            TaskSource::Cognition,
        );
        assert!(resolve_requirement(&reflection).is_none());
    }
}
