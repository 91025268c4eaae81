//! Task service: creation pipeline, finalizer, and guarded mutations.
//!
//! Every task enters through [`TaskService::add_task`] and every
//! creation path funnels into one finalizer. Status changes run the
//! goal-binding hook before persist, apply self-holds in-memory, and
//! schedule the remaining protocol effects on the serial drain.

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use chrono::Utc;
use tokio::sync::{mpsc, RwLock};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::goal::{Hold, SyncEffect};
use crate::domain::models::metadata::{project_incoming_metadata, MetadataPatch, SolverMeta};
use crate::domain::models::origin::infer_task_origin;
use crate::domain::models::task::{
    normalize_weight, Step, Task, TaskId, TaskKind, TaskSource, TaskStatus,
};
use crate::domain::ports::{BotInterface, DashboardSink, TaskUpdate};
use crate::services::event_bus::{EventBus, EventPayload};
use crate::services::event_store::EventStoreHandle;
use crate::services::goal_binding::{partition_effects, GoalBindingHooks};
use crate::services::goal_resolver::{GoalResolver, ResolveRequest, ResolverDecision};
use crate::services::protocol_drain::EffectBatch;
use crate::services::sterling_planner::{steps_digest, PlanOutcome, SterlingPlanner};
use crate::services::task_store::{Reservation, TaskFilter, TaskStore};

/// Kinds routed through the goal resolver when goal-sourced.
pub const GOAL_RESOLVER_GATED_KINDS: &[&str] = &[TaskKind::BUILDING];

/// Namespace prefix for sterling IR dedupe keys.
pub const STERLING_DEDUPE_NAMESPACE: &str = "sterling_ir";

/// Priority at and above which a high-priority event fires.
const HIGH_PRIORITY_THRESHOLD: f64 = 0.8;

/// Who is performing a mutation; decides whether lifecycle hooks run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOrigin {
    /// Executor / creation pipeline; hooks run.
    Runtime,
    /// Drain-applied protocol effect; hooks must not re-run.
    Protocol,
    /// Operator management action; holds are preconditioned by the
    /// handler itself, hooks do not run.
    Management,
}

/// Public action result of goal resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveAction {
    Continue,
    AlreadySatisfied,
    Created,
}

/// Incoming task creation request.
#[derive(Debug, Clone)]
pub struct NewTaskRequest {
    pub title: String,
    pub kind: TaskKind,
    pub source: TaskSource,
    pub category: Option<String>,
    pub description: String,
    pub priority: Option<serde_json::Value>,
    pub urgency: Option<serde_json::Value>,
    pub parameters: crate::domain::models::task::TaskParameters,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// Caller-provided plan; skips solver plan generation when present.
    pub steps: Option<Vec<Step>>,
}

impl NewTaskRequest {
    pub fn new(title: impl Into<String>, kind: TaskKind, source: TaskSource) -> Self {
        Self {
            title: title.into(),
            kind,
            source,
            category: None,
            description: String::new(),
            priority: None,
            urgency: None,
            parameters: crate::domain::models::task::TaskParameters::default(),
            metadata: serde_json::Map::new(),
            steps: None,
        }
    }
}

/// Wiring for a task service.
pub struct TaskServiceDeps {
    pub store: Arc<RwLock<TaskStore>>,
    pub bus: EventBus,
    pub planner: Arc<SterlingPlanner>,
    pub resolver: Arc<GoalResolver>,
    pub hooks: GoalBindingHooks,
    pub drain_tx: mpsc::Sender<EffectBatch>,
    pub event_store: EventStoreHandle,
    pub dashboard: Option<Arc<dyn DashboardSink>>,
    pub bot: Option<Arc<dyn BotInterface>>,
    pub goal_resolver_enabled: bool,
    pub strict_finalize: bool,
}

pub struct TaskService {
    self_ref: Weak<TaskService>,
    store: Arc<RwLock<TaskStore>>,
    bus: EventBus,
    planner: Arc<SterlingPlanner>,
    resolver: Arc<GoalResolver>,
    hooks: GoalBindingHooks,
    drain_tx: mpsc::Sender<EffectBatch>,
    event_store: EventStoreHandle,
    dashboard: Option<Arc<dyn DashboardSink>>,
    bot: Option<Arc<dyn BotInterface>>,
    goal_resolver_enabled: bool,
    strict_finalize: bool,
    warned_metadata_keys: StdMutex<HashSet<String>>,
}

impl TaskService {
    pub fn new(deps: TaskServiceDeps) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            store: deps.store,
            bus: deps.bus,
            planner: deps.planner,
            resolver: deps.resolver,
            hooks: deps.hooks,
            drain_tx: deps.drain_tx,
            event_store: deps.event_store,
            dashboard: deps.dashboard,
            bot: deps.bot,
            goal_resolver_enabled: deps.goal_resolver_enabled,
            strict_finalize: deps.strict_finalize,
            warned_metadata_keys: StdMutex::new(HashSet::new()),
        })
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> Arc<RwLock<TaskStore>> {
        self.store.clone()
    }

    pub fn planner(&self) -> Arc<SterlingPlanner> {
        self.planner.clone()
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub async fn get_task(&self, id: TaskId) -> Option<Task> {
        self.store.read().await.get(&id).cloned()
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.store
            .read()
            .await
            .list(filter)
            .into_iter()
            .cloned()
            .collect()
    }

    pub async fn non_terminal_tasks(&self) -> Vec<Task> {
        self.store
            .read()
            .await
            .non_terminal()
            .into_iter()
            .cloned()
            .collect()
    }

    // ------------------------------------------------------------------
    // Creation pipeline
    // ------------------------------------------------------------------

    /// Add a task. Dedupe may return an existing id; the returned id is
    /// always live (or completed, for already-satisfied goals).
    pub async fn add_task(&self, request: NewTaskRequest) -> DomainResult<TaskId> {
        // 1. Goal-resolver gate for goal-sourced gated kinds.
        if request.source == TaskSource::Goal
            && GOAL_RESOLVER_GATED_KINDS.contains(&request.kind.as_str())
            && self.goal_resolver_enabled
        {
            let (_, task_id) = self.resolve_goal_internal(&request).await?;
            return Ok(task_id);
        }

        // 2. Sterling dedupe reservation.
        let sterling_key = self.sterling_dedupe_key(&request);
        if let Some(key) = &sterling_key {
            match self.store.write().await.reserve_sterling_key(key) {
                Reservation::Existing(id) => {
                    tracing::debug!(%id, key, "Sterling dedupe hit");
                    return Ok(id);
                }
                Reservation::Reserved => {}
            }
        }

        let result = self.create_task_reserved(&request).await;
        if result.is_err() {
            if let Some(key) = &sterling_key {
                self.store.write().await.release_sterling_key(key);
            }
        }
        result
    }

    async fn create_task_reserved(&self, request: &NewTaskRequest) -> DomainResult<TaskId> {
        // 3. Structural similarity dedupe.
        if let Some(existing) = self
            .store
            .read()
            .await
            .find_similar_pending(&request.kind, request.source, &request.title)
        {
            tracing::debug!(id = %existing.id, "Similarity dedupe hit");
            return Ok(existing.id);
        }

        let mut task = Task::new(request.title.clone(), request.kind.clone(), request.source);
        task.description.clone_from(&request.description);
        task.category.clone_from(&request.category);
        task.parameters = request.parameters.clone();
        if let Some(steps) = &request.steps {
            task.steps.clone_from(steps);
        }

        // 4. Plan generation.
        if request.steps.is_none() {
            self.populate_plan(&mut task).await;
        }

        // 5.–6. Metadata projection + weight normalization.
        self.project_metadata(&mut task, &request.metadata);
        task.priority = normalize_weight(request.priority.as_ref());
        task.urgency = normalize_weight(request.urgency.as_ref());

        // 7. Finalize.
        self.finalize_new_task(task, self.sterling_dedupe_key(request))
            .await
    }

    fn sterling_dedupe_key(&self, request: &NewTaskRequest) -> Option<String> {
        if !request.kind.is_sterling_ir() {
            return None;
        }
        request
            .metadata
            .get("sterling")
            .and_then(|s| s.get("committedIrDigest"))
            .and_then(|d| d.as_str())
            .map(|digest| format!("{STERLING_DEDUPE_NAMESPACE}:{digest}"))
    }

    /// Public goal resolution surface (POST /goal equivalent).
    pub async fn resolve_goal(
        &self,
        request: ResolveRequest,
    ) -> DomainResult<(ResolveAction, TaskId)> {
        match self.resolver.resolve_or_create(request).await? {
            ResolverDecision::Continue { task_id } => Ok((ResolveAction::Continue, task_id)),
            ResolverDecision::AlreadySatisfied { task_id } => {
                Ok((ResolveAction::AlreadySatisfied, task_id))
            }
            ResolverDecision::Skeleton { task } => {
                let id = self.enrich_and_finalize_skeleton(*task, None).await?;
                Ok((ResolveAction::Created, id))
            }
        }
    }

    async fn resolve_goal_internal(
        &self,
        request: &NewTaskRequest,
    ) -> DomainResult<(ResolveAction, TaskId)> {
        let goal_type = request
            .parameters
            .goal_type
            .clone()
            .unwrap_or_else(|| request.kind.as_str().to_string());
        let verifier = request
            .parameters
            .extra
            .get("verifier")
            .and_then(|v| v.as_str())
            .map_or_else(|| format!("{goal_type}_verifier"), str::to_string);
        let goal_id = request
            .parameters
            .extra
            .get("goalId")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let resolve = ResolveRequest {
            goal_type,
            intent_params: request.parameters.intent_params.clone(),
            bot_position: request.parameters.pos,
            verifier,
            goal_id,
            kind: request.kind.clone(),
            title: request.title.clone(),
        };

        match self.resolver.resolve_or_create(resolve).await? {
            ResolverDecision::Continue { task_id } => Ok((ResolveAction::Continue, task_id)),
            ResolverDecision::AlreadySatisfied { task_id } => {
                Ok((ResolveAction::AlreadySatisfied, task_id))
            }
            ResolverDecision::Skeleton { task } => {
                let id = self
                    .enrich_and_finalize_skeleton(*task, Some(request))
                    .await?;
                Ok((ResolveAction::Created, id))
            }
        }
    }

    /// Resolver skeletons re-enter the pipeline at plan generation and
    /// metadata projection, then hit the same finalizer.
    async fn enrich_and_finalize_skeleton(
        &self,
        mut task: Task,
        request: Option<&NewTaskRequest>,
    ) -> DomainResult<TaskId> {
        self.populate_plan(&mut task).await;
        if let Some(request) = request {
            self.project_metadata(&mut task, &request.metadata);
            task.priority = normalize_weight(request.priority.as_ref());
            task.urgency = normalize_weight(request.urgency.as_ref());
            task.description.clone_from(&request.description);
            task.category.clone_from(&request.category);
        }
        self.finalize_new_task(task, None).await
    }

    async fn populate_plan(&self, task: &mut Task) {
        // Advisory tasks never get a plan; they surface to the operator.
        if task.kind.is_advisory() {
            task.set_blocked("advisory_action");
            return;
        }
        let world_state = match &self.bot {
            Some(bot) => self.planner.fetch_bot_context(bot.as_ref()).await,
            None => None,
        };
        let outcome = self
            .planner
            .generate_plan(
                &task.title,
                &task.kind,
                &task.description,
                &task.parameters,
                world_state,
            )
            .await;
        match outcome {
            PlanOutcome::Steps { steps, route } => {
                task.steps = steps;
                task.metadata.solver.route = route;
            }
            PlanOutcome::Blocked { reason } => {
                task.steps.clear();
                task.status = TaskStatus::PendingPlanning;
                task.set_blocked(reason);
            }
        }
    }

    fn project_metadata(
        &self,
        task: &mut Task,
        incoming: &serde_json::Map<String, serde_json::Value>,
    ) {
        if incoming.is_empty() {
            return;
        }
        let projection = project_incoming_metadata(incoming);
        self.warn_dropped_keys(&projection.dropped_keys);

        let projected = projection.metadata;
        // Merge onto the task's metadata without clobbering what the
        // resolver or caller already stamped.
        if projected.goal_key.is_some() && task.metadata.goal_key.is_none() {
            task.metadata.goal_key = projected.goal_key;
        }
        if projected.subtask_key.is_some() {
            task.metadata.subtask_key = projected.subtask_key;
        }
        if projected.task_provenance.is_some() {
            task.metadata.task_provenance = projected.task_provenance;
        }
        if projected.sterling.is_some() {
            task.metadata.sterling = projected.sterling;
        }
        if projected.solver != SolverMeta::default() {
            task.metadata.solver = projected.solver;
        }
        // Parent lineage rides in provenance-bearing requests.
        if let Some(parent) = incoming
            .get("parentTaskId")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
        {
            task.metadata.parent_task_id = Some(parent);
        }
    }

    fn warn_dropped_keys(&self, dropped: &[String]) {
        if dropped.is_empty() {
            return;
        }
        let mut warned = self
            .warned_metadata_keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in dropped {
            // parentTaskId is consumed by projection's caller, not dropped.
            if key == "parentTaskId" {
                continue;
            }
            if warned.insert(key.clone()) {
                tracing::warn!(key, "Dropping non-allowlisted metadata key");
            }
        }
    }

    /// The single finalize choke point for every creation path.
    async fn finalize_new_task(
        &self,
        mut task: Task,
        sterling_key: Option<String>,
    ) -> DomainResult<TaskId> {
        // Executability gate: a plan with no dispatchable step blocks,
        // unless a more specific reason is already present.
        if !task.has_executable_plan()
            && task.metadata.blocked_reason.is_none()
            && task.status != TaskStatus::PendingPlanning
        {
            task.set_blocked("no-executable-plan");
        }

        // Seed the digest for later replan comparison.
        task.metadata.solver.steps_digest = Some(steps_digest(&task.steps));

        // Skeleton marker never survives finalize.
        task.metadata.stage = None;

        // Origin is stamped exactly once.
        if task.metadata.origin.is_none() {
            task.metadata.origin = Some(infer_task_origin(&task));
        }

        // Invariant checks.
        if task.metadata.origin.is_none() {
            let violation = format!("task {} finalized without origin", task.id);
            if self.strict_finalize {
                return Err(DomainError::FinalizeViolation(violation));
            }
            tracing::error!(%violation, "Finalize invariant violated");
        }
        if task.metadata.blocked_reason.is_some() && task.metadata.blocked_at.is_none() {
            if self.strict_finalize {
                return Err(DomainError::FinalizeViolation(format!(
                    "task {} has blocked_reason without blocked_at",
                    task.id
                )));
            }
            tracing::warn!(task_id = %task.id, "Backfilling blocked_at at finalize");
            task.metadata.blocked_at = Some(Utc::now());
        }

        let id = task.id;
        {
            let mut store = self.store.write().await;
            store.upsert(task.clone());
            if let Some(key) = &sterling_key {
                store.bind_sterling_key(key, id);
            }
        }

        self.publish_and_persist(EventPayload::TaskAdded {
            task_id: id,
            title: task.title.clone(),
            kind: task.kind.as_str().to_string(),
            source: task.source.as_str().to_string(),
            priority: task.priority,
        });
        self.event_store.enqueue_snapshot(&task);
        self.notify_dashboard(&task).await;

        if task.priority >= HIGH_PRIORITY_THRESHOLD {
            self.publish_and_persist(EventPayload::HighPriorityAdded {
                task_id: id,
                priority: task.priority,
            });
        }
        if task.status == TaskStatus::PendingPlanning {
            self.publish_and_persist(EventPayload::SolverUnavailable {
                task_id: id,
                reason: task
                    .metadata
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "solver_blocked".to_string()),
            });
        }

        // Goal-binding drift linter.
        if task.source == TaskSource::Goal && task.metadata.goal_binding.is_none() {
            let reason = if !self.goal_resolver_enabled {
                "goal_resolver_disabled".to_string()
            } else if !GOAL_RESOLVER_GATED_KINDS.contains(&task.kind.as_str()) {
                format!("type_not_gated:{}", task.kind)
            } else {
                "resolver_fallthrough".to_string()
            };
            tracing::warn!(task_id = %id, reason, "Goal-sourced task finalized without binding");
            self.publish_and_persist(EventPayload::GoalBindingDrift {
                task_id: id,
                reason,
            });
        }

        Ok(id)
    }

    // ------------------------------------------------------------------
    // Status mutation
    // ------------------------------------------------------------------

    /// Change a task's status.
    ///
    /// Runtime-origin changes run the goal-binding hook before persist:
    /// self-targeted hold effects land on the in-memory task first, so
    /// observers never see a paused task without its hold. Remaining
    /// effects go to the drain after persist.
    pub async fn update_status(
        &self,
        id: TaskId,
        new_status: TaskStatus,
        origin: MutationOrigin,
    ) -> DomainResult<()> {
        let (cross_effects, from, task_after) = {
            let mut store = self.store.write().await;
            let current = store.get(&id).ok_or(DomainError::TaskNotFound(id))?.clone();
            if current.status == new_status {
                return Ok(());
            }
            // Reject before any effect touches the task, so a refused
            // transition leaves no half-applied hold behind.
            if !current.can_transition_to(new_status) {
                return Err(DomainError::InvalidStateTransition {
                    from: current.status.as_str().to_string(),
                    to: new_status.as_str().to_string(),
                });
            }

            let (self_effects, cross_effects) =
                if origin == MutationOrigin::Runtime && self.hooks.is_enabled() {
                    let siblings = goal_siblings(&store, &current);
                    partition_effects(
                        self.hooks
                            .on_task_status_changed(&current, new_status, &siblings),
                        id,
                    )
                } else {
                    (Vec::new(), Vec::new())
                };

            let task = store
                .get_mut(&id)
                .ok_or(DomainError::TaskNotFound(id))?;
            for effect in &self_effects {
                apply_self_effect(task, effect);
            }
            let from = task.status;
            task.transition_to(new_status)
                .map_err(|_| DomainError::InvalidStateTransition {
                    from: from.as_str().to_string(),
                    to: new_status.as_str().to_string(),
                })?;
            let snapshot = task.clone();
            store.upsert(snapshot.clone());
            (cross_effects, from, snapshot)
        };

        self.publish_and_persist(EventPayload::TaskStatusChanged {
            task_id: id,
            from,
            to: new_status,
        });
        match new_status {
            TaskStatus::Completed => {
                self.publish_and_persist(EventPayload::TaskCompleted { task_id: id });
            }
            TaskStatus::Failed => {
                self.publish_and_persist(EventPayload::TaskFailed {
                    task_id: id,
                    reason: task_after.metadata.fail_reason.clone(),
                });
            }
            _ => {}
        }
        self.event_store.enqueue_snapshot(&task_after);
        self.notify_dashboard(&task_after).await;

        if task_after.is_terminal() {
            self.try_unblock_parent(&task_after).await;
            self.maybe_report_episode(&task_after);
        }

        if !cross_effects.is_empty() {
            let batch = EffectBatch {
                source_task: id,
                effects: cross_effects,
            };
            if self.drain_tx.send(batch).await.is_err() {
                tracing::error!(task_id = %id, "Protocol drain closed; dropping effects");
            }
        }
        Ok(())
    }

    /// Update progress, optionally with a terminal status.
    ///
    /// Only `completed`/`failed` pass the status guard; `active` is an
    /// accepted no-op passthrough; anything else is rejected with a
    /// warning while the progress value still applies.
    pub async fn update_progress(
        &self,
        id: TaskId,
        progress: f64,
        status: Option<TaskStatus>,
    ) -> DomainResult<()> {
        let progress = progress.clamp(0.0, 1.0);
        let requested_status = match status {
            None | Some(TaskStatus::Active) => None,
            Some(s @ (TaskStatus::Completed | TaskStatus::Failed)) => Some(s),
            Some(other) => {
                tracing::warn!(
                    task_id = %id,
                    status = other.as_str(),
                    "Progress API rejects this status; use update_status"
                );
                None
            }
        };

        let (cross_effects, task_after) = {
            let mut store = self.store.write().await;
            let current = store.get(&id).ok_or(DomainError::TaskNotFound(id))?.clone();
            let (self_effects, cross_effects) = if self.hooks.is_enabled() {
                partition_effects(self.hooks.on_task_progress_updated(&current, progress), id)
            } else {
                (Vec::new(), Vec::new())
            };
            let task = store
                .get_mut(&id)
                .ok_or(DomainError::TaskNotFound(id))?;
            for effect in &self_effects {
                apply_self_effect(task, effect);
            }
            task.progress = progress;
            task.metadata.updated_at = Utc::now();
            let snapshot = task.clone();
            store.upsert(snapshot.clone());
            (cross_effects, snapshot)
        };

        self.publish_and_persist(EventPayload::TaskProgressUpdated {
            task_id: id,
            progress,
        });
        self.event_store.enqueue_snapshot(&task_after);

        if !cross_effects.is_empty() {
            let batch = EffectBatch {
                source_task: id,
                effects: cross_effects,
            };
            let _ = self.drain_tx.send(batch).await;
        }

        if let Some(status) = requested_status {
            self.update_status(id, status, MutationOrigin::Runtime).await?;
        }
        Ok(())
    }

    /// Patch mutable metadata. `goal_binding` and `origin` are silently
    /// stripped; both are controlled by dedicated APIs.
    pub async fn update_metadata(&self, id: TaskId, patch: MetadataPatch) -> DomainResult<()> {
        if patch.has_guarded_fields() {
            tracing::warn!(task_id = %id, "Stripping goal_binding/origin from metadata patch");
        }
        let snapshot = {
            let mut store = self.store.write().await;
            let task = store.get_mut(&id).ok_or(DomainError::TaskNotFound(id))?;
            patch.apply_to(&mut task.metadata);
            let snapshot = task.clone();
            store.upsert(snapshot.clone());
            snapshot
        };
        self.event_store.enqueue_snapshot(&snapshot);
        Ok(())
    }

    /// Run arbitrary bookkeeping against a task under the store lock.
    ///
    /// Status must not be changed here; use [`Self::update_status`].
    pub async fn mutate_task<R>(
        &self,
        id: TaskId,
        mutate: impl FnOnce(&mut Task) -> R,
    ) -> DomainResult<R> {
        let (result, snapshot) = {
            let mut store = self.store.write().await;
            let task = store.get_mut(&id).ok_or(DomainError::TaskNotFound(id))?;
            let status_before = task.status;
            let result = mutate(task);
            debug_assert_eq!(task.status, status_before, "status changes must use update_status");
            task.metadata.updated_at = Utc::now();
            let snapshot = task.clone();
            store.upsert(snapshot.clone());
            (result, snapshot)
        };
        self.event_store.enqueue_snapshot(&snapshot);
        Ok(result)
    }

    // ------------------------------------------------------------------
    // Holds & protocol effects
    // ------------------------------------------------------------------

    /// Set a hold on a goal-bound task. Does not change status.
    pub async fn apply_hold(&self, id: TaskId, hold: Hold) -> DomainResult<()> {
        self.mutate_task(id, |task| {
            match task.metadata.goal_binding.as_mut() {
                Some(binding) => binding.hold = Some(hold),
                None => {
                    tracing::warn!(task_id = %task.id, "apply_hold on unbound task ignored");
                }
            }
        })
        .await
    }

    /// Clear any hold on a goal-bound task. Does not change status.
    pub async fn clear_hold(&self, id: TaskId) -> DomainResult<()> {
        self.mutate_task(id, |task| {
            if let Some(binding) = task.metadata.goal_binding.as_mut() {
                binding.hold = None;
            }
        })
        .await
    }

    /// Apply one drain-scheduled protocol effect.
    pub async fn apply_protocol_effect(&self, effect: &SyncEffect) -> DomainResult<()> {
        match effect {
            SyncEffect::ApplyHold { task_id, hold } => {
                self.apply_hold(*task_id, hold.clone()).await
            }
            SyncEffect::ClearHold { task_id } => self.clear_hold(*task_id).await,
            SyncEffect::UpdateTaskStatus { task_id, status } => {
                self.update_status(*task_id, *status, MutationOrigin::Protocol)
                    .await
            }
            SyncEffect::UpdateGoalStatus {
                goal_id,
                status,
                reason,
            } => {
                self.publish_and_persist(EventPayload::GoalStatusUpdated {
                    goal_id: goal_id.clone(),
                    status: *status,
                    reason: reason.clone(),
                });
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Management actions
    // ------------------------------------------------------------------

    /// Operator pause: precondition a manual-pause hold, then persist the
    /// status. The prior hold is restored if the transition is rejected.
    pub async fn pause(&self, id: TaskId) -> DomainResult<()> {
        let prior_hold = self.precondition_hold(id, Hold::new(crate::domain::models::goal::HoldReason::ManualPause)).await?;
        match self
            .update_status(id, TaskStatus::Paused, MutationOrigin::Management)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.restore_hold(id, prior_hold).await;
                Err(err)
            }
        }
    }

    /// Operator resume: clear the manual-pause hold and return to pending.
    pub async fn resume(&self, id: TaskId) -> DomainResult<()> {
        let prior_hold = {
            let store = self.store.read().await;
            let task = store.get(&id).ok_or(DomainError::TaskNotFound(id))?;
            task.metadata
                .goal_binding
                .as_ref()
                .and_then(|b| b.hold.clone())
        };
        self.clear_hold(id).await?;
        match self
            .update_status(id, TaskStatus::Pending, MutationOrigin::Management)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.restore_hold(id, prior_hold).await;
                Err(err)
            }
        }
    }

    /// Operator cancel: terminal failure with a manual-pause hold trace.
    pub async fn cancel(&self, id: TaskId) -> DomainResult<()> {
        let prior_hold = self
            .precondition_hold(
                id,
                Hold::new(crate::domain::models::goal::HoldReason::ManualPause),
            )
            .await?;
        self.mutate_task(id, |task| {
            task.metadata.fail_reason = Some("canceled_by_operator".to_string());
        })
        .await?;
        match self
            .update_status(id, TaskStatus::Failed, MutationOrigin::Management)
            .await
        {
            Ok(()) => Ok(()),
            Err(err) => {
                self.restore_hold(id, prior_hold).await;
                Err(err)
            }
        }
    }

    async fn precondition_hold(&self, id: TaskId, hold: Hold) -> DomainResult<Option<Hold>> {
        let mut prior = None;
        self.mutate_task(id, |task| {
            if let Some(binding) = task.metadata.goal_binding.as_mut() {
                prior = binding.hold.take();
                binding.hold = Some(hold);
            }
        })
        .await?;
        Ok(prior)
    }

    async fn restore_hold(&self, id: TaskId, prior: Option<Hold>) {
        let result = self
            .mutate_task(id, |task| {
                if let Some(binding) = task.metadata.goal_binding.as_mut() {
                    if binding.hold != prior {
                        tracing::warn!(
                            task_id = %task.id,
                            "Rolling back diverged hold state after rejected management action"
                        );
                    }
                    binding.hold = prior;
                }
            })
            .await;
        if let Err(err) = result {
            tracing::error!(task_id = %id, error = %err, "Hold rollback failed");
        }
    }

    // ------------------------------------------------------------------
    // Parent unblock & episode reporting
    // ------------------------------------------------------------------

    async fn try_unblock_parent(&self, child: &Task) {
        let Some(parent_id) = child.metadata.parent_task_id else {
            return;
        };
        let should_clear = {
            let store = self.store.read().await;
            let Some(parent) = store.get(&parent_id) else {
                return;
            };
            parent.metadata.blocked_reason.as_deref() == Some("waiting_on_prereq")
                && store
                    .children_of(&parent_id)
                    .iter()
                    .all(|sibling| sibling.is_terminal())
        };
        if should_clear {
            tracing::info!(parent = %parent_id, "All prereq subtasks terminal; unblocking parent");
            let _ = self.mutate_task(parent_id, Task::clear_blocked).await;
        }
    }

    /// Fire-and-forget building episode report on terminal transition.
    fn maybe_report_episode(&self, task: &Task) {
        if task.metadata.solver.building_plan_id.is_none() && !task.kind.is_building() {
            return;
        }
        let Some(service) = self.self_ref.upgrade() else {
            return;
        };
        let task = task.clone();
        let success = task.status == TaskStatus::Completed;
        tokio::spawn(async move {
            let outcome = service.planner.report_building_episode(&task, success).await;
            if let Some(outcome) = outcome {
                // Re-read the latest task so concurrent mutations are not
                // clobbered by this ack.
                let result = service
                    .mutate_task(task.id, |latest| {
                        latest
                            .metadata
                            .solver
                            .episode_hash_slots
                            .insert(outcome.slot.clone(), outcome.episode_hash.clone());
                        latest.metadata.solver.building_solve_result_substrate = None;
                    })
                    .await;
                if let Err(err) = result {
                    tracing::warn!(task_id = %task.id, error = %err, "Episode hash persist failed");
                }
            } else {
                // Substrate is consumed even when no linkage was possible.
                let _ = service
                    .mutate_task(task.id, |latest| {
                        latest.metadata.solver.building_solve_result_substrate = None;
                    })
                    .await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Event + sink plumbing
    // ------------------------------------------------------------------

    /// Publish to the bus and queue for persistence.
    pub fn publish_and_persist(&self, payload: EventPayload) {
        let event = self.bus.publish(payload);
        self.event_store.enqueue_event(event);
    }

    async fn notify_dashboard(&self, task: &Task) {
        if let Some(dashboard) = &self.dashboard {
            let update = TaskUpdate {
                task_id: task.id,
                title: task.title.clone(),
                status: task.status,
                progress: task.progress,
                ts: Utc::now(),
            };
            if let Err(err) = dashboard.task_update(&update).await {
                tracing::debug!(error = %err, "Dashboard update failed");
            }
        }
    }
}

/// Non-terminal tasks bound to the same goal as `task`, excluding it.
fn goal_siblings(store: &TaskStore, task: &Task) -> Vec<Task> {
    let Some(binding) = &task.metadata.goal_binding else {
        return Vec::new();
    };
    store
        .all()
        .filter(|other| {
            other.id != task.id
                && !other.is_terminal()
                && other
                    .metadata
                    .goal_binding
                    .as_ref()
                    .is_some_and(|b| b.goal_id == binding.goal_id)
        })
        .cloned()
        .collect()
}

/// Apply a self-targeted effect to the in-memory task before persist.
fn apply_self_effect(task: &mut Task, effect: &SyncEffect) {
    match effect {
        SyncEffect::ApplyHold { hold, .. } => {
            if let Some(binding) = task.metadata.goal_binding.as_mut() {
                binding.hold = Some(hold.clone());
            }
        }
        SyncEffect::ClearHold { .. } => {
            if let Some(binding) = task.metadata.goal_binding.as_mut() {
                binding.hold = None;
            }
        }
        SyncEffect::UpdateTaskStatus { .. } | SyncEffect::UpdateGoalStatus { .. } => {
            // Self status updates would recurse into the mutation that
            // produced them; the hook never emits these for self.
            tracing::warn!(task_id = %task.id, "Ignoring non-hold self effect");
        }
    }
}
