//! Sterling planner adapter.
//!
//! Wraps the solver port with plan-shape normalization (blocked
//! sentinels), stable step digests, feasibility-gate advice, and episode
//! reporting with join-key coherence checks.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, RwLock};

use crate::domain::errors::DomainResult;
use crate::domain::models::metadata::{JoinKeys, RigGMeta, SolveSubstrate};
use crate::domain::models::task::{Step, Task, TaskKind, TaskParameters};
use crate::domain::models::world::ScanBounds;
use crate::domain::ports::{
    BotInterface, EpisodeReport, FeedbackStore, MacroPlanner, PlanRequest, PlanResponse,
    SolverDomain, SterlingSolver,
};

/// Identifier this process expects in building join keys.
pub const BUILDING_SOLVER_ID: &str = "sterling-building-v1";

/// Episode outcome classes reported to the solver.
pub const EXECUTION_SUCCESS: &str = "EXECUTION_SUCCESS";
pub const EXECUTION_FAILURE: &str = "EXECUTION_FAILURE";

/// Cap on the warn-once LRU for episode linkage warnings.
const EPISODE_WARN_CAP: usize = 1000;

/// Result of plan generation after normalization.
#[derive(Debug, Clone)]
pub enum PlanOutcome {
    /// A usable step plan.
    Steps { steps: Vec<Step>, route: Option<String> },
    /// The solver is unavailable or produced a blocked sentinel.
    Blocked { reason: String },
}

/// Pure feasibility advice derived from Rig G metadata. Both the
/// shadow (dry-run) and live gate paths call this; only the live path
/// may act on it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionAdvice {
    pub should_proceed: bool,
    pub reason: Option<String>,
}

pub fn advise_execution(rig_g: &RigGMeta) -> ExecutionAdvice {
    if rig_g.feasible == Some(false) {
        return ExecutionAdvice {
            should_proceed: false,
            reason: rig_g
                .reason
                .clone()
                .or_else(|| Some("rig_g_infeasible".to_string())),
        };
    }
    ExecutionAdvice {
        should_proceed: true,
        reason: None,
    }
}

/// Stable digest over step labels (id fallback). Used by replan
/// comparison and episode coherence checks.
pub fn steps_digest(steps: &[Step]) -> String {
    let mut hasher = Sha256::new();
    for step in steps {
        let token = if step.label.is_empty() { &step.id } else { &step.label };
        hasher.update(token.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .take(8)
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Bounded insertion-ordered warn-once set.
struct WarnOnce {
    seen: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl WarnOnce {
    fn new(cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            cap,
        }
    }

    /// Returns true the first time a key is observed.
    fn first(&mut self, key: String) -> bool {
        if self.seen.contains(&key) {
            return false;
        }
        self.seen.insert(key.clone());
        self.order.push_back(key);
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

/// What an episode report resolved to.
#[derive(Debug, Clone)]
pub struct EpisodeOutcome {
    /// Slot key under which the episode hash should be persisted
    pub slot: String,
    pub episode_hash: String,
}

/// Planner adapter over the Sterling solver port.
pub struct SterlingPlanner {
    solver: Arc<dyn SterlingSolver>,
    macro_planner: RwLock<Option<Arc<dyn MacroPlanner>>>,
    feedback: RwLock<Option<Arc<dyn FeedbackStore>>>,
    episode_warns: Mutex<WarnOnce>,
    join_keys_compat: bool,
    episode_debug: bool,
}

impl SterlingPlanner {
    pub fn new(solver: Arc<dyn SterlingSolver>) -> Self {
        Self {
            solver,
            macro_planner: RwLock::new(None),
            feedback: RwLock::new(None),
            episode_warns: Mutex::new(WarnOnce::new(EPISODE_WARN_CAP)),
            join_keys_compat: false,
            episode_debug: false,
        }
    }

    pub fn with_flags(mut self, join_keys_compat: bool, episode_debug: bool) -> Self {
        self.join_keys_compat = join_keys_compat;
        self.episode_debug = episode_debug;
        self
    }

    pub fn solver(&self) -> Arc<dyn SterlingSolver> {
        self.solver.clone()
    }

    /// Install the hierarchical navigation macro planner (Rig E).
    pub async fn set_macro_planner(&self, planner: Arc<dyn MacroPlanner>) {
        *self.macro_planner.write().await = Some(planner);
    }

    pub async fn set_feedback_store(&self, store: Arc<dyn FeedbackStore>) {
        *self.feedback.write().await = Some(store);
    }

    pub async fn macro_planner(&self) -> Option<Arc<dyn MacroPlanner>> {
        self.macro_planner.read().await.clone()
    }

    pub async fn feedback_store(&self) -> Option<Arc<dyn FeedbackStore>> {
        self.feedback.read().await.clone()
    }

    /// Generate a plan for a task-shaped request, normalizing solver
    /// unavailability and blocked sentinels into [`PlanOutcome::Blocked`].
    pub async fn generate_plan(
        &self,
        title: &str,
        kind: &TaskKind,
        description: &str,
        parameters: &TaskParameters,
        world_state: Option<serde_json::Value>,
    ) -> PlanOutcome {
        let request = PlanRequest {
            title: title.to_string(),
            kind: kind.clone(),
            description: description.to_string(),
            parameters: parameters.clone(),
            world_state,
            failure_context: None,
        };
        match self.solver.generate_plan(&request).await {
            Ok(response) => Self::normalize_response(response),
            Err(err) => {
                tracing::warn!(error = %err, title, "Sterling plan generation failed");
                PlanOutcome::Blocked {
                    reason: format!("sterling_unavailable: {err}"),
                }
            }
        }
    }

    /// Generate steps for a dynamically injected subtask.
    pub async fn generate_dynamic_steps(
        &self,
        title: &str,
        kind: &TaskKind,
        parameters: &TaskParameters,
    ) -> PlanOutcome {
        self.generate_plan(title, kind, "", parameters, None).await
    }

    /// Regenerate a plan with failure context (repair gate / Rig G replan).
    pub async fn regenerate_plan(
        &self,
        task: &Task,
        failure_context: &str,
    ) -> DomainResult<PlanOutcome> {
        let request = PlanRequest {
            title: task.title.clone(),
            kind: task.kind.clone(),
            description: task.description.clone(),
            parameters: task.parameters.clone(),
            world_state: None,
            failure_context: Some(failure_context.to_string()),
        };
        Ok(Self::normalize_response(self.solver.generate_plan(&request).await?))
    }

    fn normalize_response(response: PlanResponse) -> PlanOutcome {
        if response.steps.is_empty() {
            return PlanOutcome::Blocked {
                reason: response
                    .no_steps_reason
                    .unwrap_or_else(|| "no_steps".to_string()),
            };
        }
        if response.steps.len() == 1 && response.steps[0].meta.blocked {
            let reason = response.steps[0]
                .meta
                .blocked_reason
                .clone()
                .or(response.no_steps_reason)
                .unwrap_or_else(|| "solver_blocked".to_string());
            return PlanOutcome::Blocked { reason };
        }
        PlanOutcome::Steps {
            steps: response.steps,
            route: response.route,
        }
    }

    /// Solver domain a task kind routes to.
    pub fn domain_for_kind(kind: &TaskKind) -> Option<SolverDomain> {
        match kind.as_str() {
            TaskKind::BUILDING | TaskKind::PLACEMENT => Some(SolverDomain::Building),
            TaskKind::CRAFTING => Some(SolverDomain::Crafting),
            "tool_progression" => Some(SolverDomain::ToolProgression),
            "navigation" | "exploration" => Some(SolverDomain::Navigation),
            _ => None,
        }
    }

    /// Solve a navigation request: scan the traversal volume through
    /// the game interface, consult the macro planner (Rig E) when one
    /// is installed, then fall through to the base navigation solver.
    pub async fn solve_navigation(
        &self,
        bot: &dyn BotInterface,
        mut request: crate::domain::ports::NavigationRequest,
    ) -> DomainResult<PlanResponse> {
        if request.grid.is_none() {
            let bounds = scan_bounds_for(&request);
            match bot.world_scan(bounds).await {
                Ok(grid) => request.grid = Some(grid),
                Err(err) => {
                    tracing::warn!(error = %err, "World scan failed; solving without grid");
                }
            }
        }

        if let Some(macro_planner) = self.macro_planner().await {
            match macro_planner.macro_route(&request).await {
                Ok(Some(response)) => return Ok(response),
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "Macro planner failed; using base solver");
                }
            }
        }
        self.solver.solve_navigation(&request).await
    }

    /// Read a compact world context for plan requests.
    pub async fn fetch_bot_context(&self, bot: &dyn BotInterface) -> Option<serde_json::Value> {
        let state = bot.state().await.ok()?;
        let inventory = bot.inventory().await.unwrap_or_default();
        let items: Vec<serde_json::Value> = inventory
            .iter()
            .map(|item| serde_json::json!({"name": item.name, "count": item.count}))
            .collect();
        Some(serde_json::json!({
            "position": {"x": state.position.x, "y": state.position.y, "z": state.position.z},
            "health": state.health,
            "food": state.food,
            "inventory": items,
        }))
    }

    /// Report a building execution episode at terminal state.
    ///
    /// Join keys must cohere with the task's plan id (and, when present,
    /// the expected solver id); otherwise linkage hashes are omitted and
    /// a warning fires once per `(task, domain, reason)`. Returns the
    /// episode hash slot to persist, if the solver acked with one.
    pub async fn report_building_episode(
        &self,
        task: &Task,
        success: bool,
    ) -> Option<EpisodeOutcome> {
        let solver_meta = &task.metadata.solver;
        let template_id = solver_meta.building_template_id.clone();
        let plan_id = solver_meta.building_plan_id.clone();
        let join_keys = self.effective_join_keys(task);

        let linkage = self
            .validate_join_keys(task, plan_id.as_deref(), join_keys.as_ref())
            .await;

        let substrate = solver_meta.building_solve_result_substrate.as_ref();
        let outcome_class = classify_outcome(success, join_keys.as_ref(), substrate);

        let report = EpisodeReport {
            task_id: task.id,
            domain: SolverDomain::Building,
            outcome_class,
            template_id,
            plan_id,
            bundle_hash: linkage.as_ref().and_then(|k| k.bundle_hash.clone()),
            trace_bundle_hash: linkage.as_ref().and_then(|k| k.trace_bundle_hash.clone()),
            steps_digest: solver_meta.steps_digest.clone(),
            search_stats: substrate.and_then(|s| s.search_stats.clone()),
        };

        if self.episode_debug {
            tracing::debug!(task_id = %task.id, outcome = %report.outcome_class, "Reporting building episode");
        }

        match self.solver.report_episode(&report).await {
            Ok(ack) => ack.episode_hash.map(|hash| EpisodeOutcome {
                slot: format!("building:{}", report.plan_id.as_deref().unwrap_or("unlinked")),
                episode_hash: hash,
            }),
            Err(err) => {
                tracing::warn!(task_id = %task.id, error = %err, "Episode report failed");
                None
            }
        }
    }

    /// Join keys with the environment-gated legacy fallback applied.
    fn effective_join_keys(&self, task: &Task) -> Option<JoinKeys> {
        if let Some(keys) = &task.metadata.solver.building_solve_join_keys {
            return Some(keys.clone());
        }
        if self.join_keys_compat {
            if let Some(legacy) = task
                .metadata
                .sterling
                .as_ref()
                .and_then(|s| s.get("solveJoinKeys"))
            {
                if let Ok(keys) = serde_json::from_value::<JoinKeys>(legacy.clone()) {
                    tracing::warn!(
                        task_id = %task.id,
                        "Using deprecated solveJoinKeys fallback for episode linkage"
                    );
                    return Some(keys);
                }
            }
        }
        None
    }

    /// Validate join-key coherence; warn once per reason category.
    async fn validate_join_keys(
        &self,
        task: &Task,
        plan_id: Option<&str>,
        keys: Option<&JoinKeys>,
    ) -> Option<JoinKeys> {
        let reason = match keys {
            None => Some("missing_join_keys"),
            Some(keys) => {
                if keys.plan_id.as_deref() != plan_id {
                    Some("plan_id_mismatch")
                } else if keys
                    .solver_id
                    .as_deref()
                    .is_some_and(|id| id != BUILDING_SOLVER_ID)
                {
                    Some("solver_id_mismatch")
                } else {
                    None
                }
            }
        };

        match reason {
            None => keys.cloned(),
            Some(category) => {
                let warn_key = format!("{}|building|{category}", task.id);
                if self.episode_warns.lock().await.first(warn_key) {
                    tracing::warn!(
                        task_id = %task.id,
                        category,
                        "Episode join keys incoherent; omitting linkage hashes"
                    );
                }
                None
            }
        }
    }
}

/// Scan volume covering the traversal corridor with margin.
fn scan_bounds_for(request: &crate::domain::ports::NavigationRequest) -> ScanBounds {
    const MARGIN: f64 = 8.0;
    let (sx, gx) = (request.start.x, request.goal.x);
    let (sy, gy) = (request.start.y, request.goal.y);
    let (sz, gz) = (request.start.z, request.goal.z);
    #[allow(clippy::cast_possible_truncation)]
    ScanBounds {
        x1: (sx.min(gx) - MARGIN).floor() as i64,
        y1: (sy.min(gy) - MARGIN).floor() as i64,
        z1: (sz.min(gz) - MARGIN).floor() as i64,
        x2: (sx.max(gx) + MARGIN).ceil() as i64,
        y2: (sy.max(gy) + MARGIN).ceil() as i64,
        z2: (sz.max(gz) + MARGIN).ceil() as i64,
    }
}

/// Classify an episode outcome.
///
/// Success is always `EXECUTION_SUCCESS`. A failure with a coherent
/// substrate (matching bundle hash and plan id) inherits the richer
/// class from the solve result; anything else is a plain failure.
fn classify_outcome(
    success: bool,
    keys: Option<&JoinKeys>,
    substrate: Option<&SolveSubstrate>,
) -> String {
    if success {
        return EXECUTION_SUCCESS.to_string();
    }
    if let (Some(keys), Some(substrate)) = (keys, substrate) {
        let bundle_coherent = substrate.bundle_hash.is_some()
            && substrate.bundle_hash == keys.bundle_hash;
        let plan_coherent = substrate.plan_id.is_some() && substrate.plan_id == keys.plan_id;
        if bundle_coherent && plan_coherent {
            if let Some(class) = &substrate.outcome_class {
                return class.clone();
            }
        }
    }
    EXECUTION_FAILURE.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::DomainError;
    use crate::domain::models::task::TaskSource;
    use crate::domain::ports::solver::{EpisodeAck, NavigationRequest, RecipeInfo};
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct ScriptedSolver {
        plan: StdMutex<Option<PlanResponse>>,
        reports: StdMutex<Vec<EpisodeReport>>,
        ack_hash: Option<String>,
        fail: bool,
    }

    impl ScriptedSolver {
        fn with_plan(plan: PlanResponse) -> Self {
            Self {
                plan: StdMutex::new(Some(plan)),
                reports: StdMutex::new(Vec::new()),
                ack_hash: Some("ep-hash-1".into()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                plan: StdMutex::new(None),
                reports: StdMutex::new(Vec::new()),
                ack_hash: None,
                fail: true,
            }
        }
    }

    #[async_trait]
    impl SterlingSolver for ScriptedSolver {
        async fn generate_plan(&self, _request: &PlanRequest) -> DomainResult<PlanResponse> {
            if self.fail {
                return Err(DomainError::Solver("unreachable".into()));
            }
            Ok(self.plan.lock().unwrap().clone().unwrap_or_default())
        }

        async fn introspect_recipe(&self, _item: &str) -> DomainResult<Option<RecipeInfo>> {
            Ok(None)
        }

        async fn solve_navigation(&self, _request: &NavigationRequest) -> DomainResult<PlanResponse> {
            Ok(PlanResponse::default())
        }

        async fn report_episode(&self, report: &EpisodeReport) -> DomainResult<EpisodeAck> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(EpisodeAck {
                episode_hash: self.ack_hash.clone(),
            })
        }

        async fn health(&self) -> DomainResult<bool> {
            Ok(!self.fail)
        }
    }

    fn building_task() -> Task {
        let mut task = Task::new(
            "build shelter",
            TaskKind::new(TaskKind::BUILDING),
            TaskSource::Goal,
        );
        task.metadata.solver.building_plan_id = Some("plan-1".into());
        task.metadata.solver.building_template_id = Some("tmpl-1".into());
        task
    }

    #[test]
    fn test_steps_digest_stability() {
        let steps = vec![Step::new("a", 0), Step::new("b", 1)];
        assert_eq!(steps_digest(&steps), steps_digest(&steps));
        let reordered = vec![Step::new("b", 0), Step::new("a", 1)];
        assert_ne!(steps_digest(&steps), steps_digest(&reordered));
    }

    #[test]
    fn test_digest_falls_back_to_id() {
        let mut step = Step::new("", 0);
        step.id = "step-1".into();
        let with_id = steps_digest(std::slice::from_ref(&step));
        step.id = "step-2".into();
        assert_ne!(with_id, steps_digest(&[step]));
    }

    #[test]
    fn test_advise_execution_pure() {
        assert!(advise_execution(&RigGMeta::default()).should_proceed);
        assert!(
            advise_execution(&RigGMeta {
                feasible: Some(true),
                ..Default::default()
            })
            .should_proceed
        );
        let rejected = advise_execution(&RigGMeta {
            feasible: Some(false),
            reason: Some("unreachable site".into()),
            ..Default::default()
        });
        assert!(!rejected.should_proceed);
        assert_eq!(rejected.reason.as_deref(), Some("unreachable site"));
    }

    #[tokio::test]
    async fn test_solver_failure_becomes_blocked() {
        let planner = SterlingPlanner::new(Arc::new(ScriptedSolver::failing()));
        let outcome = planner
            .generate_plan(
                "t",
                &TaskKind::new(TaskKind::CRAFTING),
                "",
                &TaskParameters::default(),
                None,
            )
            .await;
        let PlanOutcome::Blocked { reason } = outcome else {
            panic!("expected blocked");
        };
        assert!(reason.starts_with("sterling_unavailable"));
    }

    #[tokio::test]
    async fn test_blocked_sentinel_normalized() {
        let response = PlanResponse {
            steps: vec![Step::blocked_sentinel("solver capacity exhausted")],
            no_steps_reason: None,
            route: None,
        };
        let planner = SterlingPlanner::new(Arc::new(ScriptedSolver::with_plan(response)));
        let outcome = planner
            .generate_plan(
                "t",
                &TaskKind::new(TaskKind::BUILDING),
                "",
                &TaskParameters::default(),
                None,
            )
            .await;
        let PlanOutcome::Blocked { reason } = outcome else {
            panic!("expected blocked");
        };
        assert_eq!(reason, "solver capacity exhausted");
    }

    #[tokio::test]
    async fn test_episode_success_class() {
        let solver = Arc::new(ScriptedSolver::with_plan(PlanResponse::default()));
        let planner = SterlingPlanner::new(solver.clone());
        let mut task = building_task();
        task.metadata.solver.building_solve_join_keys = Some(JoinKeys {
            plan_id: Some("plan-1".into()),
            solver_id: Some(BUILDING_SOLVER_ID.into()),
            bundle_hash: Some("bh".into()),
            trace_bundle_hash: None,
        });

        let outcome = planner.report_building_episode(&task, true).await.unwrap();
        assert_eq!(outcome.episode_hash, "ep-hash-1");
        assert_eq!(outcome.slot, "building:plan-1");

        let reports = solver.reports.lock().unwrap();
        assert_eq!(reports[0].outcome_class, EXECUTION_SUCCESS);
        assert_eq!(reports[0].bundle_hash.as_deref(), Some("bh"));
    }

    #[tokio::test]
    async fn test_episode_mismatch_omits_linkage() {
        let solver = Arc::new(ScriptedSolver::with_plan(PlanResponse::default()));
        let planner = SterlingPlanner::new(solver.clone());
        let mut task = building_task();
        task.metadata.solver.building_solve_join_keys = Some(JoinKeys {
            plan_id: Some("different-plan".into()),
            solver_id: None,
            bundle_hash: Some("bh".into()),
            trace_bundle_hash: None,
        });

        planner.report_building_episode(&task, false).await;
        let reports = solver.reports.lock().unwrap();
        assert!(reports[0].bundle_hash.is_none());
        assert_eq!(reports[0].outcome_class, EXECUTION_FAILURE);
    }

    #[test]
    fn test_classify_coherent_substrate() {
        let keys = JoinKeys {
            plan_id: Some("p".into()),
            solver_id: None,
            bundle_hash: Some("bh".into()),
            trace_bundle_hash: None,
        };
        let substrate = SolveSubstrate {
            bundle_hash: Some("bh".into()),
            plan_id: Some("p".into()),
            outcome_class: Some("PLACEMENT_DRIFT".into()),
            search_stats: None,
        };
        assert_eq!(
            classify_outcome(false, Some(&keys), Some(&substrate)),
            "PLACEMENT_DRIFT"
        );

        let incoherent = SolveSubstrate {
            bundle_hash: Some("other".into()),
            ..substrate
        };
        assert_eq!(
            classify_outcome(false, Some(&keys), Some(&incoherent)),
            EXECUTION_FAILURE
        );
    }

    #[test]
    fn test_warn_once_lru_bounds() {
        let mut warns = WarnOnce::new(3);
        assert!(warns.first("a".into()));
        assert!(!warns.first("a".into()));
        assert!(warns.first("b".into()));
        assert!(warns.first("c".into()));
        assert!(warns.first("d".into())); // evicts "a"
        assert!(warns.first("a".into()));
    }

    #[tokio::test]
    async fn test_deprecated_join_keys_compat() {
        let solver = Arc::new(ScriptedSolver::with_plan(PlanResponse::default()));
        let planner = SterlingPlanner::new(solver.clone()).with_flags(true, false);
        let mut task = building_task();
        task.metadata.sterling = Some(serde_json::json!({
            "solveJoinKeys": {"planId": "plan-1", "bundleHash": "legacy-bh"}
        }));

        planner.report_building_episode(&task, true).await;
        let reports = solver.reports.lock().unwrap();
        assert_eq!(reports[0].bundle_hash.as_deref(), Some("legacy-bh"));
    }
}
