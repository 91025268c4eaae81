//! Shared test harness: scripted bot and solver plus full service wiring.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tokio::sync::RwLock;

use basalt::domain::errors::{DomainError, DomainResult};
use basalt::domain::models::action::{ActionRequest, ActionResponse, ExecutorMode};
use basalt::domain::models::config::{
    BreakerConfig, BudgetConfig, ExecutorConfig, VerificationConfig,
};
use basalt::domain::models::task::Step;
use basalt::domain::models::world::{
    BotHealth, BotState, InventoryItem, NearbyBlock, OccupancyGrid, ScanBounds,
};
use basalt::domain::ports::solver::{
    EpisodeAck, EpisodeReport, NavigationRequest, PlanRequest, PlanResponse, RecipeInfo,
    SterlingSolver,
};
use basalt::domain::ports::BotInterface;
use basalt::services::{
    CircuitBreaker, EmergencyStop, EventBus, EventStoreHandle, Executor, ExecutorDeps,
    GoalBindingHooks, GoalResolver, PrereqInjector, ProtocolEffectsDrain, SterlingPlanner,
    TaskService, TaskServiceDeps, TaskStore, ThreatBridge, VerificationEngine,
};

/// Bot double with scripted action responses and mutable world state.
#[derive(Default)]
pub struct ScriptedBot {
    pub state: StdMutex<BotState>,
    pub inventory: StdMutex<Vec<InventoryItem>>,
    pub blocks: StdMutex<Vec<NearbyBlock>>,
    pub action_queue: StdMutex<VecDeque<ActionResponse>>,
    pub dispatched: StdMutex<Vec<ActionRequest>>,
}

impl ScriptedBot {
    pub fn push_response(&self, response: ActionResponse) {
        self.action_queue.lock().unwrap().push_back(response);
    }

    pub fn set_inventory(&self, items: Vec<InventoryItem>) {
        *self.inventory.lock().unwrap() = items;
    }

    pub fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    fn grant_item(&self, item: &str, count: u32) {
        let mut inventory = self.inventory.lock().unwrap();
        if let Some(existing) = inventory.iter_mut().find(|i| i.name == item) {
            existing.count += count;
        } else {
            inventory.push(InventoryItem::new(item, count));
        }
    }

    fn simulate(&self, request: &ActionRequest) {
        let args = &request.parameters;
        match request.action_type.as_str() {
            "acquire_material" | "pickup_item" | "collect_items" => {
                if let Some(item) = args.get("item").and_then(serde_json::Value::as_str) {
                    let count = args.get("count").and_then(serde_json::Value::as_u64).unwrap_or(1);
                    self.grant_item(item, u32::try_from(count).unwrap_or(1));
                }
            }
            "craft_recipe" => {
                if let Some(recipe) = args.get("recipe").and_then(serde_json::Value::as_str) {
                    let qty = args.get("qty").and_then(serde_json::Value::as_u64).unwrap_or(1);
                    self.grant_item(recipe, u32::try_from(qty).unwrap_or(1));
                }
            }
            _ => {}
        }
    }
}

#[async_trait]
impl BotInterface for ScriptedBot {
    async fn health(&self) -> DomainResult<BotHealth> {
        Ok(BotHealth {
            ok: true,
            version: None,
        })
    }

    async fn state(&self) -> DomainResult<BotState> {
        Ok(self.state.lock().unwrap().clone())
    }

    async fn inventory(&self) -> DomainResult<Vec<InventoryItem>> {
        Ok(self.inventory.lock().unwrap().clone())
    }

    async fn nearby_blocks(&self, _radius: u32) -> DomainResult<Vec<NearbyBlock>> {
        Ok(self.blocks.lock().unwrap().clone())
    }

    async fn world_scan(&self, _bounds: ScanBounds) -> DomainResult<OccupancyGrid> {
        Ok(OccupancyGrid {
            dims: (0, 0, 0),
            cells: Vec::new(),
        })
    }

    async fn execute_action(&self, request: ActionRequest) -> DomainResult<ActionResponse> {
        let scripted = self.action_queue.lock().unwrap().pop_front();
        if scripted.is_none() {
            // Unscripted dispatches simulate the bot doing the work so
            // delta verifiers can observe a change.
            self.simulate(&request);
        }
        self.dispatched.lock().unwrap().push(request);
        Ok(scripted.unwrap_or_else(ActionResponse::executed))
    }
}

/// Solver double with a scripted plan queue and recipe table.
#[derive(Default)]
pub struct ScriptedSolver {
    pub plans: StdMutex<VecDeque<PlanResponse>>,
    pub default_steps: StdMutex<Vec<Step>>,
    pub recipes: StdMutex<HashMap<String, RecipeInfo>>,
    pub reports: StdMutex<Vec<EpisodeReport>>,
    pub fail_planning: StdMutex<bool>,
}

impl ScriptedSolver {
    pub fn push_plan(&self, plan: PlanResponse) {
        self.plans.lock().unwrap().push_back(plan);
    }

    pub fn set_default_steps(&self, steps: Vec<Step>) {
        *self.default_steps.lock().unwrap() = steps;
    }

    pub fn set_recipe(&self, item: &str, info: RecipeInfo) {
        self.recipes.lock().unwrap().insert(item.to_string(), info);
    }

    pub fn set_planning_failure(&self, fail: bool) {
        *self.fail_planning.lock().unwrap() = fail;
    }
}

#[async_trait]
impl SterlingSolver for ScriptedSolver {
    async fn generate_plan(&self, _request: &PlanRequest) -> DomainResult<PlanResponse> {
        if *self.fail_planning.lock().unwrap() {
            return Err(DomainError::Solver("solver unreachable".into()));
        }
        if let Some(plan) = self.plans.lock().unwrap().pop_front() {
            return Ok(plan);
        }
        Ok(PlanResponse {
            steps: self.default_steps.lock().unwrap().clone(),
            no_steps_reason: None,
            route: None,
        })
    }

    async fn introspect_recipe(&self, item: &str) -> DomainResult<Option<RecipeInfo>> {
        Ok(self.recipes.lock().unwrap().get(item).cloned())
    }

    async fn solve_navigation(&self, _request: &NavigationRequest) -> DomainResult<PlanResponse> {
        Ok(PlanResponse::default())
    }

    async fn report_episode(&self, report: &EpisodeReport) -> DomainResult<EpisodeAck> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(EpisodeAck { episode_hash: None })
    }

    async fn health(&self) -> DomainResult<bool> {
        Ok(true)
    }
}

/// Fully wired stack over the scripted doubles.
pub struct Harness {
    pub service: Arc<TaskService>,
    pub executor: Arc<Executor>,
    pub bot: Arc<ScriptedBot>,
    pub solver: Arc<ScriptedSolver>,
    pub bus: EventBus,
    pub stop: EmergencyStop,
}

pub fn build_harness(mode: ExecutorMode) -> Harness {
    let bot = Arc::new(ScriptedBot::default());
    let solver = Arc::new(ScriptedSolver::default());
    let bus = EventBus::default();
    let store = Arc::new(RwLock::new(TaskStore::new()));
    let resolver = Arc::new(GoalResolver::new(store.clone(), bus.clone()));
    let planner = Arc::new(SterlingPlanner::new(solver.clone()));
    let hooks = GoalBindingHooks::new(true);

    let (drain_tx, drain_rx) = ProtocolEffectsDrain::channel();
    let service = TaskService::new(TaskServiceDeps {
        store,
        bus: bus.clone(),
        planner,
        resolver,
        hooks,
        drain_tx,
        event_store: EventStoreHandle::disabled(),
        dashboard: None,
        bot: Some(bot.clone()),
        goal_resolver_enabled: true,
        strict_finalize: false,
    });
    ProtocolEffectsDrain::spawn(service.clone(), drain_rx);

    let (stop, stop_rx) = EmergencyStop::new();
    let executor = Executor::new(ExecutorDeps {
        service: service.clone(),
        bot: bot.clone(),
        verification: VerificationEngine::new(
            bot.clone(),
            VerificationConfig {
                poll_ms: 5,
                default_timeout_ms: 40,
                acquire_material_timeout_ms: 40,
                initial_wait_ms: 0,
            },
        ),
        prereq: PrereqInjector::new(solver.clone()),
        threat: ThreatBridge::new(bot.clone()),
        breaker: CircuitBreaker::new(BreakerConfig::default()),
        executor_config: ExecutorConfig {
            mode,
            poll_ms: 1_000,
            idle_event_throttle_ms: 0,
            ..Default::default()
        },
        budget_config: BudgetConfig::default(),
        stop_rx,
    });

    Harness {
        service,
        executor,
        bot,
        solver,
        bus,
        stop,
    }
}

/// Give spawned actors (drain, episode reports) a moment to run.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}
