//! Service layer: the planning core's behavior lives here.

pub mod circuit_breaker;
pub mod event_bus;
pub mod event_store;
pub mod executor;
pub mod goal_binding;
pub mod goal_resolver;
pub mod prereq_injector;
pub mod protocol_drain;
pub mod rate_limiter;
pub mod step_execution;
pub mod sterling_planner;
pub mod task_service;
pub mod task_store;
pub mod threat_bridge;
pub mod verification;

pub use circuit_breaker::{BreakerState, CircuitBreaker};
pub use event_bus::{EventBus, EventPayload, IdleReason, PlanningEvent};
pub use event_store::{EventStore, EventStoreError, EventStoreHandle};
pub use executor::{
    CycleOutcome, EmergencyStop, Executor, ExecutorDeps, ExecutorStatsSnapshot,
};
pub use goal_binding::GoalBindingHooks;
pub use goal_resolver::{GoalResolver, ResolveRequest, ResolverDecision};
pub use prereq_injector::PrereqInjector;
pub use protocol_drain::{EffectBatch, ProtocolEffectsDrain};
pub use rate_limiter::StepRateLimiter;
pub use sterling_planner::SterlingPlanner;
pub use task_service::{
    MutationOrigin, NewTaskRequest, ResolveAction, TaskService, TaskServiceDeps,
};
pub use task_store::{TaskFilter, TaskStore};
pub use threat_bridge::ThreatBridge;
pub use verification::VerificationEngine;
