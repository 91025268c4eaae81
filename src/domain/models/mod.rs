//! Domain models for the planning core.

pub mod action;
pub mod config;
pub mod goal;
pub mod metadata;
pub mod origin;
pub mod requirement;
pub mod task;
pub mod verification;
pub mod world;

pub use action::{ActionOutcome, ActionRequest, ActionResponse, ExecutorMode, FailureCode};
pub use config::Config;
pub use goal::{GoalBinding, GoalKey, GoalStatus, Hold, HoldReason, SyncEffect};
pub use metadata::{
    ExecutionBudgetState, JoinKeys, MetadataPatch, RigGMeta, RigGReplan, SolveSubstrate,
    SolverMeta, TaskMetadata, METADATA_ALLOWLIST,
};
pub use origin::{infer_task_origin, OriginKind, TaskOrigin};
pub use requirement::{Requirement, RequirementKind};
pub use task::{
    normalize_weight, ItemStack, Step, StepMeta, Task, TaskId, TaskKind, TaskParameters,
    TaskSource, TaskStatus,
};
pub use verification::{ActionVerification, StepSnapshot, VerificationStatus};
pub use world::{
    BotHealth, BotState, InventoryItem, NearbyBlock, OccupancyGrid, Position, ScanBounds,
};
