//! Ports: trait seams between the planning core and its collaborators.

pub mod bot_interface;
pub mod sinks;
pub mod solver;
pub mod verifier;

pub use bot_interface::BotInterface;
pub use sinks::{CognitionEvent, CognitionStream, DashboardSink, TaskUpdate};
pub use solver::{
    EpisodeAck, EpisodeReport, FeedbackStore, MacroPlanner, NavigationRequest, PlanRequest,
    PlanResponse, RecipeInfo, SolverDomain, SterlingSolver,
};
pub use verifier::GoalVerifier;
