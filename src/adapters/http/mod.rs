//! HTTP adapters for external collaborators.

pub mod bot_client;
pub mod cognition_outbox;
pub mod dashboard_sink;
pub mod solver_client;

pub use bot_client::HttpBotClient;
pub use cognition_outbox::{CognitionOutbox, HttpCognitionStream};
pub use dashboard_sink::HttpDashboardSink;
pub use solver_client::HttpSolverClient;
