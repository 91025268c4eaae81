//! Domain errors for the basalt planning core.

use thiserror::Error;

use crate::domain::models::task::TaskId;

/// Domain-level errors that can occur in the planning core.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Invalid progress status transition to {0}; only completed/failed are accepted")]
    ProgressStatusRejected(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Goal key must not be empty")]
    EmptyGoalKey,

    #[error("Strict finalize violation: {0}")]
    FinalizeViolation(String),

    #[error("Bot interface error: {0}")]
    BotInterface(String),

    #[error("Solver error: {0}")]
    Solver(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Emergency stop engaged")]
    EmergencyStop,

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<sqlx::Error> for DomainError {
    fn from(err: sqlx::Error) -> Self {
        DomainError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for DomainError {
    fn from(err: reqwest::Error) -> Self {
        DomainError::BotInterface(err.to_string())
    }
}
