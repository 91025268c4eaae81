//! Goal verifier port.

use async_trait::async_trait;

use crate::domain::models::task::Task;

/// Re-checks whether a previously completed task still satisfies its
/// goal. Verifiers are registered by name; the goal resolver looks them
/// up via the `verifier` field on the binding.
#[async_trait]
pub trait GoalVerifier: Send + Sync {
    async fn still_satisfied(&self, task: &Task) -> bool;
}
