//! Outbound notification ports (dashboard, cognition).
//!
//! All sinks are fire-and-forget from the executor's point of view:
//! failures never propagate into task mutation paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::errors::DomainResult;
use crate::domain::models::task::{TaskId, TaskStatus};

/// Task mutation notification pushed to the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpdate {
    pub task_id: TaskId,
    pub title: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait DashboardSink: Send + Sync {
    async fn task_update(&self, update: &TaskUpdate) -> DomainResult<()>;
}

/// Lifecycle notification queued for the cognition stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CognitionEvent {
    pub task_id: TaskId,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub ts: DateTime<Utc>,
}

#[async_trait]
pub trait CognitionStream: Send + Sync {
    /// Post a batch of lifecycle events.
    async fn post_events(&self, events: &[CognitionEvent]) -> DomainResult<()>;

    /// Acknowledge processed thoughts. One request per flush; ids from
    /// multiple queue entries are merged by the outbox.
    async fn ack_thoughts(&self, thought_ids: &[String]) -> DomainResult<()>;
}
