//! Postgres implementation of the event store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::domain::models::task::{Task, TaskId};
use crate::services::event_bus::{EventPayload, PlanningEvent};
use crate::services::event_store::{EventStore, EventStoreError};

/// Postgres-backed append-only event repository.
#[derive(Clone)]
pub struct PostgresEventRepository {
    pool: PgPool,
    world_seed: String,
}

impl PostgresEventRepository {
    pub fn new(pool: PgPool, world_seed: impl Into<String>) -> Self {
        Self {
            pool,
            world_seed: world_seed.into(),
        }
    }
}

#[async_trait]
impl EventStore for PostgresEventRepository {
    async fn append(&self, event: &PlanningEvent) -> Result<(), EventStoreError> {
        let payload = serde_json::to_value(&event.payload)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r"INSERT INTO task_events (event_type, event_ts, task_id, event_data, world_seed)
              VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.payload.variant_name())
        .bind(event.timestamp)
        .bind(event.payload.task_id().map(|id| id.to_string()))
        .bind(Json(payload))
        .bind(&self.world_seed)
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Append(e.to_string()))?;
        Ok(())
    }

    async fn upsert_snapshot(&self, task: &Task) -> Result<(), EventStoreError> {
        let task_data = serde_json::to_value(task)
            .map_err(|e| EventStoreError::Serialization(e.to_string()))?;

        sqlx::query(
            r"INSERT INTO task_snapshots (task_id, snapshot_ts, task_data, world_seed, status)
              VALUES ($1, $2, $3, $4, $5)
              ON CONFLICT (task_id) DO UPDATE SET
                snapshot_ts = EXCLUDED.snapshot_ts,
                task_data = EXCLUDED.task_data,
                status = EXCLUDED.status",
        )
        .bind(task.id.to_string())
        .bind(Utc::now())
        .bind(Json(task_data))
        .bind(&self.world_seed)
        .bind(task.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| EventStoreError::Snapshot(e.to_string()))?;
        Ok(())
    }

    async fn recent_events(
        &self,
        task_id: TaskId,
        limit: u32,
    ) -> Result<Vec<PlanningEvent>, EventStoreError> {
        let rows = sqlx::query(
            r"SELECT event_id, event_ts, event_data
              FROM task_events
              WHERE task_id = $1
              ORDER BY event_ts DESC
              LIMIT $2",
        )
        .bind(task_id.to_string())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| EventStoreError::Query(e.to_string()))?;

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let event_id: i64 = row
                .try_get("event_id")
                .map_err(|e| EventStoreError::Query(e.to_string()))?;
            let event_ts: DateTime<Utc> = row
                .try_get("event_ts")
                .map_err(|e| EventStoreError::Query(e.to_string()))?;
            let Json(payload): Json<serde_json::Value> = row
                .try_get("event_data")
                .map_err(|e| EventStoreError::Query(e.to_string()))?;
            let payload: EventPayload = serde_json::from_value(payload)
                .map_err(|e| EventStoreError::Serialization(e.to_string()))?;
            events.push(PlanningEvent {
                id: Uuid::new_v4(),
                sequence: u64::try_from(event_id).unwrap_or(0),
                timestamp: event_ts,
                payload,
            });
        }
        Ok(events)
    }
}
