//! Append-only event store trait and fire-and-forget writer.
//!
//! Persistence must never block the executor or the SSE path: all
//! writes go through a bounded channel into one writer task. Failures
//! are swallowed with a warning; a full queue drops the write.

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::models::task::{Task, TaskId};
use crate::services::event_bus::PlanningEvent;

/// Error type for event store operations.
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("Failed to append event: {0}")]
    Append(String),

    #[error("Failed to upsert snapshot: {0}")]
    Snapshot(String),

    #[error("Failed to query events: {0}")]
    Query(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Store initialization failed: {0}")]
    Init(String),
}

/// Append-only persistence over the per-world-seed database.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append a lifecycle event to `task_events`.
    async fn append(&self, event: &PlanningEvent) -> Result<(), EventStoreError>;

    /// Upsert the latest task snapshot into `task_snapshots`.
    async fn upsert_snapshot(&self, task: &Task) -> Result<(), EventStoreError>;

    /// Most recent events for a task, newest first.
    async fn recent_events(
        &self,
        task_id: TaskId,
        limit: u32,
    ) -> Result<Vec<PlanningEvent>, EventStoreError>;
}

enum WriteOp {
    Event(PlanningEvent),
    Snapshot(Box<Task>),
}

/// Channel depth before writes are dropped.
const WRITER_CAPACITY: usize = 1024;

/// Fire-and-forget handle over a spawned writer task.
///
/// The disabled handle no-ops everything so call sites never branch on
/// whether persistence is configured.
#[derive(Clone)]
pub struct EventStoreHandle {
    tx: Option<mpsc::Sender<WriteOp>>,
}

impl EventStoreHandle {
    /// Spawn the writer over a concrete store.
    pub fn spawn(store: std::sync::Arc<dyn EventStore>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<WriteOp>(WRITER_CAPACITY);
        let handle = tokio::spawn(async move {
            while let Some(op) = rx.recv().await {
                let result = match &op {
                    WriteOp::Event(event) => store.append(event).await,
                    WriteOp::Snapshot(task) => store.upsert_snapshot(task).await,
                };
                if let Err(err) = result {
                    tracing::warn!(error = %err, "Event store write failed; dropping");
                }
            }
        });
        (Self { tx: Some(tx) }, handle)
    }

    /// No-op handle for disabled persistence.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Queue a lifecycle event. Drops on a full queue.
    pub fn enqueue_event(&self, event: PlanningEvent) {
        if let Some(tx) = &self.tx {
            if tx.try_send(WriteOp::Event(event)).is_err() {
                tracing::warn!("Event store queue full; dropping event");
            }
        }
    }

    /// Queue a snapshot upsert. Drops on a full queue.
    pub fn enqueue_snapshot(&self, task: &Task) {
        if let Some(tx) = &self.tx {
            if tx
                .try_send(WriteOp::Snapshot(Box::new(task.clone())))
                .is_err()
            {
                tracing::warn!("Event store queue full; dropping snapshot");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::task::{TaskKind, TaskSource};
    use crate::services::event_bus::EventPayload;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingStore {
        events: Mutex<Vec<String>>,
        snapshots: Mutex<Vec<TaskId>>,
    }

    #[async_trait]
    impl EventStore for RecordingStore {
        async fn append(&self, event: &PlanningEvent) -> Result<(), EventStoreError> {
            self.events
                .lock()
                .unwrap()
                .push(event.payload.variant_name().to_string());
            Ok(())
        }

        async fn upsert_snapshot(&self, task: &Task) -> Result<(), EventStoreError> {
            self.snapshots.lock().unwrap().push(task.id);
            Ok(())
        }

        async fn recent_events(
            &self,
            _task_id: TaskId,
            _limit: u32,
        ) -> Result<Vec<PlanningEvent>, EventStoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_writer_consumes_ops() {
        let store = Arc::new(RecordingStore::default());
        let (handle, writer) = EventStoreHandle::spawn(store.clone());

        let event = crate::services::event_bus::EventBus::default()
            .publish(EventPayload::EmergencyStopEngaged);
        handle.enqueue_event(event);
        let task = Task::new("t", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        handle.enqueue_snapshot(&task);

        drop(handle);
        writer.await.unwrap();

        assert_eq!(store.events.lock().unwrap().as_slice(), ["emergency_stop"]);
        assert_eq!(store.snapshots.lock().unwrap().as_slice(), [task.id]);
    }

    #[test]
    fn test_disabled_handle_no_ops() {
        let handle = EventStoreHandle::disabled();
        assert!(!handle.is_enabled());
        let task = Task::new("t", TaskKind::new(TaskKind::MINING), TaskSource::Manual);
        // Must not panic
        handle.enqueue_snapshot(&task);
    }
}
