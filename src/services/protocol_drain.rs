//! Serial drain for cross-entity protocol effects.
//!
//! One actor consumes a bounded channel of effect batches. Effects from
//! a single originating mutation are applied in insertion order; batches
//! never interleave; an error in one batch is contained, logged, and the
//! drain keeps running. The drain is intentionally global (not
//! partitioned by goal or task): effects may touch any entity and
//! partitioning risks cross-entity ordering bugs.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::domain::models::goal::SyncEffect;
use crate::domain::models::task::TaskId;
use crate::services::event_bus::EventPayload;
use crate::services::task_service::TaskService;

/// All effects produced by one originating mutation.
#[derive(Debug, Clone)]
pub struct EffectBatch {
    pub source_task: TaskId,
    pub effects: Vec<SyncEffect>,
}

/// Default channel depth for scheduled batches.
pub const DRAIN_CAPACITY: usize = 256;

pub struct ProtocolEffectsDrain;

impl ProtocolEffectsDrain {
    /// Create the channel pair for a drain.
    pub fn channel() -> (mpsc::Sender<EffectBatch>, mpsc::Receiver<EffectBatch>) {
        mpsc::channel(DRAIN_CAPACITY)
    }

    /// Spawn the drain actor. Runs until the sender side is dropped.
    pub fn spawn(
        service: Arc<TaskService>,
        mut rx: mpsc::Receiver<EffectBatch>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                Self::apply_batch(&service, batch).await;
            }
            tracing::debug!("Protocol effects drain stopped");
        })
    }

    async fn apply_batch(service: &TaskService, batch: EffectBatch) {
        let kinds: Vec<String> = batch.effects.iter().map(|e| e.kind().to_string()).collect();
        for effect in &batch.effects {
            if let Err(err) = service.apply_protocol_effect(effect).await {
                tracing::error!(
                    source_task = %batch.source_task,
                    effect = effect.kind(),
                    error = %err,
                    "Protocol effect application failed; continuing drain"
                );
                service.events().publish(EventPayload::ProtocolEffectFailed {
                    source_task: batch.source_task,
                    effect_kinds: kinds.clone(),
                    error: err.to_string(),
                });
            }
        }
    }
}
