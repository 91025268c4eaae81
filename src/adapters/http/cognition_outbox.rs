//! Cognition outbox: bounded queue with periodic batched flush.
//!
//! Lifecycle notifications and thought acks queue here instead of
//! hitting the cognition service inline. Each flush posts at most one
//! events batch and one ack request; ack ids from separate queue
//! entries are merged. Failures drop the batch with a warning and never
//! propagate to the executor.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::{CognitionEvent, CognitionStream};

/// Queue capacity; the oldest entries drop first when full.
const OUTBOX_CAPACITY: usize = 512;

/// Default flush period.
const FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
enum OutboxEntry {
    Event(CognitionEvent),
    ThoughtAck(Vec<String>),
}

pub struct CognitionOutbox {
    stream: Arc<dyn CognitionStream>,
    queue: Mutex<VecDeque<OutboxEntry>>,
    flush_interval: Duration,
}

impl CognitionOutbox {
    pub fn new(stream: Arc<dyn CognitionStream>) -> Arc<Self> {
        Arc::new(Self {
            stream,
            queue: Mutex::new(VecDeque::new()),
            flush_interval: FLUSH_INTERVAL,
        })
    }

    #[cfg(test)]
    fn with_interval(stream: Arc<dyn CognitionStream>, flush_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            stream,
            queue: Mutex::new(VecDeque::new()),
            flush_interval,
        })
    }

    /// Queue a lifecycle event for the next flush.
    pub async fn push_event(&self, event: CognitionEvent) {
        self.push(OutboxEntry::Event(event)).await;
    }

    /// Queue thought acknowledgements for the next flush.
    pub async fn push_thought_acks(&self, thought_ids: Vec<String>) {
        if thought_ids.is_empty() {
            return;
        }
        self.push(OutboxEntry::ThoughtAck(thought_ids)).await;
    }

    async fn push(&self, entry: OutboxEntry) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= OUTBOX_CAPACITY {
            queue.pop_front();
            tracing::warn!("Cognition outbox full; dropping oldest entry");
        }
        queue.push_back(entry);
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Drain and send everything queued. Ack ids merge into one request.
    pub async fn flush(&self) {
        let drained: Vec<OutboxEntry> = {
            let mut queue = self.queue.lock().await;
            queue.drain(..).collect()
        };
        if drained.is_empty() {
            return;
        }

        let mut events = Vec::new();
        let mut ack_ids = Vec::new();
        for entry in drained {
            match entry {
                OutboxEntry::Event(event) => events.push(event),
                OutboxEntry::ThoughtAck(ids) => ack_ids.extend(ids),
            }
        }

        if !events.is_empty() {
            if let Err(err) = self.stream.post_events(&events).await {
                tracing::warn!(error = %err, count = events.len(), "Cognition event flush failed");
            }
        }
        if !ack_ids.is_empty() {
            ack_ids.sort();
            ack_ids.dedup();
            if let Err(err) = self.stream.ack_thoughts(&ack_ids).await {
                tracing::warn!(error = %err, count = ack_ids.len(), "Thought ack flush failed");
            }
        }
    }

    /// Spawn the periodic flush loop; flushes once more on stop.
    pub fn spawn_flush_loop(
        self: &Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let outbox = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(outbox.flush_interval) => {
                        outbox.flush().await;
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            outbox.flush().await;
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// HTTP implementation of the cognition stream port.
pub struct HttpCognitionStream {
    client: reqwest::Client,
    base_url: String,
}

impl HttpCognitionStream {
    pub fn new(base_url: impl Into<String>) -> DomainResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl CognitionStream for HttpCognitionStream {
    async fn post_events(&self, events: &[CognitionEvent]) -> DomainResult<()> {
        self.client
            .post(format!("{}/api/cognitive-stream/events", self.base_url))
            .json(events)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(())
    }

    async fn ack_thoughts(&self, thought_ids: &[String]) -> DomainResult<()> {
        self.client
            .post(format!("{}/api/cognitive-stream/ack", self.base_url))
            .json(&serde_json::json!({ "thoughtIds": thought_ids }))
            .send()
            .await?
            .error_for_status()
            .map_err(|e| DomainError::BotInterface(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingStream {
        event_batches: StdMutex<Vec<usize>>,
        ack_requests: StdMutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl CognitionStream for RecordingStream {
        async fn post_events(&self, events: &[CognitionEvent]) -> DomainResult<()> {
            self.event_batches.lock().unwrap().push(events.len());
            Ok(())
        }

        async fn ack_thoughts(&self, thought_ids: &[String]) -> DomainResult<()> {
            self.ack_requests
                .lock()
                .unwrap()
                .push(thought_ids.to_vec());
            Ok(())
        }
    }

    fn event(name: &str) -> CognitionEvent {
        CognitionEvent {
            task_id: uuid::Uuid::new_v4(),
            event_type: name.to_string(),
            detail: None,
            ts: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_flush_batches_events() {
        let stream = Arc::new(RecordingStream::default());
        let outbox = CognitionOutbox::with_interval(stream.clone(), Duration::from_secs(60));

        outbox.push_event(event("completed")).await;
        outbox.push_event(event("failed")).await;
        outbox.flush().await;

        assert_eq!(stream.event_batches.lock().unwrap().as_slice(), [2]);
        assert_eq!(outbox.pending().await, 0);
    }

    #[tokio::test]
    async fn test_acks_merge_into_one_request() {
        let stream = Arc::new(RecordingStream::default());
        let outbox = CognitionOutbox::with_interval(stream.clone(), Duration::from_secs(60));

        outbox
            .push_thought_acks(vec!["t1".into(), "t2".into()])
            .await;
        outbox.push_thought_acks(vec!["t2".into(), "t3".into()]).await;
        outbox.flush().await;

        let requests = stream.ack_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], vec!["t1", "t2", "t3"]);
    }

    #[tokio::test]
    async fn test_empty_flush_sends_nothing() {
        let stream = Arc::new(RecordingStream::default());
        let outbox = CognitionOutbox::with_interval(stream.clone(), Duration::from_secs(60));
        outbox.flush().await;
        assert!(stream.event_batches.lock().unwrap().is_empty());
        assert!(stream.ack_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_capacity_drops_oldest() {
        let stream = Arc::new(RecordingStream::default());
        let outbox = CognitionOutbox::with_interval(stream.clone(), Duration::from_secs(60));
        for i in 0..(OUTBOX_CAPACITY + 8) {
            outbox.push_event(event(&format!("e{i}"))).await;
        }
        assert_eq!(outbox.pending().await, OUTBOX_CAPACITY);
    }
}
