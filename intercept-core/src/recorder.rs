//! Fire-and-forget event recording
//!
//! Traffic tasks push finalized events into a bounded queue and move on. A
//! single drain task hands them to the [`EventSink`]. When the queue is full
//! the oldest event is dropped; recording never waits on the sink.

use crate::admin::Metrics;
use crate::error::EngineError;
use crate::Result;
use async_trait::async_trait;
use hub_common::RecordedEvent;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Durable storage for finalized events
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn append_event(&self, event: RecordedEvent) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RecorderStats {
    pub queued: usize,
    pub recorded: u64,
    pub dropped: u64,
    pub sink_failures: u64,
}

struct Shared {
    queue: Mutex<VecDeque<RecordedEvent>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    metrics: Arc<Metrics>,
}

impl Shared {
    fn pop(&self) -> Option<RecordedEvent> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
    }
}

#[derive(Clone)]
pub struct EventRecorder {
    shared: Arc<Shared>,
}

impl EventRecorder {
    pub fn new(capacity: usize, metrics: Arc<Metrics>) -> Self {
        Self {
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                notify: Notify::new(),
                closed: AtomicBool::new(false),
                metrics,
            }),
        }
    }

    /// Enqueue an event, evicting the oldest one when full
    pub fn record(&self, event: RecordedEvent) {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            shared.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.id(), "Recorder closed, event dropped");
            return;
        }

        let evicted = {
            let mut queue = shared
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let evicted = if queue.len() >= shared.capacity {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(event);
            evicted
        };

        if let Some(old) = evicted {
            shared.metrics.events_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(event_id = %old.id(), "Recorder queue full, dropped oldest event");
        }
        shared.notify.notify_one();
    }

    /// Start the drain task
    pub fn spawn(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            loop {
                match shared.pop() {
                    Some(event) => {
                        let id = event.id().to_string();
                        match sink.append_event(event).await {
                            Ok(()) => {
                                shared.metrics.events_recorded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                shared.metrics.sink_failures.fetch_add(1, Ordering::Relaxed);
                                warn!(event_id = %id, "Failed to record event: {}", e);
                            }
                        }
                    }
                    None if shared.closed.load(Ordering::Acquire) => break,
                    None => shared.notify.notified().await,
                }
            }
            debug!("Recorder drain task finished");
        })
    }

    /// Stop accepting events; the drain task exits once the queue is empty
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }

    pub fn stats(&self) -> RecorderStats {
        let queued = self
            .shared
            .queue
            .lock()
            .map(|q| q.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len());
        let metrics = &self.shared.metrics;
        RecorderStats {
            queued,
            recorded: metrics.events_recorded.load(Ordering::Relaxed),
            dropped: metrics.events_dropped.load(Ordering::Relaxed),
            sink_failures: metrics.sink_failures.load(Ordering::Relaxed),
        }
    }
}

/// Sink that keeps everything in memory
#[derive(Default)]
pub struct InMemoryEventSink {
    events: Mutex<Vec<RecordedEvent>>,
    failing: AtomicBool,
}

impl InMemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .map(|e| e.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    pub fn len(&self) -> usize {
        self.events().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every append fail until switched back
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventSink for InMemoryEventSink {
    async fn append_event(&self, event: RecordedEvent) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EngineError::Sink("in-memory sink set to fail".to_string()));
        }
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hub_common::LogEvent;

    fn log(message: &str) -> RecordedEvent {
        RecordedEvent::Log(LogEvent {
            id: message.to_string(),
            device_id: "D1".to_string(),
            source: "custom".to_string(),
            timestamp: chrono::Utc::now(),
            level: "info".to_string(),
            subsystem: None,
            category: None,
            logger_name: None,
            thread: None,
            file: None,
            function: None,
            line: None,
            message: message.to_string(),
            tags: Vec::new(),
            trace_id: None,
        })
    }

    #[tokio::test]
    async fn test_drop_oldest_when_full() {
        let metrics = Arc::new(Metrics::default());
        let recorder = EventRecorder::new(3, metrics.clone());
        for i in 0..5 {
            recorder.record(log(&format!("e{}", i)));
        }
        assert_eq!(recorder.stats().queued, 3);
        assert_eq!(recorder.stats().dropped, 2);

        let sink = Arc::new(InMemoryEventSink::new());
        let handle = recorder.spawn(sink.clone());
        recorder.close();
        handle.await.unwrap();

        let ids: Vec<String> = sink.events().iter().map(|e| e.id().to_string()).collect();
        assert_eq!(ids, vec!["e2", "e3", "e4"]);
        assert_eq!(recorder.stats().recorded, 3);
    }

    #[tokio::test]
    async fn test_sink_failures_are_counted() {
        let recorder = EventRecorder::new(8, Arc::new(Metrics::default()));
        let sink = Arc::new(InMemoryEventSink::new());
        sink.set_failing(true);
        let handle = recorder.spawn(sink.clone());

        recorder.record(log("lost"));
        recorder.close();
        handle.await.unwrap();

        let stats = recorder.stats();
        assert_eq!(stats.sink_failures, 1);
        assert_eq!(stats.recorded, 0);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_events_after_close_are_dropped() {
        let recorder = EventRecorder::new(8, Arc::new(Metrics::default()));
        recorder.close();
        recorder.record(log("late"));
        assert_eq!(recorder.stats().queued, 0);
        assert_eq!(recorder.stats().dropped, 1);
    }
}
