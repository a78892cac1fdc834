//! Lifecycle notifications.
//!
//! Every accepted state change is handed to an [`EventSink`]. Delivery to
//! subscribers is best-effort: a slow subscriber of the broadcast sink
//! misses events rather than blocking the scheduler.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::registry::Node;
use crate::scheduler::Job;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum SchedulerEvent {
    JobCreated(Job),
    JobUpdated(Job),
    JobResult(Job),
    NodeUpdated(Node),
}

impl SchedulerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::JobCreated(_) => "job_created",
            Self::JobUpdated(_) => "job_updated",
            Self::JobResult(_) => "job_result",
            Self::NodeUpdated(_) => "node_updated",
        }
    }
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: SchedulerEvent);
}

/// Fans events out to any number of in-process subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: SchedulerEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No event subscribers");
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn emit(&self, _event: SchedulerEvent) {}
}
