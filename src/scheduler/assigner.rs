use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::events::{EventSink, SchedulerEvent};
use crate::registry::NodeRegistry;
use crate::scheduler::job::{Job, JobStatus};
use crate::scheduler::queue::{AdmissionQueue, QueueKey};
use crate::store::{CasResult, JobStore, Versioned};

/// Hands queued jobs to pulling nodes.
///
/// The conditional QUEUED -> ASSIGNED write is the only thing that
/// decides ownership; the queue merely proposes candidates.
pub struct AssignmentEngine {
    store: Arc<dyn JobStore>,
    queue: Arc<AdmissionQueue>,
    registry: Arc<NodeRegistry>,
    events: Arc<dyn EventSink>,
}

impl AssignmentEngine {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<AdmissionQueue>,
        registry: Arc<NodeRegistry>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            events,
        }
    }

    pub async fn claim(
        &self,
        node_id: &str,
        capacity: usize,
        capabilities: &BTreeSet<String>,
    ) -> Result<Vec<Job>> {
        self.claim_at(node_id, capacity, capabilities, Utc::now())
            .await
    }

    /// Claim up to `capacity` queued jobs for `node_id`.
    ///
    /// Only job types in both `capabilities` and the node's registered
    /// capabilities are eligible; an empty `capabilities` means all of the
    /// node's. A node that is not accepting work, or is outside its
    /// availability window, gets nothing.
    pub async fn claim_at(
        &self,
        node_id: &str,
        capacity: usize,
        capabilities: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        if capacity == 0 {
            return Err(SchedulerError::InvalidSpec("capacity must be greater than 0".into()));
        }
        let node = self.registry.get(node_id).await?;
        if !node.status.accepts_work() {
            tracing::debug!(node_id, status = %node.status, "Node not accepting work");
            return Ok(Vec::new());
        }
        if !node.is_available_at(now) {
            tracing::debug!(node_id, "Node outside its availability window");
            return Ok(Vec::new());
        }

        let eligible: BTreeSet<String> = if capabilities.is_empty() {
            node.capabilities.clone()
        } else {
            capabilities.intersection(&node.capabilities).cloned().collect()
        };
        if eligible.is_empty() {
            return Ok(Vec::new());
        }

        let mut claimed = Vec::new();
        for key in self.queue.candidates(&eligible, capacity) {
            if let Some(job) = self.try_assign(&key, node_id, now).await? {
                claimed.push(job);
            }
        }

        if !claimed.is_empty() {
            tracing::info!(node_id, claimed = claimed.len(), capacity, "Jobs assigned");
        }
        Ok(claimed)
    }

    async fn try_assign(
        &self,
        key: &QueueKey,
        node_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        let Some(current) = self.store.get_job(&key.job_id).await? else {
            self.queue.remove_key(key);
            return Ok(None);
        };
        if current.status != JobStatus::Queued {
            tracing::debug!(
                job_id = %key.job_id,
                status = %current.status,
                "Stale queue entry skipped"
            );
            self.queue.remove_key(key);
            return Ok(None);
        }

        let mut next = current.clone();
        next.assign(node_id, now)?;
        match self.store.cas_job(&next, current.expected()).await? {
            CasResult::Success { revision } => {
                next.revision = revision;
                self.queue.remove_key(key);
                tracing::debug!(job_id = %next.id, node_id, "Job claimed");
                self.events.emit(SchedulerEvent::JobUpdated(next.clone()));
                Ok(Some(next))
            }
            CasResult::NotFound
            | CasResult::StateMismatch { .. }
            | CasResult::VersionConflict { .. } => {
                tracing::debug!(job_id = %key.job_id, node_id, "Lost claim race, skipped");
                Ok(None)
            }
        }
    }
}
