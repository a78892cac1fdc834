pub mod assigner;
pub mod job;
pub mod lifecycle;
pub mod queue;
pub mod supervisor;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::access::{AccessPolicy, AllowAll, Requester};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::events::{EventSink, NoopEventSink};
use crate::registry::{CurrentLoad, Node, NodeRegistration, NodeRegistry, NodeStatus};
use crate::store::{InMemoryStore, JobFilter, JobStore, NodeFilter, NodeStore, Page};

pub use assigner::AssignmentEngine;
pub use job::{
    Job, JobError, JobOutcome, JobSpec, JobStatus, ReclaimCause, ReclaimOutcome, ResultStatus,
};
pub use lifecycle::JobLifecycle;
pub use queue::{AdmissionQueue, QueueKey, QueueStats};
pub use supervisor::{Supervisor, TickReport};

/// The scheduling core, wired together over a pair of stores.
///
/// Cheap to share behind an `Arc`; every method takes `&self`.
pub struct Scheduler {
    config: SchedulerConfig,
    queue: Arc<AdmissionQueue>,
    registry: Arc<NodeRegistry>,
    lifecycle: Arc<JobLifecycle>,
    assigner: AssignmentEngine,
    supervisor: Arc<Supervisor>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        job_store: Arc<dyn JobStore>,
        node_store: Arc<dyn NodeStore>,
        events: Arc<dyn EventSink>,
    ) -> Result<Self> {
        Self::with_access_policy(config, job_store, node_store, events, Arc::new(AllowAll))
    }

    pub fn with_access_policy(
        config: SchedulerConfig,
        job_store: Arc<dyn JobStore>,
        node_store: Arc<dyn NodeStore>,
        events: Arc<dyn EventSink>,
        access: Arc<dyn AccessPolicy>,
    ) -> Result<Self> {
        if config.max_queue_size == 0 {
            return Err(SchedulerError::InvalidSpec("max_queue_size must be greater than 0".into()));
        }
        let queue = Arc::new(AdmissionQueue::new(config.max_queue_size));
        let registry = Arc::new(NodeRegistry::new(node_store, events.clone()));
        let lifecycle = Arc::new(JobLifecycle::new(
            job_store.clone(),
            queue.clone(),
            registry.clone(),
            events.clone(),
            access,
            config.clone(),
        ));
        let assigner =
            AssignmentEngine::new(job_store.clone(), queue.clone(), registry.clone(), events);
        let supervisor = Arc::new(Supervisor::new(
            job_store,
            registry.clone(),
            lifecycle.clone(),
            config.heartbeat_timeout,
        ));

        Ok(Self {
            config,
            queue,
            registry,
            lifecycle,
            assigner,
            supervisor,
        })
    }

    /// A scheduler over a fresh in-memory store with no event subscribers.
    pub fn in_memory(config: SchedulerConfig) -> Result<Self> {
        let store = Arc::new(InMemoryStore::new());
        Self::new(config, store.clone(), store, Arc::new(NoopEventSink))
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        self.supervisor.clone()
    }

    /// Rebuild in-memory state from the store after a restart.
    pub async fn recover(&self) -> Result<usize> {
        self.lifecycle.recover().await
    }

    // Jobs

    pub async fn submit(&self, spec: JobSpec, submitted_by: &str) -> Result<Job> {
        self.lifecycle.submit(spec, submitted_by).await
    }

    pub async fn submit_at(
        &self,
        spec: JobSpec,
        submitted_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        self.lifecycle.submit_at(spec, submitted_by, now).await
    }

    pub async fn cancel(&self, job_id: &Uuid, requester: &Requester) -> Result<Job> {
        self.lifecycle.cancel(job_id, requester).await
    }

    pub async fn get_job(&self, job_id: &Uuid) -> Result<Job> {
        self.lifecycle.get(job_id).await
    }

    pub async fn get_job_for(&self, job_id: &Uuid, requester: &Requester) -> Result<Job> {
        self.lifecycle.get_for(job_id, requester).await
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>> {
        self.lifecycle.list(filter).await
    }

    pub async fn list_jobs_for(
        &self,
        filter: &JobFilter,
        requester: &Requester,
    ) -> Result<Page<Job>> {
        self.lifecycle.list_for(filter, requester).await
    }

    pub async fn claim(
        &self,
        node_id: &str,
        capacity: usize,
        capabilities: &BTreeSet<String>,
    ) -> Result<Vec<Job>> {
        self.assigner.claim(node_id, capacity, capabilities).await
    }

    pub async fn claim_at(
        &self,
        node_id: &str,
        capacity: usize,
        capabilities: &BTreeSet<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>> {
        self.assigner
            .claim_at(node_id, capacity, capabilities, now)
            .await
    }

    pub async fn report_result(
        &self,
        job_id: &Uuid,
        node_id: &str,
        outcome: JobOutcome,
    ) -> Result<Job> {
        self.lifecycle.report_result(job_id, node_id, outcome).await
    }

    pub async fn update_progress(
        &self,
        job_id: &Uuid,
        node_id: &str,
        progress: f64,
        message: Option<String>,
    ) -> Result<Job> {
        self.lifecycle
            .update_progress(job_id, node_id, progress, message)
            .await
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.lifecycle.queue_stats()
    }

    pub async fn purge_finished_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.lifecycle.purge_finished(cutoff).await
    }

    // Nodes

    pub async fn register(&self, registration: NodeRegistration) -> Result<Node> {
        self.registry.register(registration).await
    }

    pub async fn register_at(
        &self,
        registration: NodeRegistration,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        self.registry.register_at(registration, now).await
    }

    pub async fn heartbeat(
        &self,
        node_id: &str,
        status: NodeStatus,
        load: Option<CurrentLoad>,
    ) -> Result<Node> {
        self.registry.heartbeat(node_id, status, load).await
    }

    pub async fn heartbeat_at(
        &self,
        node_id: &str,
        status: NodeStatus,
        load: Option<CurrentLoad>,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        self.registry.heartbeat_at(node_id, status, load, now).await
    }

    pub async fn get_node(&self, node_id: &str) -> Result<Node> {
        self.registry.get(node_id).await
    }

    pub async fn list_nodes(&self, filter: &NodeFilter) -> Result<Page<Node>> {
        self.registry.list(filter).await
    }

    pub async fn list_available(&self, capabilities: &BTreeSet<String>) -> Result<Vec<Node>> {
        self.registry.list_available(capabilities).await
    }

    pub async fn sweep_liveness_at(&self, now: DateTime<Utc>) -> Result<Vec<Node>> {
        self.registry
            .sweep_liveness_at(self.config.heartbeat_timeout, now)
            .await
    }

    // Supervision

    pub async fn tick(&self) -> Result<TickReport> {
        self.supervisor.tick().await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        self.supervisor.tick_at(now).await
    }
}
