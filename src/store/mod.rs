//! Durable storage contract for jobs and nodes.
//!
//! The scheduler never mutates a record in place: it reads a snapshot,
//! computes the next state, and commits it with a conditional write that
//! only succeeds if the stored record still has the expected status and
//! revision. That single primitive is what keeps concurrent claimers,
//! cancellations and the supervisor from double-applying a transition.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::registry::{Node, NodeStatus};
use crate::scheduler::{Job, JobStatus};

pub use memory::InMemoryStore;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;

/// Precondition for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expected<S> {
    pub status: S,
    pub revision: u64,
}

/// Result of a compare-and-swap operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult<S> {
    /// Committed; carries the record's new revision.
    Success { revision: u64 },
    NotFound,
    /// The stored status no longer matches the expected one.
    StateMismatch { actual: S },
    /// Same status, but the record was written by someone else in between.
    VersionConflict { actual: u64 },
}

/// Records that carry a status and an optimistic concurrency revision.
pub trait Versioned: Clone + Send + Sync {
    type Status: Copy + PartialEq + Send + Sync + std::fmt::Debug;

    fn status(&self) -> Self::Status;
    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);

    fn expected(&self) -> Expected<Self::Status> {
        Expected {
            status: self.status(),
            revision: self.revision(),
        }
    }
}

impl Versioned for Job {
    type Status = JobStatus;

    fn status(&self) -> JobStatus {
        self.status
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

impl Versioned for Node {
    type Status = NodeStatus;

    fn status(&self) -> NodeStatus {
        self.status
    }

    fn revision(&self) -> u64 {
        self.revision
    }

    fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    #[serde(default)]
    pub statuses: Vec<JobStatus>,
    #[serde(default)]
    pub job_type: Option<String>,
    #[serde(default)]
    pub submitted_by: Option<String>,
    /// Matches jobs carrying any of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub assigned_node_id: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.job_type.as_ref().map_or(true, |t| &job.job_type == t)
            && self
                .submitted_by
                .as_ref()
                .map_or(true, |s| &job.submitted_by == s)
            && (self.tags.is_empty() || self.tags.iter().any(|t| job.tags.contains(t)))
            && self
                .assigned_node_id
                .as_ref()
                .map_or(true, |n| job.assigned_node_id.as_ref() == Some(n))
    }

    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeFilter {
    #[serde(default)]
    pub statuses: Vec<NodeStatus>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: usize,
}

impl NodeFilter {
    pub fn matches(&self, node: &Node) -> bool {
        self.statuses.is_empty() || self.statuses.contains(&node.status)
    }

    pub fn page_size(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE)
    }
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. Fails with `Conflict` if the id already exists.
    async fn insert_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>>;

    /// Commit `job` if the stored record still matches `expected`.
    async fn cas_job(
        &self,
        job: &Job,
        expected: Expected<JobStatus>,
    ) -> Result<CasResult<JobStatus>>;

    /// Jobs in any of `statuses`, ordered by priority (highest first) then
    /// ordering timestamp (oldest first).
    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>>;

    /// Active (ASSIGNED/PROCESSING) jobs whose `assigned_node_id` is `node_id`.
    async fn jobs_for_node(&self, node_id: &str) -> Result<Vec<Job>>;

    /// Filtered listing, newest first.
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>>;

    /// Delete terminal jobs finished before `cutoff`. Retention is driven
    /// from outside the scheduling core.
    async fn purge_finished_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Insert a new node. Fails with `Conflict` if the id already exists.
    async fn insert_node(&self, node: &Node) -> Result<()>;

    async fn get_node(&self, id: &str) -> Result<Option<Node>>;

    async fn cas_node(
        &self,
        node: &Node,
        expected: Expected<NodeStatus>,
    ) -> Result<CasResult<NodeStatus>>;

    async fn nodes_by_status(&self, statuses: &[NodeStatus]) -> Result<Vec<Node>>;

    /// Filtered listing, most recent heartbeat first.
    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Page<Node>>;
}
