use thiserror::Error;
use uuid::Uuid;

use crate::registry::NodeId;
use crate::scheduler::JobStatus;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Invalid job specification: {0}")]
    InvalidSpec(String),

    #[error("Cannot {action} job {id} in status {status}")]
    InvalidState {
        id: Uuid,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Admission queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Job {job_id} is not assigned to node {node_id}")]
    NodeMismatch { job_id: Uuid, node_id: NodeId },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl SchedulerError {
    pub fn job_not_found(id: &Uuid) -> Self {
        Self::NotFound {
            kind: "Job",
            id: id.to_string(),
        }
    }

    pub fn node_not_found(id: &str) -> Self {
        Self::NotFound {
            kind: "Node",
            id: id.to_string(),
        }
    }

    /// Stable machine-readable code, used by the HTTP surface.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidSpec(_) => "INVALID_SPEC",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::QueueFull { .. } => "QUEUE_FULL",
            Self::NodeMismatch { .. } => "NODE_MISMATCH",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::Conflict(_) => "CONFLICT",
            Self::Storage(_) => "STORAGE",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
