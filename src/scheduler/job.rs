use std::collections::BTreeSet;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::registry::NodeId;

/// Error code recorded when the supervisor gives up on a job, whether it
/// timed out or its node went offline.
pub const JOB_TIMEOUT: &str = "JOB_TIMEOUT";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Assigned,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub const ACTIVE: [JobStatus; 2] = [JobStatus::Assigned, JobStatus::Processing];
    pub const TERMINAL: [JobStatus; 3] =
        [JobStatus::Completed, JobStatus::Failed, JobStatus::Canceled];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }

    /// Owned by a node: `assigned_node_id` is set exactly in these states.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Assigned | Self::Processing)
    }

    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, target),
            (Queued, Assigned)
                | (Assigned, Processing)
                | (Assigned, Completed)
                | (Assigned, Failed)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Queued, Canceled)
                | (Assigned, Canceled)
                | (Processing, Canceled)
                | (Assigned, Queued)
                | (Processing, Queued)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(Self::Queued),
            "assigned" => Ok(Self::Assigned),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(SchedulerError::InvalidSpec(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// Structured failure information attached to a FAILED job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
}

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            details: None,
            retry_count: None,
        }
    }
}

/// Why the supervisor is taking a job back from its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReclaimCause {
    Timeout,
    NodeOffline(NodeId),
}

impl ReclaimCause {
    fn exhausted_error(&self, retry_count: u32) -> JobError {
        let (message, details) = match self {
            Self::Timeout => (format!("Job timed out after {retry_count} retries"), None),
            Self::NodeOffline(node_id) => (
                format!("Node {node_id} went offline; job abandoned after {retry_count} retries"),
                Some(serde_json::json!({ "node_id": node_id })),
            ),
        };
        JobError {
            code: Some(JOB_TIMEOUT.to_string()),
            message,
            details,
            retry_count: Some(retry_count),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimOutcome {
    Requeued,
    Failed,
}

/// A job submission as received from a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(alias = "type")]
    pub job_type: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_timeout_seconds(mut self, timeout_seconds: u64) -> Self {
        self.timeout_seconds = Some(timeout_seconds);
        self
    }

    pub fn with_parameter(mut self, key: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(key.into(), value);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Range and capability checks applied before a job is admitted.
    pub fn validate(&self, config: &SchedulerConfig) -> Result<()> {
        let job_type = self.job_type.trim();
        if job_type.is_empty() {
            return Err(SchedulerError::InvalidSpec("job_type must not be empty".into()));
        }
        if !config.job_types.is_empty() && !config.job_types.iter().any(|t| t == job_type) {
            return Err(SchedulerError::InvalidSpec(format!(
                "unknown job_type '{job_type}', expected one of {:?}",
                config.job_types
            )));
        }
        if let Some(priority) = self.priority {
            if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
                return Err(SchedulerError::InvalidSpec(format!(
                    "priority must be between {MIN_PRIORITY} and {MAX_PRIORITY}, got {priority}"
                )));
            }
        }
        if let Some(max_retries) = self.max_retries {
            if max_retries > config.max_retries_limit {
                return Err(SchedulerError::InvalidSpec(format!(
                    "max_retries must be at most {}, got {max_retries}",
                    config.max_retries_limit
                )));
            }
        }
        if let Some(timeout) = self.timeout_seconds {
            if timeout == 0 || timeout > config.max_timeout_seconds {
                return Err(SchedulerError::InvalidSpec(format!(
                    "timeout_seconds must be between 1 and {}, got {timeout}",
                    config.max_timeout_seconds
                )));
            }
        }
        if self.tags.iter().any(|t| t.trim().is_empty()) {
            return Err(SchedulerError::InvalidSpec("tags must not be empty".into()));
        }
        Ok(())
    }
}

/// How a node finished (or checkpointed) a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Failed,
    Partial,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: ResultStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<JobError>,
    #[serde(default)]
    pub processing_time_seconds: f64,
}

impl JobOutcome {
    pub fn completed(result: Value) -> Self {
        Self {
            status: ResultStatus::Completed,
            result: Some(result),
            error: None,
            processing_time_seconds: 0.0,
        }
    }

    pub fn failed(error: JobError) -> Self {
        Self {
            status: ResultStatus::Failed,
            result: None,
            error: Some(error),
            processing_time_seconds: 0.0,
        }
    }

    pub fn partial(result: Value) -> Self {
        Self {
            status: ResultStatus::Partial,
            result: Some(result),
            error: None,
            processing_time_seconds: 0.0,
        }
    }

    pub fn with_processing_time(mut self, seconds: f64) -> Self {
        self.processing_time_seconds = seconds;
        self
    }

    fn result_or_empty(&self) -> Value {
        self.result
            .clone()
            .unwrap_or_else(|| Value::Object(Map::new()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub job_type: String,
    pub priority: u8,
    pub status: JobStatus,
    pub status_message: Option<String>,
    pub parameters: Map<String, Value>,
    pub result: Option<Value>,
    pub error: Option<JobError>,
    pub submitted_by: String,
    pub assigned_node_id: Option<NodeId>,
    pub executed_by: Option<NodeId>,
    pub progress: f64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub timeout_seconds: u64,
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Admission-queue ordering timestamp; equals `created_at` until a retry refreshes it.
    pub queued_at: DateTime<Utc>,
    /// Optimistic concurrency token, bumped by the store on every committed write.
    pub revision: u64,
}

impl Job {
    /// Build a QUEUED job from a spec that already passed [`JobSpec::validate`].
    pub fn new(
        spec: JobSpec,
        submitted_by: impl Into<String>,
        config: &SchedulerConfig,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type.trim().to_string(),
            priority: spec.priority.unwrap_or(config.default_priority),
            status: JobStatus::Queued,
            status_message: None,
            parameters: spec.parameters,
            result: None,
            error: None,
            submitted_by: submitted_by.into(),
            assigned_node_id: None,
            executed_by: None,
            progress: 0.0,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            max_retries: spec.max_retries.unwrap_or(config.default_max_retries),
            timeout_seconds: spec
                .timeout_seconds
                .unwrap_or(config.default_timeout_seconds),
            tags: spec.tags,
            created_at: now,
            updated_at: now,
            queued_at: now,
            revision: 0,
        }
    }

    fn transition(&mut self, target: JobStatus, action: &'static str) -> Result<()> {
        if !self.status.can_transition_to(target) {
            return Err(SchedulerError::InvalidState {
                id: self.id,
                status: self.status,
                action,
            });
        }
        self.status = target;
        Ok(())
    }

    /// Ensure `node_id` currently owns this job.
    pub fn check_owner(&self, node_id: &str) -> Result<()> {
        if self.assigned_node_id.as_deref() != Some(node_id) {
            return Err(SchedulerError::NodeMismatch {
                job_id: self.id,
                node_id: node_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn assign(&mut self, node_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Assigned, "assign")?;
        self.assigned_node_id = Some(node_id.to_string());
        self.started_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Record advisory progress; the first report moves ASSIGNED to PROCESSING.
    pub fn record_progress(
        &mut self,
        progress: f64,
        message: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.status == JobStatus::Assigned {
            self.transition(JobStatus::Processing, "update progress of")?;
        } else if self.status != JobStatus::Processing {
            return Err(SchedulerError::InvalidState {
                id: self.id,
                status: self.status,
                action: "update progress of",
            });
        }
        self.progress = progress;
        if message.is_some() {
            self.status_message = message;
        }
        self.updated_at = now;
        Ok(())
    }

    /// Apply a node's report. PARTIAL only checkpoints `result`.
    pub fn apply_outcome(
        &mut self,
        node_id: &str,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match outcome.status {
            ResultStatus::Completed => {
                self.transition(JobStatus::Completed, "complete")?;
                self.result = Some(outcome.result_or_empty());
                self.progress = 100.0;
                self.finish(node_id, now);
            }
            ResultStatus::Failed => {
                self.transition(JobStatus::Failed, "fail")?;
                self.error = Some(
                    outcome
                        .error
                        .clone()
                        .unwrap_or_else(|| JobError::new("Unknown error")),
                );
                if outcome.result.is_some() {
                    self.result = outcome.result.clone();
                }
                self.finish(node_id, now);
            }
            ResultStatus::Partial => {
                if !self.status.is_active() {
                    return Err(SchedulerError::InvalidState {
                        id: self.id,
                        status: self.status,
                        action: "checkpoint",
                    });
                }
                self.result = Some(outcome.result_or_empty());
                self.updated_at = now;
            }
        }
        Ok(())
    }

    fn finish(&mut self, node_id: &str, now: DateTime<Utc>) {
        self.executed_by = Some(node_id.to_string());
        self.assigned_node_id = None;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub fn cancel(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.transition(JobStatus::Canceled, "cancel")?;
        self.assigned_node_id = None;
        self.completed_at = Some(now);
        self.updated_at = now;
        Ok(())
    }

    /// Take the job back from its node: requeue while retries remain, otherwise fail.
    pub fn reclaim(&mut self, cause: &ReclaimCause, now: DateTime<Utc>) -> Result<ReclaimOutcome> {
        if !self.status.is_active() {
            return Err(SchedulerError::InvalidState {
                id: self.id,
                status: self.status,
                action: "reclaim",
            });
        }
        if self.retry_count < self.max_retries {
            self.transition(JobStatus::Queued, "requeue")?;
            self.retry_count += 1;
            self.assigned_node_id = None;
            self.started_at = None;
            self.progress = 0.0;
            self.queued_at = now;
            self.updated_at = now;
            Ok(ReclaimOutcome::Requeued)
        } else {
            self.transition(JobStatus::Failed, "fail")?;
            self.error = Some(cause.exhausted_error(self.retry_count));
            self.assigned_node_id = None;
            self.completed_at = Some(now);
            self.updated_at = now;
            Ok(ReclaimOutcome::Failed)
        }
    }

    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        let secs = i64::try_from(self.timeout_seconds).unwrap_or(i64::MAX);
        self.started_at
            .and_then(|started| started.checked_add_signed(Duration::try_seconds(secs)?))
    }

    pub fn is_timed_out_at(&self, now: DateTime<Utc>) -> bool {
        self.status.is_active() && self.deadline().is_some_and(|deadline| now > deadline)
    }
}
