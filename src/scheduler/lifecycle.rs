//! Job lifecycle: submission, cancellation, result and progress reports.
//!
//! Each operation reads a snapshot, applies a transition on a copy and
//! commits it with a conditional write. When the write loses a race the
//! snapshot is re-read and every precondition is checked again.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::access::{AccessPolicy, Requester};
use crate::config::SchedulerConfig;
use crate::error::{Result, SchedulerError};
use crate::events::{EventSink, SchedulerEvent};
use crate::registry::{NodeRegistry, MAX_CAS_ATTEMPTS};
use crate::scheduler::job::{
    Job, JobOutcome, JobSpec, JobStatus, ReclaimCause, ReclaimOutcome, ResultStatus,
};
use crate::scheduler::queue::{AdmissionQueue, QueueKey, QueueStats};
use crate::store::{CasResult, JobFilter, JobStore, Page, Versioned};

pub struct JobLifecycle {
    store: Arc<dyn JobStore>,
    queue: Arc<AdmissionQueue>,
    registry: Arc<NodeRegistry>,
    events: Arc<dyn EventSink>,
    access: Arc<dyn AccessPolicy>,
    config: SchedulerConfig,
}

impl JobLifecycle {
    pub fn new(
        store: Arc<dyn JobStore>,
        queue: Arc<AdmissionQueue>,
        registry: Arc<NodeRegistry>,
        events: Arc<dyn EventSink>,
        access: Arc<dyn AccessPolicy>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            queue,
            registry,
            events,
            access,
            config,
        }
    }

    pub async fn submit(&self, spec: JobSpec, submitted_by: &str) -> Result<Job> {
        self.submit_at(spec, submitted_by, Utc::now()).await
    }

    /// Validate and admit a new job. A full queue rejects the submission
    /// before anything is written.
    pub async fn submit_at(
        &self,
        spec: JobSpec,
        submitted_by: &str,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        spec.validate(&self.config)?;
        let slot = match self.queue.reserve() {
            Ok(slot) => slot,
            Err(e) => {
                tracing::warn!(
                    job_type = %spec.job_type,
                    capacity = self.queue.capacity(),
                    "Queue full, submission rejected"
                );
                return Err(e);
            }
        };

        let job = Job::new(spec, submitted_by, &self.config, now);
        self.store.insert_job(&job).await?;
        let key = slot.commit(&job);
        self.settle_queue_entry(&key).await;

        tracing::info!(
            job_id = %job.id,
            job_type = %job.job_type,
            priority = job.priority,
            submitted_by,
            "Job submitted"
        );
        self.events.emit(SchedulerEvent::JobCreated(job.clone()));
        Ok(job)
    }

    pub async fn get(&self, job_id: &Uuid) -> Result<Job> {
        self.store
            .get_job(job_id)
            .await?
            .ok_or_else(|| SchedulerError::job_not_found(job_id))
    }

    /// Fetch a job on behalf of a requester.
    pub async fn get_for(&self, job_id: &Uuid, requester: &Requester) -> Result<Job> {
        let job = self.get(job_id).await?;
        self.access.authorize_view(requester, &job)?;
        Ok(job)
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Page<Job>> {
        self.store.list_jobs(filter).await
    }

    /// List jobs visible to a requester.
    pub async fn list_for(&self, filter: &JobFilter, requester: &Requester) -> Result<Page<Job>> {
        match self.access.listing_scope(requester) {
            Some(submitter) => {
                let scoped = JobFilter {
                    submitted_by: Some(submitter),
                    ..filter.clone()
                };
                self.store.list_jobs(&scoped).await
            }
            None => self.store.list_jobs(filter).await,
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Cancel a non-terminal job. If the job changes status between the
    /// read and the write, the cancel fails rather than overriding it.
    pub async fn cancel(&self, job_id: &Uuid, requester: &Requester) -> Result<Job> {
        let mut observed: Option<JobStatus> = None;
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(job_id).await?;
            match observed {
                None => self.access.authorize_cancel(requester, &current)?,
                Some(status) if status != current.status => {
                    return Err(SchedulerError::InvalidState {
                        id: *job_id,
                        status: current.status,
                        action: "cancel",
                    });
                }
                Some(_) => {}
            }
            observed = Some(current.status);

            let now = Utc::now();
            let mut next = current.clone();
            next.cancel(now)?;

            match self.store.cas_job(&next, current.expected()).await? {
                CasResult::Success { revision } => {
                    next.revision = revision;
                    if current.status == JobStatus::Queued {
                        self.queue.remove(job_id);
                    }
                    tracing::info!(
                        job_id = %job_id,
                        previous = %current.status,
                        requester = %requester.id,
                        "Job canceled"
                    );
                    self.events.emit(SchedulerEvent::JobUpdated(next.clone()));
                    return Ok(next);
                }
                CasResult::NotFound => return Err(SchedulerError::job_not_found(job_id)),
                CasResult::StateMismatch { actual } => {
                    return Err(SchedulerError::InvalidState {
                        id: *job_id,
                        status: actual,
                        action: "cancel",
                    });
                }
                CasResult::VersionConflict { .. } => {
                    tracing::debug!(job_id = %job_id, "Cancel lost a write race, retrying");
                }
            }
        }
        Err(SchedulerError::Conflict(format!("job {job_id} is being updated concurrently")))
    }

    /// Apply a node's final (or partial) report. Only the node that
    /// currently owns the job may report.
    pub async fn report_result(
        &self,
        job_id: &Uuid,
        node_id: &str,
        outcome: JobOutcome,
    ) -> Result<Job> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(job_id).await?;
            current.check_owner(node_id)?;

            let now = Utc::now();
            let mut next = current.clone();
            next.apply_outcome(node_id, &outcome, now)?;

            match self.store.cas_job(&next, current.expected()).await? {
                CasResult::Success { revision } => {
                    next.revision = revision;
                    self.after_result(&next, node_id, &outcome, now).await;
                    return Ok(next);
                }
                CasResult::NotFound => return Err(SchedulerError::job_not_found(job_id)),
                CasResult::StateMismatch { .. } | CasResult::VersionConflict { .. } => {
                    tracing::debug!(
                        job_id = %job_id,
                        node_id,
                        "Result report lost a write race, retrying"
                    );
                }
            }
        }
        Err(SchedulerError::Conflict(format!("job {job_id} is being updated concurrently")))
    }

    async fn after_result(
        &self,
        job: &Job,
        node_id: &str,
        outcome: &JobOutcome,
        now: DateTime<Utc>,
    ) {
        match outcome.status {
            ResultStatus::Completed | ResultStatus::Failed => {
                let success = outcome.status == ResultStatus::Completed;
                if success {
                    tracing::info!(job_id = %job.id, node_id, "Job completed");
                } else {
                    tracing::warn!(
                        job_id = %job.id,
                        node_id,
                        error = job.error.as_ref().map(|e| e.message.as_str()).unwrap_or_default(),
                        "Job failed"
                    );
                }
                if let Err(e) = self
                    .registry
                    .record_job_outcome(node_id, success, outcome.processing_time_seconds, now)
                    .await
                {
                    tracing::error!(node_id, error = %e, "Failed to update node statistics");
                }
            }
            ResultStatus::Partial => {
                tracing::debug!(job_id = %job.id, node_id, "Partial result recorded");
            }
        }
        self.events.emit(SchedulerEvent::JobResult(job.clone()));
    }

    /// Record advisory progress (0 to 100) from the owning node.
    pub async fn update_progress(
        &self,
        job_id: &Uuid,
        node_id: &str,
        progress: f64,
        message: Option<String>,
    ) -> Result<Job> {
        if !progress.is_finite() || !(0.0..=100.0).contains(&progress) {
            return Err(SchedulerError::InvalidSpec(format!(
                "progress must be between 0 and 100, got {progress}"
            )));
        }
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(job_id).await?;
            current.check_owner(node_id)?;

            let mut next = current.clone();
            next.record_progress(progress, message.clone(), Utc::now())?;

            match self.store.cas_job(&next, current.expected()).await? {
                CasResult::Success { revision } => {
                    next.revision = revision;
                    tracing::debug!(job_id = %job_id, node_id, progress, "Progress updated");
                    self.events.emit(SchedulerEvent::JobUpdated(next.clone()));
                    return Ok(next);
                }
                CasResult::NotFound => return Err(SchedulerError::job_not_found(job_id)),
                CasResult::StateMismatch { .. } | CasResult::VersionConflict { .. } => {}
            }
        }
        Err(SchedulerError::Conflict(format!("job {job_id} is being updated concurrently")))
    }

    /// Take an active job back from its node. Returns `None` when the job
    /// changed since `current` was read; the caller skips it.
    pub(crate) async fn reclaim(
        &self,
        current: &Job,
        cause: &ReclaimCause,
        now: DateTime<Utc>,
    ) -> Result<Option<(Job, ReclaimOutcome)>> {
        let mut next = current.clone();
        let outcome = next.reclaim(cause, now)?;

        match self.store.cas_job(&next, current.expected()).await? {
            CasResult::Success { revision } => {
                next.revision = revision;
                match outcome {
                    ReclaimOutcome::Requeued => {
                        let key = self.queue.push(&next);
                        self.settle_queue_entry(&key).await;
                        tracing::warn!(
                            job_id = %next.id,
                            cause = ?cause,
                            retry_count = next.retry_count,
                            max_retries = next.max_retries,
                            "Job requeued"
                        );
                    }
                    ReclaimOutcome::Failed => {
                        tracing::error!(
                            job_id = %next.id,
                            cause = ?cause,
                            retry_count = next.retry_count,
                            "Job failed after exhausting retries"
                        );
                    }
                }
                self.events.emit(SchedulerEvent::JobUpdated(next.clone()));
                Ok(Some((next, outcome)))
            }
            CasResult::NotFound
            | CasResult::StateMismatch { .. }
            | CasResult::VersionConflict { .. } => {
                tracing::debug!(
                    job_id = %current.id,
                    "Job changed before it could be reclaimed, skipped"
                );
                Ok(None)
            }
        }
    }

    /// The store write and the queue insert are not atomic: a cancel landing
    /// between them finds no entry to remove. Re-read after inserting and
    /// drop the entry if the job has already left QUEUED.
    async fn settle_queue_entry(&self, key: &QueueKey) {
        match self.store.get_job(&key.job_id).await {
            Ok(Some(job)) if job.status == JobStatus::Queued => {}
            Ok(_) => {
                if self.queue.remove_key(key) {
                    tracing::debug!(job_id = %key.job_id, "Job left QUEUED while being indexed");
                }
            }
            // Claims drop entries whose job is no longer QUEUED.
            Err(e) => {
                tracing::warn!(job_id = %key.job_id, error = %e, "Failed to re-read queued job");
            }
        }
    }

    /// Rebuild the admission queue from the store's QUEUED jobs.
    pub async fn recover(&self) -> Result<usize> {
        let queued = self.store.jobs_by_status(&[JobStatus::Queued]).await?;
        let restored = self.queue.restore(&queued);
        tracing::info!(restored, "Admission queue restored from store");
        Ok(restored)
    }

    /// Delete terminal jobs finished before `cutoff`.
    pub async fn purge_finished(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let purged = self.store.purge_finished_jobs(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "Purged finished jobs");
        }
        Ok(purged)
    }
}
