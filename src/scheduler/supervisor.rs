//! Retry and timeout supervisor.
//!
//! `tick` is idempotent and safe to run alongside claims and reports: every
//! reclaim is a conditional write against the snapshot the sweep read, and
//! a job that moved in the meantime is simply left alone.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::registry::NodeRegistry;
use crate::scheduler::job::{Job, JobStatus, ReclaimCause, ReclaimOutcome};
use crate::scheduler::lifecycle::JobLifecycle;
use crate::store::JobStore;

/// What a single tick changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub timed_out_requeued: usize,
    pub timed_out_failed: usize,
    pub nodes_offline: usize,
    pub reclaimed_requeued: usize,
    pub reclaimed_failed: usize,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    fn count(&mut self, cause: &ReclaimCause, outcome: ReclaimOutcome) {
        match (cause, outcome) {
            (ReclaimCause::Timeout, ReclaimOutcome::Requeued) => self.timed_out_requeued += 1,
            (ReclaimCause::Timeout, ReclaimOutcome::Failed) => self.timed_out_failed += 1,
            (ReclaimCause::NodeOffline(_), ReclaimOutcome::Requeued) => {
                self.reclaimed_requeued += 1
            }
            (ReclaimCause::NodeOffline(_), ReclaimOutcome::Failed) => self.reclaimed_failed += 1,
        }
    }
}

pub struct Supervisor {
    store: Arc<dyn JobStore>,
    registry: Arc<NodeRegistry>,
    lifecycle: Arc<JobLifecycle>,
    heartbeat_timeout: Duration,
}

impl Supervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<NodeRegistry>,
        lifecycle: Arc<JobLifecycle>,
        heartbeat_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            lifecycle,
            heartbeat_timeout,
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run both sweeps once: job timeouts, then node liveness and the
    /// reclaim of work held by OFFLINE nodes.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut report = TickReport::default();

        let active = self.store.jobs_by_status(&JobStatus::ACTIVE).await?;
        for job in active.iter().filter(|j| j.is_timed_out_at(now)) {
            self.reclaim(job, ReclaimCause::Timeout, now, &mut report).await?;
        }

        let offline = self.registry.sweep_liveness_at(self.heartbeat_timeout, now).await?;
        report.nodes_offline = offline.len();

        // Every OFFLINE node, not only the ones flipped just now: a tick that
        // stopped between the flip and the reclaim is finished here.
        for node in self.registry.offline_nodes().await? {
            for job in self.store.jobs_for_node(&node.id).await? {
                let cause = ReclaimCause::NodeOffline(node.id.clone());
                self.reclaim(&job, cause, now, &mut report).await?;
            }
        }

        if !report.is_empty() {
            tracing::info!(
                timed_out_requeued = report.timed_out_requeued,
                timed_out_failed = report.timed_out_failed,
                nodes_offline = report.nodes_offline,
                reclaimed_requeued = report.reclaimed_requeued,
                reclaimed_failed = report.reclaimed_failed,
                "Supervisor tick"
            );
        }
        Ok(report)
    }

    async fn reclaim(
        &self,
        job: &Job,
        cause: ReclaimCause,
        now: DateTime<Utc>,
        report: &mut TickReport,
    ) -> Result<()> {
        if let Some((_, outcome)) = self.lifecycle.reclaim(job, &cause, now).await? {
            report.count(&cause, outcome);
        }
        Ok(())
    }

    /// Tick every `interval` until `token` is cancelled. A failed tick is
    /// logged and the next one proceeds normally.
    pub async fn run(self: Arc<Self>, interval: Duration, token: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Supervisor stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(error = %e, "Supervisor tick failed");
                    }
                }
            }
        }
    }
}
