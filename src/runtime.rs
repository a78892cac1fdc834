use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::access::SubmitterOrAdmin;
use crate::api::{run_api, ApiState};
use crate::config::RuntimeConfig;
use crate::error::Result;
use crate::events::BroadcastEventSink;
use crate::scheduler::Scheduler;
use crate::store::InMemoryStore;

/// A scheduler process: core, timers and HTTP surface.
pub struct Runtime {
    config: RuntimeConfig,
    scheduler: Arc<Scheduler>,
    events: BroadcastEventSink,
}

impl Runtime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let events = BroadcastEventSink::new(config.event_buffer);
        let store = Arc::new(InMemoryStore::new());
        let scheduler = Scheduler::with_access_policy(
            config.scheduler.clone(),
            store.clone(),
            store,
            Arc::new(events.clone()),
            Arc::new(SubmitterOrAdmin),
        )?;
        Ok(Self {
            config,
            scheduler: Arc::new(scheduler),
            events,
        })
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            scheduler: self.scheduler.clone(),
            events: self.events.clone(),
        }
    }

    /// Run until `token` is cancelled.
    ///
    /// 1. Rebuilds the admission queue from the store
    /// 2. Spawns the supervisor timer
    /// 3. Spawns the retention timer
    /// 4. Serves the HTTP API (blocking)
    ///
    /// # Errors
    ///
    /// Returns an error if recovery fails or the API server cannot bind.
    pub async fn run(
        self,
        token: CancellationToken,
    ) -> std::result::Result<(), Box<dyn std::error::Error>> {
        self.scheduler.recover().await?;

        let supervisor = self.scheduler.supervisor();
        let supervisor_handle =
            tokio::spawn(supervisor.run(self.config.tick_interval, token.clone()));

        let retention_handle = tokio::spawn(retention_loop(
            self.scheduler.clone(),
            self.config.job_retention,
            self.config.retention_interval,
            token.clone(),
        ));

        let served = run_api(self.config.listen_addr, self.api_state(), token.clone()).await;
        token.cancel();

        let _ = supervisor_handle.await;
        let _ = retention_handle.await;
        tracing::info!("Scheduler stopped");
        served.map_err(Into::into)
    }
}

/// Periodically delete terminal jobs older than `retention`.
async fn retention_loop(
    scheduler: Arc<Scheduler>,
    retention: Duration,
    interval: Duration,
    token: CancellationToken,
) {
    let Ok(retention) = chrono::Duration::from_std(retention) else {
        tracing::info!(retention = ?retention, "Job retention unbounded, finished jobs are kept");
        return;
    };
    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                // A cutoff before the earliest representable time purges nothing.
                let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
                    continue;
                };
                if let Err(e) = scheduler.purge_finished_jobs(cutoff).await {
                    tracing::error!(error = %e, "Retention sweep failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Requester;
    use crate::config::SchedulerConfig;
    use crate::scheduler::JobSpec;
    use uuid::Uuid;

    async fn scheduler_with_finished_job() -> (Arc<Scheduler>, Uuid) {
        let scheduler = Arc::new(Scheduler::in_memory(SchedulerConfig::default()).unwrap());
        let job = scheduler.submit(JobSpec::new("ocr"), "alice").await.unwrap();
        scheduler
            .cancel(&job.id, &Requester::user("alice"))
            .await
            .unwrap();
        (scheduler, job.id)
    }

    #[tokio::test]
    async fn unbounded_retention_returns_immediately() {
        let (scheduler, job_id) = scheduler_with_finished_job().await;
        let sweep = retention_loop(
            scheduler.clone(),
            Duration::MAX,
            Duration::from_millis(5),
            CancellationToken::new(),
        );
        tokio::time::timeout(Duration::from_secs(1), sweep)
            .await
            .unwrap();
        assert!(scheduler.get_job(&job_id).await.is_ok());
    }

    #[tokio::test]
    async fn retention_beyond_calendar_range_purges_nothing() {
        let (scheduler, job_id) = scheduler_with_finished_job().await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(retention_loop(
            scheduler.clone(),
            Duration::from_secs(1 << 52),
            Duration::from_millis(5),
            token.clone(),
        ));
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();
        handle.await.unwrap();
        assert!(scheduler.get_job(&job_id).await.is_ok());
    }

    #[tokio::test]
    async fn zero_retention_purges_finished_jobs() {
        let (scheduler, job_id) = scheduler_with_finished_job().await;
        let token = CancellationToken::new();
        let handle = tokio::spawn(retention_loop(
            scheduler.clone(),
            Duration::ZERO,
            Duration::from_millis(5),
            token.clone(),
        ));
        let start = std::time::Instant::now();
        while scheduler.get_job(&job_id).await.is_ok() {
            assert!(start.elapsed() < Duration::from_secs(2), "job was not purged");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        token.cancel();
        handle.await.unwrap();
    }
}
