use std::net::SocketAddr;
use std::time::Duration;

/// Tunables read by the scheduling core.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Upper bound on QUEUED jobs; submissions beyond it fail with `QueueFull`.
    pub max_queue_size: usize,
    /// Nodes silent for longer than this are marked OFFLINE by the supervisor.
    pub heartbeat_timeout: Duration,
    /// Accepted job types. Empty accepts any non-empty tag.
    pub job_types: Vec<String>,
    pub default_priority: u8,
    pub default_max_retries: u32,
    pub default_timeout_seconds: u64,
    pub max_retries_limit: u32,
    pub max_timeout_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1000,
            heartbeat_timeout: Duration::from_secs(180),
            job_types: vec!["ocr".to_string(), "pdf_parse".to_string()],
            default_priority: 5,
            default_max_retries: 3,
            default_timeout_seconds: 3600,
            max_retries_limit: 100,
            max_timeout_seconds: 7 * 24 * 3600,
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_queue_size(mut self, max_queue_size: usize) -> Self {
        self.max_queue_size = max_queue_size;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_job_types<I, S>(mut self, job_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.job_types = job_types.into_iter().map(Into::into).collect();
        self
    }
}

/// Process-level settings for the `jobmesh server` binary.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen_addr: SocketAddr,
    /// How often the supervisor `tick()` runs.
    pub tick_interval: Duration,
    /// Terminal jobs older than this are purged from the store.
    pub job_retention: Duration,
    pub retention_interval: Duration,
    /// Capacity of the in-process event broadcast channel.
    pub event_buffer: usize,
    pub scheduler: SchedulerConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            tick_interval: Duration::from_secs(30),
            job_retention: Duration::from_secs(30 * 24 * 3600),
            retention_interval: Duration::from_secs(3600),
            event_buffer: 1024,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerConfig) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }
}
