use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;
use crate::registry::availability::TimeRestrictions;

pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Online,
    Busy,
    Idle,
    Offline,
    Error,
    Maintenance,
}

impl NodeStatus {
    /// States in which a node may claim work.
    pub fn accepts_work(&self) -> bool {
        matches!(self, Self::Online | Self::Idle)
    }

    /// States subject to heartbeat expiry. MAINTENANCE and ERROR are
    /// administrative and never overridden by the liveness sweep.
    pub const LIVENESS_TRACKED: [NodeStatus; 3] =
        [NodeStatus::Online, NodeStatus::Idle, NodeStatus::Busy];
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeStatus::Online => write!(f, "online"),
            NodeStatus::Busy => write!(f, "busy"),
            NodeStatus::Idle => write!(f, "idle"),
            NodeStatus::Offline => write!(f, "offline"),
            NodeStatus::Error => write!(f, "error"),
            NodeStatus::Maintenance => write!(f, "maintenance"),
        }
    }
}

impl std::str::FromStr for NodeStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "online" => Ok(Self::Online),
            "busy" => Ok(Self::Busy),
            "idle" => Ok(Self::Idle),
            "offline" => Ok(Self::Offline),
            "error" => Ok(Self::Error),
            "maintenance" => Ok(Self::Maintenance),
            other => Err(SchedulerError::InvalidSpec(format!("unknown node status '{other}'"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub cpu_cores: u32,
    #[serde(default = "unknown_cpu_model")]
    pub cpu_model: String,
    pub total_memory_mb: u64,
    #[serde(default)]
    pub available_memory_mb: u64,
    pub available_disk_space_mb: u64,
    pub operating_system: String,
}

fn unknown_cpu_model() -> String {
    "Unknown".to_string()
}

impl Default for ResourceInfo {
    fn default() -> Self {
        Self {
            cpu_cores: 0,
            cpu_model: unknown_cpu_model(),
            total_memory_mb: 0,
            available_memory_mb: 0,
            available_disk_space_mb: 0,
            operating_system: String::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentLoad {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub available_memory_mb: u64,
    pub active_jobs: u32,
}

/// What a node agent sends when it (re-)registers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeRegistration {
    #[serde(default)]
    pub node_id: Option<NodeId>,
    pub hostname: String,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub resource_info: ResourceInfo,
    #[serde(default)]
    pub time_restrictions: Option<TimeRestrictions>,
}

impl NodeRegistration {
    pub fn new<I, S>(hostname: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hostname: hostname.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, node_id: impl Into<NodeId>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_time_restrictions(mut self, restrictions: TimeRestrictions) -> Self {
        self.time_restrictions = Some(restrictions);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub hostname: String,
    pub ip_address: Option<String>,
    /// Agent software version reported at registration.
    pub version: Option<String>,
    pub capabilities: BTreeSet<String>,
    pub resource_info: ResourceInfo,
    pub status: NodeStatus,
    pub current_load: Option<CurrentLoad>,
    pub time_restrictions: Option<TimeRestrictions>,
    pub last_heartbeat_at: DateTime<Utc>,
    pub last_job_completed_at: Option<DateTime<Utc>>,
    pub total_jobs_processed: u64,
    pub failed_jobs: u64,
    pub average_processing_time_seconds: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub revision: u64,
}

impl Node {
    pub fn new(id: NodeId, registration: NodeRegistration, now: DateTime<Utc>) -> Self {
        Self {
            id,
            hostname: registration.hostname,
            ip_address: registration.ip_address,
            version: registration.version,
            capabilities: registration.capabilities,
            resource_info: registration.resource_info,
            status: NodeStatus::Online,
            current_load: None,
            time_restrictions: registration.time_restrictions,
            last_heartbeat_at: now,
            last_job_completed_at: None,
            total_jobs_processed: 0,
            failed_jobs: 0,
            average_processing_time_seconds: 0.0,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// Re-registration: replace descriptive fields, keep statistics.
    pub fn reregister(&mut self, registration: NodeRegistration, now: DateTime<Utc>) {
        self.hostname = registration.hostname;
        self.ip_address = registration.ip_address;
        self.version = registration.version;
        self.capabilities = registration.capabilities;
        self.resource_info = registration.resource_info;
        if registration.time_restrictions.is_some() {
            self.time_restrictions = registration.time_restrictions;
        }
        self.status = NodeStatus::Online;
        self.last_heartbeat_at = now;
        self.updated_at = now;
    }

    pub fn has_capabilities<'a, I>(&self, required: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }

    pub fn is_available_at(&self, now: DateTime<Utc>) -> bool {
        self.time_restrictions
            .as_ref()
            .map_or(true, |r| r.is_open_at(now))
    }

    pub fn is_heartbeat_stale_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        now - self.last_heartbeat_at > timeout
    }

    pub fn record_job_outcome(
        &mut self,
        success: bool,
        processing_seconds: f64,
        now: DateTime<Utc>,
    ) {
        self.total_jobs_processed += 1;
        if !success {
            self.failed_jobs += 1;
        }
        self.last_job_completed_at = Some(now);
        let n = self.total_jobs_processed as f64;
        self.average_processing_time_seconds =
            (self.average_processing_time_seconds * (n - 1.0) + processing_seconds) / n;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_creates_online_node() {
        let now = Utc::now();
        let node = Node::new(
            "n1".into(),
            NodeRegistration::new("host-1", ["ocr", "pdf_parse"]),
            now,
        );
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.last_heartbeat_at, now);
        assert!(node.has_capabilities(&["ocr".to_string()]));
        assert!(!node.has_capabilities(&["ocr".to_string(), "render".to_string()]));
    }

    #[test]
    fn running_average_of_processing_time() {
        let now = Utc::now();
        let mut node = Node::new("n1".into(), NodeRegistration::new("h", ["ocr"]), now);
        node.record_job_outcome(true, 10.0, now);
        node.record_job_outcome(false, 20.0, now);
        node.record_job_outcome(true, 30.0, now);
        assert_eq!(node.total_jobs_processed, 3);
        assert_eq!(node.failed_jobs, 1);
        assert!((node.average_processing_time_seconds - 20.0).abs() < f64::EPSILON);
        assert_eq!(node.last_job_completed_at, Some(now));
    }

    #[test]
    fn reregistration_keeps_statistics_and_restrictions() {
        let now = Utc::now();
        let restrictions = TimeRestrictions::default();
        let mut node = Node::new(
            "n1".into(),
            NodeRegistration::new("h", ["ocr"]).with_time_restrictions(restrictions.clone()),
            now,
        );
        node.record_job_outcome(true, 1.0, now);
        node.status = NodeStatus::Offline;

        node.reregister(NodeRegistration::new("h2", ["pdf_parse"]), now);
        assert_eq!(node.status, NodeStatus::Online);
        assert_eq!(node.hostname, "h2");
        assert_eq!(node.total_jobs_processed, 1);
        assert_eq!(node.time_restrictions, Some(restrictions));
        assert!(node.capabilities.contains("pdf_parse"));
        assert!(!node.capabilities.contains("ocr"));
    }

    #[test]
    fn liveness_tracking_excludes_administrative_states() {
        assert!(NodeStatus::LIVENESS_TRACKED.contains(&NodeStatus::Busy));
        assert!(!NodeStatus::LIVENESS_TRACKED.contains(&NodeStatus::Maintenance));
        assert!(!NodeStatus::LIVENESS_TRACKED.contains(&NodeStatus::Error));
        assert!(!NodeStatus::Busy.accepts_work());
        assert!(NodeStatus::Idle.accepts_work());
    }

    #[test]
    fn status_parse() {
        assert_eq!("IDLE".parse::<NodeStatus>().unwrap(), NodeStatus::Idle);
        assert!("sleeping".parse::<NodeStatus>().is_err());
    }
}
