//! Worker node registry and liveness tracking.
//!
//! The registry is the only writer of a node's liveness fields
//! (`status`, `current_load`, `last_heartbeat_at`). All writes go through
//! the store's conditional update, so a heartbeat racing the liveness sweep
//! either lands first (and the sweep skips the node) or lands after the
//! OFFLINE flip (and brings the node back).

pub mod availability;
pub mod node;

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::events::{EventSink, SchedulerEvent};
use crate::store::{CasResult, NodeFilter, NodeStore, Page, Versioned};

pub use availability::{DaySpec, TimeRestrictions, TimeWindow};
pub use node::{CurrentLoad, Node, NodeId, NodeRegistration, NodeStatus, ResourceInfo};

/// Attempts for a read-modify-write before giving up with `Conflict`.
pub(crate) const MAX_CAS_ATTEMPTS: usize = 16;

pub struct NodeRegistry {
    store: Arc<dyn NodeStore>,
    events: Arc<dyn EventSink>,
}

impl NodeRegistry {
    pub fn new(store: Arc<dyn NodeStore>, events: Arc<dyn EventSink>) -> Self {
        Self { store, events }
    }

    pub async fn register(&self, registration: NodeRegistration) -> Result<Node> {
        self.register_at(registration, Utc::now()).await
    }

    /// Upsert a node. A supplied id is reused; otherwise one is generated.
    /// The node always comes back ONLINE with a fresh heartbeat.
    pub async fn register_at(
        &self,
        registration: NodeRegistration,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        if registration.hostname.trim().is_empty() {
            return Err(SchedulerError::InvalidSpec("hostname must not be empty".into()));
        }
        if registration.capabilities.is_empty() {
            return Err(SchedulerError::InvalidSpec(
                "node must declare at least one capability".into(),
            ));
        }
        let id = registration
            .node_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        for _ in 0..MAX_CAS_ATTEMPTS {
            let registered = match self.store.get_node(&id).await? {
                None => {
                    let node = Node::new(id.clone(), registration.clone(), now);
                    match self.store.insert_node(&node).await {
                        Ok(()) => Some(node),
                        Err(SchedulerError::Conflict(_)) => None,
                        Err(e) => return Err(e),
                    }
                }
                Some(current) => {
                    let mut next = current.clone();
                    next.reregister(registration.clone(), now);
                    self.commit(&current, next).await?
                }
            };
            if let Some(node) = registered {
                tracing::info!(
                    node_id = %node.id,
                    hostname = %node.hostname,
                    capabilities = ?node.capabilities,
                    "Node registered"
                );
                self.events.emit(SchedulerEvent::NodeUpdated(node.clone()));
                return Ok(node);
            }
        }
        Err(SchedulerError::Conflict(format!("node {id} is being updated concurrently")))
    }

    pub async fn heartbeat(
        &self,
        node_id: &str,
        status: NodeStatus,
        load: Option<CurrentLoad>,
    ) -> Result<Node> {
        self.heartbeat_at(node_id, status, load, Utc::now()).await
    }

    pub async fn heartbeat_at(
        &self,
        node_id: &str,
        status: NodeStatus,
        load: Option<CurrentLoad>,
        now: DateTime<Utc>,
    ) -> Result<Node> {
        let node = self
            .update(node_id, |node| {
                node.status = status;
                if load.is_some() {
                    node.current_load = load.clone();
                }
                node.last_heartbeat_at = now;
                node.updated_at = now;
            })
            .await?;
        tracing::debug!(node_id, status = %status, "Heartbeat received");
        self.events.emit(SchedulerEvent::NodeUpdated(node.clone()));
        Ok(node)
    }

    pub async fn get(&self, node_id: &str) -> Result<Node> {
        self.store
            .get_node(node_id)
            .await?
            .ok_or_else(|| SchedulerError::node_not_found(node_id))
    }

    pub async fn list(&self, filter: &NodeFilter) -> Result<Page<Node>> {
        self.store.list_nodes(filter).await
    }

    /// ONLINE/IDLE nodes whose capabilities include every requested one.
    pub async fn list_available(&self, capabilities: &BTreeSet<String>) -> Result<Vec<Node>> {
        let nodes = self
            .store
            .nodes_by_status(&[NodeStatus::Online, NodeStatus::Idle])
            .await?;
        Ok(nodes
            .into_iter()
            .filter(|n| n.has_capabilities(capabilities))
            .collect())
    }

    pub async fn offline_nodes(&self) -> Result<Vec<Node>> {
        self.store.nodes_by_status(&[NodeStatus::Offline]).await
    }

    /// Mark ONLINE/IDLE/BUSY nodes whose last heartbeat is older than
    /// `timeout` as OFFLINE. Returns the nodes that were flipped.
    pub async fn sweep_liveness_at(
        &self,
        timeout: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<Node>> {
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|_| SchedulerError::InvalidSpec("heartbeat timeout out of range".into()))?;
        let candidates = self
            .store
            .nodes_by_status(&NodeStatus::LIVENESS_TRACKED)
            .await?;

        let mut flipped = Vec::new();
        for current in candidates {
            if !current.is_heartbeat_stale_at(now, timeout) {
                continue;
            }
            let mut next = current.clone();
            next.status = NodeStatus::Offline;
            next.updated_at = now;
            match self.commit(&current, next).await {
                Ok(Some(node)) => {
                    tracing::warn!(
                        node_id = %node.id,
                        last_heartbeat_at = %node.last_heartbeat_at,
                        "Node missed heartbeats, marked offline"
                    );
                    self.events.emit(SchedulerEvent::NodeUpdated(node.clone()));
                    flipped.push(node);
                }
                Ok(None) => {
                    tracing::debug!(
                        node_id = %current.id,
                        "Node changed during liveness sweep, skipped"
                    );
                }
                Err(SchedulerError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(flipped)
    }

    /// Feed a finished job into the node's statistics. The node is only a
    /// weak reference from the job, so a missing node is not an error.
    pub async fn record_job_outcome(
        &self,
        node_id: &str,
        success: bool,
        processing_seconds: f64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match self
            .update(node_id, |node| node.record_job_outcome(success, processing_seconds, now))
            .await
        {
            Ok(node) => {
                self.events.emit(SchedulerEvent::NodeUpdated(node));
                Ok(())
            }
            Err(SchedulerError::NotFound { .. }) => {
                tracing::warn!(node_id, "Job outcome reported for unknown node, stats not updated");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn update<F>(&self, node_id: &str, mut apply: F) -> Result<Node>
    where
        F: FnMut(&mut Node) + Send,
    {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.get(node_id).await?;
            let mut next = current.clone();
            apply(&mut next);
            if let Some(node) = self.commit(&current, next).await? {
                return Ok(node);
            }
        }
        Err(SchedulerError::Conflict(format!(
            "node {node_id} is being updated concurrently"
        )))
    }

    async fn commit(&self, current: &Node, mut next: Node) -> Result<Option<Node>> {
        match self.store.cas_node(&next, current.expected()).await? {
            CasResult::Success { revision } => {
                next.revision = revision;
                Ok(Some(next))
            }
            CasResult::NotFound => Err(SchedulerError::node_not_found(&current.id)),
            CasResult::StateMismatch { .. } | CasResult::VersionConflict { .. } => Ok(None),
        }
    }
}
