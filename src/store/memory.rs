//! In-memory implementation of the store contract.
//!
//! Every record sits behind its own mutex; the table lock is only taken to
//! look a record up (shared) or to insert/delete one (exclusive). A
//! conditional write therefore serializes against other writers of the same
//! record and nothing else.
//!
//! Not durable: state is lost when the process exits.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{CasResult, Expected, JobFilter, JobStore, NodeFilter, NodeStore, Page, Versioned};
use crate::error::{Result, SchedulerError};
use crate::registry::{Node, NodeId, NodeStatus};
use crate::scheduler::{Job, JobStatus};

fn poison_err<T>(_: PoisonError<T>) -> SchedulerError {
    SchedulerError::Storage("lock poisoned".to_string())
}

#[derive(Debug)]
struct Table<K, V> {
    rows: RwLock<HashMap<K, Arc<Mutex<V>>>>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
        }
    }
}

impl<K, V> Table<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Display,
    V: Versioned,
{
    fn row(&self, key: &K) -> Result<Option<Arc<Mutex<V>>>> {
        let rows = self.rows.read().map_err(poison_err)?;
        Ok(rows.get(key).cloned())
    }

    fn insert(&self, key: K, value: &V) -> Result<()> {
        let mut rows = self.rows.write().map_err(poison_err)?;
        if rows.contains_key(&key) {
            return Err(SchedulerError::Conflict(format!("record {key} already exists")));
        }
        rows.insert(key, Arc::new(Mutex::new(value.clone())));
        Ok(())
    }

    fn get(&self, key: &K) -> Result<Option<V>> {
        match self.row(key)? {
            Some(row) => Ok(Some(row.lock().map_err(poison_err)?.clone())),
            None => Ok(None),
        }
    }

    fn compare_and_swap(
        &self,
        key: &K,
        next: &V,
        expected: Expected<V::Status>,
    ) -> Result<CasResult<V::Status>> {
        let Some(row) = self.row(key)? else {
            return Ok(CasResult::NotFound);
        };
        let mut current = row.lock().map_err(poison_err)?;
        if current.status() != expected.status {
            return Ok(CasResult::StateMismatch {
                actual: current.status(),
            });
        }
        if current.revision() != expected.revision {
            return Ok(CasResult::VersionConflict {
                actual: current.revision(),
            });
        }
        let revision = expected.revision + 1;
        let mut committed = next.clone();
        committed.set_revision(revision);
        *current = committed;
        Ok(CasResult::Success { revision })
    }

    fn scan<F>(&self, mut keep: F) -> Result<Vec<V>>
    where
        F: FnMut(&V) -> bool,
    {
        let rows: Vec<Arc<Mutex<V>>> = {
            let rows = self.rows.read().map_err(poison_err)?;
            rows.values().cloned().collect()
        };
        let mut out = Vec::new();
        for row in rows {
            let value = row.lock().map_err(poison_err)?;
            if keep(&value) {
                out.push(value.clone());
            }
        }
        Ok(out)
    }

    fn len(&self) -> Result<usize> {
        Ok(self.rows.read().map_err(poison_err)?.len())
    }
}

fn paginate<T>(items: Vec<T>, offset: usize, limit: usize) -> Page<T> {
    let total = items.len();
    let items = items.into_iter().skip(offset).take(limit).collect();
    Page { items, total }
}

/// Thread-safe in-memory job and node store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    jobs: Table<Uuid, Job>,
    nodes: Table<NodeId, Node>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_count(&self) -> Result<usize> {
        self.jobs.len()
    }

    pub fn node_count(&self) -> Result<usize> {
        self.nodes.len()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        self.jobs.insert(job.id, job)
    }

    async fn get_job(&self, id: &Uuid) -> Result<Option<Job>> {
        self.jobs.get(id)
    }

    async fn cas_job(
        &self,
        job: &Job,
        expected: Expected<JobStatus>,
    ) -> Result<CasResult<JobStatus>> {
        self.jobs.compare_and_swap(&job.id, job, expected)
    }

    async fn jobs_by_status(&self, statuses: &[JobStatus]) -> Result<Vec<Job>> {
        let mut jobs = self.jobs.scan(|j| statuses.contains(&j.status))?;
        jobs.sort_by_key(|j| (Reverse(j.priority), j.queued_at, j.created_at, j.id));
        Ok(jobs)
    }

    async fn jobs_for_node(&self, node_id: &str) -> Result<Vec<Job>> {
        self.jobs.scan(|j| {
            j.status.is_active() && j.assigned_node_id.as_deref() == Some(node_id)
        })
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Page<Job>> {
        let mut jobs = self.jobs.scan(|j| filter.matches(j))?;
        jobs.sort_by_key(|j| (Reverse(j.created_at), j.id));
        Ok(paginate(jobs, filter.offset, filter.page_size()))
    }

    async fn purge_finished_jobs(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut rows = self.jobs.rows.write().map_err(poison_err)?;
        let before = rows.len();
        let mut poisoned = false;
        rows.retain(|_, row| match row.lock() {
            Ok(job) => {
                let finished_at = job.completed_at.unwrap_or(job.created_at);
                !(job.status.is_terminal() && finished_at < cutoff)
            }
            Err(_) => {
                poisoned = true;
                true
            }
        });
        if poisoned {
            return Err(SchedulerError::Storage("lock poisoned".to_string()));
        }
        Ok(before - rows.len())
    }
}

#[async_trait]
impl NodeStore for InMemoryStore {
    async fn insert_node(&self, node: &Node) -> Result<()> {
        self.nodes.insert(node.id.clone(), node)
    }

    async fn get_node(&self, id: &str) -> Result<Option<Node>> {
        self.nodes.get(&id.to_string())
    }

    async fn cas_node(
        &self,
        node: &Node,
        expected: Expected<NodeStatus>,
    ) -> Result<CasResult<NodeStatus>> {
        self.nodes.compare_and_swap(&node.id, node, expected)
    }

    async fn nodes_by_status(&self, statuses: &[NodeStatus]) -> Result<Vec<Node>> {
        self.nodes.scan(|n| statuses.contains(&n.status))
    }

    async fn list_nodes(&self, filter: &NodeFilter) -> Result<Page<Node>> {
        let mut nodes = self.nodes.scan(|n| filter.matches(n))?;
        nodes.sort_by(|a, b| {
            b.last_heartbeat_at
                .cmp(&a.last_heartbeat_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(paginate(nodes, filter.offset, filter.page_size()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::registry::NodeRegistration;
    use crate::scheduler::JobSpec;
    use chrono::Duration;

    fn job(priority: u8, at: DateTime<Utc>) -> Job {
        Job::new(
            JobSpec::new("ocr").with_priority(priority),
            "alice",
            &SchedulerConfig::default(),
            at,
        )
    }

    #[tokio::test]
    async fn insert_rejects_duplicates() {
        let store = InMemoryStore::new();
        let j = job(5, Utc::now());
        store.insert_job(&j).await.unwrap();
        assert!(matches!(
            store.insert_job(&j).await,
            Err(SchedulerError::Conflict(_))
        ));
        assert_eq!(store.job_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn cas_checks_status_then_revision() {
        let store = InMemoryStore::new();
        let original = job(5, Utc::now());
        store.insert_job(&original).await.unwrap();

        let mut assigned = original.clone();
        assigned.assign("n1", Utc::now()).unwrap();
        let result = store.cas_job(&assigned, original.expected()).await.unwrap();
        assert_eq!(result, CasResult::Success { revision: 1 });

        // Stale writer still expecting QUEUED loses on status.
        let mut canceled = original.clone();
        canceled.cancel(Utc::now()).unwrap();
        let result = store.cas_job(&canceled, original.expected()).await.unwrap();
        assert_eq!(
            result,
            CasResult::StateMismatch {
                actual: JobStatus::Assigned
            }
        );

        // Same status, old revision loses on version.
        let stale = Expected {
            status: JobStatus::Assigned,
            revision: 0,
        };
        let result = store.cas_job(&assigned, stale).await.unwrap();
        assert_eq!(result, CasResult::VersionConflict { actual: 1 });

        let stored = store.get_job(&original.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Assigned);
        assert_eq!(stored.revision, 1);
    }

    #[tokio::test]
    async fn cas_missing_record() {
        let store = InMemoryStore::new();
        let j = job(5, Utc::now());
        let result = store.cas_job(&j, j.expected()).await.unwrap();
        assert_eq!(result, CasResult::NotFound);
    }

    #[tokio::test]
    async fn jobs_by_status_orders_by_priority_then_age() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let low_old = job(3, t0);
        let high_new = job(8, t0 + Duration::seconds(10));
        let low_new = job(3, t0 + Duration::seconds(5));
        for j in [&low_new, &high_new, &low_old] {
            store.insert_job(j).await.unwrap();
        }
        let ids: Vec<Uuid> = store
            .jobs_by_status(&[JobStatus::Queued])
            .await
            .unwrap()
            .into_iter()
            .map(|j| j.id)
            .collect();
        assert_eq!(ids, vec![high_new.id, low_old.id, low_new.id]);
    }

    #[tokio::test]
    async fn list_jobs_paginates_newest_first() {
        let store = InMemoryStore::new();
        let t0 = Utc::now();
        let mut ids = Vec::new();
        for i in 0..5 {
            let j = job(5, t0 + Duration::seconds(i));
            ids.push(j.id);
            store.insert_job(&j).await.unwrap();
        }
        let page = store
            .list_jobs(&JobFilter {
                limit: Some(2),
                offset: 1,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 5);
        assert_eq!(page.items.iter().map(|j| j.id).collect::<Vec<_>>(), vec![ids[3], ids[2]]);
    }

    #[tokio::test]
    async fn purge_removes_only_old_terminal_jobs() {
        let store = InMemoryStore::new();
        let t0 = Utc::now() - Duration::days(40);
        let mut old_done = job(5, t0);
        old_done.cancel(t0).unwrap();
        let old_queued = job(5, t0);
        let mut recent_done = job(5, Utc::now());
        recent_done.cancel(Utc::now()).unwrap();
        for j in [&old_done, &old_queued, &recent_done] {
            store.insert_job(j).await.unwrap();
        }

        let purged = store
            .purge_finished_jobs(Utc::now() - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert!(store.get_job(&old_done.id).await.unwrap().is_none());
        assert!(store.get_job(&old_queued.id).await.unwrap().is_some());
        assert!(store.get_job(&recent_done.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn node_listing_by_status() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let online = Node::new("a".into(), NodeRegistration::new("a", ["ocr"]), now);
        let mut offline = Node::new(
            "b".into(),
            NodeRegistration::new("b", ["ocr"]),
            now - Duration::seconds(60),
        );
        offline.status = NodeStatus::Offline;
        store.insert_node(&online).await.unwrap();
        store.insert_node(&offline).await.unwrap();

        let page = store
            .list_nodes(&NodeFilter {
                statuses: vec![NodeStatus::Offline],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].id, "b");

        let all = store.list_nodes(&NodeFilter::default()).await.unwrap();
        assert_eq!(all.items[0].id, "a");
        assert_eq!(store.node_count().unwrap(), 2);
    }
}
