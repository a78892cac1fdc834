use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::scheduler::job::Job;

/// Position of a job in the admission queue: highest priority first, then
/// oldest ordering timestamp, then admission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QueueKey {
    priority: Reverse<u8>,
    queued_at: DateTime<Utc>,
    seq: u64,
    pub job_id: Uuid,
}

impl QueueKey {
    pub fn priority(&self) -> u8 {
        self.priority.0
    }

    pub fn queued_at(&self) -> DateTime<Utc> {
        self.queued_at
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue_size: usize,
    pub capacity: usize,
    /// Priority 8-10
    pub high_priority: usize,
    /// Priority 4-7
    pub medium_priority: usize,
    /// Priority 1-3
    pub low_priority: usize,
    pub oldest_queued_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QueueState {
    entries: BTreeMap<QueueKey, String>,
    by_job: HashMap<Uuid, QueueKey>,
    reserved: usize,
    next_seq: u64,
}

impl QueueState {
    fn insert(&mut self, job: &Job) -> QueueKey {
        if let Some(old) = self.by_job.remove(&job.id) {
            self.entries.remove(&old);
        }
        let key = QueueKey {
            priority: Reverse(job.priority),
            queued_at: job.queued_at,
            seq: self.next_seq,
            job_id: job.id,
        };
        self.next_seq += 1;
        self.entries.insert(key, job.job_type.clone());
        self.by_job.insert(job.id, key);
        key
    }
}

/// Ordered, bounded index over QUEUED jobs.
///
/// The index is advisory: the store's status is authoritative, and a claimer
/// that finds a stale entry simply loses its conditional write.
#[derive(Debug)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    capacity: usize,
}

impl AdmissionQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Claim a slot for a new submission. The slot is released if the
    /// returned reservation is dropped without being committed.
    pub fn reserve(&self) -> Result<Reservation<'_>> {
        let mut state = self.lock();
        if state.entries.len() + state.reserved >= self.capacity {
            return Err(SchedulerError::QueueFull {
                capacity: self.capacity,
            });
        }
        state.reserved += 1;
        Ok(Reservation {
            queue: self,
            committed: false,
        })
    }

    /// Admit a job without a capacity check. Used for retries and recovery,
    /// where the job already exists and must not be dropped.
    pub fn push(&self, job: &Job) -> QueueKey {
        self.lock().insert(job)
    }

    /// Remove a job regardless of its position.
    pub fn remove(&self, job_id: &Uuid) -> bool {
        let mut state = self.lock();
        match state.by_job.remove(job_id) {
            Some(key) => {
                state.entries.remove(&key);
                true
            }
            None => false,
        }
    }

    /// Remove exactly this entry. A newer admission of the same job (after a
    /// retry) carries a different key and is left alone.
    pub fn remove_key(&self, key: &QueueKey) -> bool {
        let mut state = self.lock();
        if state.by_job.get(&key.job_id) != Some(key) {
            return false;
        }
        state.by_job.remove(&key.job_id);
        state.entries.remove(key);
        true
    }

    /// Up to `limit` entries, in queue order, whose job type is one of `capabilities`.
    pub fn candidates(&self, capabilities: &BTreeSet<String>, limit: usize) -> Vec<QueueKey> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, job_type)| capabilities.contains(*job_type))
            .take(limit)
            .map(|(key, _)| *key)
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, job_id: &Uuid) -> bool {
        self.lock().by_job.contains_key(job_id)
    }

    /// Replace the whole index, e.g. from the store's QUEUED jobs at start-up.
    pub fn restore<'a, I>(&self, jobs: I) -> usize
    where
        I: IntoIterator<Item = &'a Job>,
    {
        let mut state = self.lock();
        state.entries.clear();
        state.by_job.clear();
        for job in jobs {
            state.insert(job);
        }
        state.entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        let mut stats = QueueStats {
            queue_size: state.entries.len(),
            capacity: self.capacity,
            ..Default::default()
        };
        for key in state.entries.keys() {
            match key.priority() {
                8..=u8::MAX => stats.high_priority += 1,
                4..=7 => stats.medium_priority += 1,
                _ => stats.low_priority += 1,
            }
            stats.oldest_queued_at = Some(match stats.oldest_queued_at {
                Some(oldest) if oldest <= key.queued_at => oldest,
                _ => key.queued_at,
            });
        }
        stats
    }
}

/// A held admission slot.
#[derive(Debug)]
pub struct Reservation<'a> {
    queue: &'a AdmissionQueue,
    committed: bool,
}

impl Reservation<'_> {
    pub fn commit(mut self, job: &Job) -> QueueKey {
        let mut state = self.queue.lock();
        state.reserved -= 1;
        self.committed = true;
        state.insert(job)
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            let mut state = self.queue.lock();
            state.reserved = state.reserved.saturating_sub(1);
        }
    }
}
