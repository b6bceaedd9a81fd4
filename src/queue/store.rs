use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::job::{JobState, QueueStats, TrackingJob};
use crate::error::StoreError;

/// Backing store for job records and dispatch order.
///
/// Implementations own every state transition; the worker pool only asks for
/// the next job and reports how the attempt went. A claimed job is held under
/// a lease: the claimant renews it while working and releases it through
/// `retry`, `complete` or `fail`. Transitions made without the current lease
/// fail with `StoreError::LeaseLost`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Admit a new job, eligible for dispatch after `delay`.
    async fn add(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError>;

    /// Promote due delayed jobs, then take the lowest (weight, sequence) job.
    /// The returned record is already marked active with its attempt counted
    /// and carries the lease token in `TrackingJob::lease`.
    async fn claim(&self, lease: Duration) -> Result<Option<TrackingJob>, StoreError>;

    /// Push the lease expiry out to `lease` from now.
    async fn renew(&self, job: &TrackingJob, lease: Duration) -> Result<(), StoreError>;

    /// Return an active job to the delayed set after a failed attempt.
    async fn retry(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError>;

    async fn complete(&self, job: &TrackingJob) -> Result<(), StoreError>;

    async fn fail(&self, job: &TrackingJob) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<TrackingJob>, StoreError>;

    async fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Move active jobs whose lease has run out back to waiting. Jobs still
    /// leased by a live worker, in this process or another, are left alone.
    async fn recover_stalled(&self) -> Result<Vec<String>, StoreError>;
}

struct Lease {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
struct MemoryState {
    jobs: HashMap<String, TrackingJob>,
    order: HashMap<String, (u8, u64)>,
    waiting: BTreeMap<(u8, u64), String>,
    delayed: Vec<(Instant, String)>,
    active: HashMap<String, Lease>,
    completed: VecDeque<String>,
    failed: VecDeque<String>,
    seq: u64,
}

impl MemoryState {
    fn promote_due(&mut self, now: Instant) {
        let (due, pending): (Vec<_>, Vec<_>) =
            self.delayed.drain(..).partition(|(ready_at, _)| *ready_at <= now);
        self.delayed = pending;

        for (_, id) in due {
            if let Some(key) = self.order.get(&id).copied() {
                self.waiting.insert(key, id.clone());
                if let Some(job) = self.jobs.get_mut(&id) {
                    job.state = JobState::Waiting;
                }
            }
        }
    }

    fn lease_mut(&mut self, job: &TrackingJob) -> Result<&mut Lease, StoreError> {
        match self.active.get_mut(&job.id) {
            Some(lease) if job.lease.as_deref() == Some(lease.token.as_str()) => Ok(lease),
            _ => Err(StoreError::LeaseLost(job.id.clone())),
        }
    }

    fn release(&mut self, job: &TrackingJob) -> Result<(), StoreError> {
        self.lease_mut(job)?;
        self.active.remove(&job.id);
        Ok(())
    }

    fn finish(&mut self, job: &TrackingJob, keep: usize, failed: bool) -> Result<(), StoreError> {
        self.release(job)?;
        let mut job = job.clone();
        job.state = if failed { JobState::Failed } else { JobState::Completed };
        job.lease = None;
        self.jobs.insert(job.id.clone(), job.clone());

        let list = if failed { &mut self.failed } else { &mut self.completed };
        list.push_front(job.id);
        let purged: Vec<String> = if list.len() > keep {
            list.drain(keep..).collect()
        } else {
            Vec::new()
        };

        for id in purged {
            self.jobs.remove(&id);
            self.order.remove(&id);
        }
        Ok(())
    }
}

/// Single-process store for development and tests. Nothing survives a restart.
pub struct MemoryJobStore {
    state: Mutex<MemoryState>,
    keep_completed: usize,
    keep_failed: usize,
}

impl MemoryJobStore {
    pub fn new(keep_completed: usize, keep_failed: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            keep_completed,
            keep_failed,
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>, StoreError> {
        self.state
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn add(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.seq += 1;
        let key = (job.priority.weight(), state.seq);

        let mut job = job.clone();
        job.state = JobState::Delayed;
        job.lease = None;
        state.order.insert(job.id.clone(), key);
        state.delayed.push((Instant::now() + delay, job.id.clone()));
        state.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn claim(&self, lease: Duration) -> Result<Option<TrackingJob>, StoreError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let now = Instant::now();
        state.promote_due(now);

        let Some((_, id)) = state.waiting.pop_first() else {
            return Ok(None);
        };

        let Some(job) = state.jobs.get_mut(&id) else {
            return Err(StoreError::Unavailable(format!("job record {} missing", id)));
        };
        let token = Uuid::new_v4().to_string();
        job.state = JobState::Active;
        job.attempts_made += 1;
        job.processed_at = Some(Utc::now());

        let mut claimed = job.clone();
        claimed.lease = Some(token.clone());
        state.active.insert(
            id,
            Lease {
                token,
                expires_at: now + lease,
            },
        );
        Ok(Some(claimed))
    }

    async fn renew(&self, job: &TrackingJob, lease: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.lease_mut(job)?.expires_at = Instant::now() + lease;
        Ok(())
    }

    async fn retry(&self, job: &TrackingJob, delay: Duration) -> Result<(), StoreError> {
        let mut state = self.state()?;
        state.release(job)?;

        let mut job = job.clone();
        job.state = JobState::Delayed;
        job.lease = None;
        state.delayed.push((Instant::now() + delay, job.id.clone()));
        state.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    async fn complete(&self, job: &TrackingJob) -> Result<(), StoreError> {
        let keep = self.keep_completed;
        self.state()?.finish(job, keep, false)
    }

    async fn fail(&self, job: &TrackingJob) -> Result<(), StoreError> {
        let keep = self.keep_failed;
        self.state()?.finish(job, keep, true)
    }

    async fn get(&self, id: &str) -> Result<Option<TrackingJob>, StoreError> {
        Ok(self.state()?.jobs.get(id).cloned())
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let state = self.state()?;
        Ok(QueueStats {
            waiting: (state.waiting.len() + state.delayed.len()) as u64,
            active: state.active.len() as u64,
            completed: state.completed.len() as u64,
            failed: state.failed.len() as u64,
            error: None,
        })
    }

    async fn recover_stalled(&self) -> Result<Vec<String>, StoreError> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let now = Instant::now();

        let stalled: Vec<String> = state
            .active
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &stalled {
            state.active.remove(id);
            if let Some(key) = state.order.get(id).copied() {
                state.waiting.insert(key, id.clone());
            }
            if let Some(job) = state.jobs.get_mut(id) {
                job.state = JobState::Waiting;
            }
        }
        Ok(stalled)
    }
}
