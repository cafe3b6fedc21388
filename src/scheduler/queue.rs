use std::collections::{HashMap, VecDeque};

use chrono::Utc;

use crate::protocol::Identity;
use crate::scheduler::job::{Job, JobId, JobState};

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Holds every job the broker knows about, in exactly one of three places:
/// the pending FIFO, the active map, or the bounded history.
#[derive(Debug)]
pub struct JobStore {
    pending: VecDeque<Job>,
    active: HashMap<JobId, Job>,
    history: VecDeque<Job>,
    history_limit: usize,
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl JobStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            active: HashMap::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    /// Append a job to the tail of the pending queue.
    pub fn enqueue(&mut self, mut job: Job) {
        job.state = JobState::Queued;
        self.pending.push_back(job);
    }

    /// Put a job back at the head of the pending queue, dropping its
    /// assignment.
    pub fn requeue(&mut self, mut job: Job) {
        job.state = JobState::Queued;
        job.assigned_worker = None;
        job.started_at = None;
        self.pending.push_front(job);
    }

    /// Pending jobs in FIFO order.
    pub fn pending(&self) -> impl Iterator<Item = &Job> {
        self.pending.iter()
    }

    pub fn active(&self) -> impl Iterator<Item = &Job> {
        self.active.values()
    }

    /// Finished jobs, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &Job> {
        self.history.iter()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.active.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn get_pending(&self, id: &JobId) -> Option<&Job> {
        self.pending.iter().find(|j| &j.id == id)
    }

    pub fn get_active(&self, id: &JobId) -> Option<&Job> {
        self.active.get(id)
    }

    /// Id of the job currently running on `worker`, if any.
    pub fn active_for_worker(&self, worker: &Identity) -> Option<JobId> {
        self.active
            .values()
            .find(|j| j.assigned_worker.as_ref() == Some(worker))
            .map(|j| j.id.clone())
    }

    /// Move a pending job to the active map, assigned to `worker`.
    /// Returns the activated job, or `None` if no such job is pending.
    pub fn start(&mut self, id: &JobId, worker: Identity) -> Option<&Job> {
        let pos = self.pending.iter().position(|j| &j.id == id)?;
        let mut job = self.pending.remove(pos)?;
        job.state = JobState::Active;
        job.assigned_worker = Some(worker);
        job.started_at = Some(Utc::now());
        let id = job.id.clone();
        self.active.insert(id.clone(), job);
        self.active.get(&id)
    }

    /// Finalize an active job into history with a terminal `state`,
    /// evicting the oldest history entries beyond the limit.
    pub fn finish(&mut self, id: &JobId, state: JobState) -> Option<&Job> {
        debug_assert!(state.is_terminal());
        let mut job = self.active.remove(id)?;
        job.state = state;
        job.completed_at = Some(Utc::now());
        self.history.push_back(job);
        while self.history.len() > self.history_limit {
            self.history.pop_front();
        }
        self.history.back()
    }

    /// Return an active job to the head of the pending queue.
    pub fn demote(&mut self, id: &JobId) -> bool {
        match self.active.remove(id) {
            Some(job) => {
                self.requeue(job);
                true
            }
            None => false,
        }
    }

    /// Where a job currently lives, if anywhere. History is searched last.
    pub fn locate(&self, id: &JobId) -> Option<JobState> {
        if self.get_pending(id).is_some() {
            return Some(JobState::Queued);
        }
        if self.active.contains_key(id) {
            return Some(JobState::Active);
        }
        self.history.iter().rev().find(|j| &j.id == id).map(|j| j.state)
    }
}
