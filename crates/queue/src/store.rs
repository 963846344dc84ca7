//! In-memory task store and lifecycle state machine.
//!
//! The task map and the in-flight set live behind one mutex, so every status
//! change is atomic with respect to concurrent dispatcher ticks and executor
//! completions. No method awaits or performs I/O while holding the lock.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};

use courier_core::TaskId;

use crate::retry::RetryPolicy;
use crate::stats::QueueStats;
use crate::transport::Confirmation;
use crate::types::{FailureOutcome, NewTask, Task, TaskStatus};

/// Error recorded for an attempt whose executor went away without reporting.
pub const ABANDONED_ATTEMPT: &str = "delivery attempt abandoned before completion";

#[derive(Debug, Default)]
struct StoreState {
    tasks: HashMap<TaskId, Task>,
    /// Tasks holding a concurrency slot. Superset of `processing` tasks until
    /// the owning executor releases the slot.
    in_flight: HashSet<TaskId>,
}

/// Authoritative holder of all task records.
#[derive(Debug, Default)]
pub struct TaskStore {
    state: Mutex<StoreState>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit a new pending task.
    pub fn insert(&self, new: NewTask, default_max_retries: u32, now: DateTime<Utc>) -> Task {
        let task = Task::new(TaskId::new(), new, default_max_retries, now);
        self.lock().tasks.insert(task.id, task.clone());
        task
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.lock().tasks.get(&id).cloned()
    }

    /// `pending -> cancelled`. Anything else is refused without mutation.
    pub fn cancel(&self, id: TaskId, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        match state.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.mark_cancelled(now);
                true
            }
            _ => false,
        }
    }

    /// `failed -> pending` with a fresh retry budget, due at `now`.
    pub fn requeue(&self, id: TaskId, now: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        match state.tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Failed => {
                task.requeue(now);
                true
            }
            _ => false,
        }
    }

    /// Tasks ordered by creation time, optionally filtered by status.
    pub fn list(&self, status: Option<TaskStatus>) -> Vec<Task> {
        let state = self.lock();
        let mut result: Vec<_> = state
            .tasks
            .values()
            .filter(|t| status.map_or(true, |s| t.status == s))
            .cloned()
            .collect();

        result.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        result
    }

    pub fn len(&self) -> usize {
        self.lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of occupied concurrency slots.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Select and mark up to `max_concurrent - in_flight` eligible tasks.
    ///
    /// Candidates are pending, due at `now` and not holding a slot; they are
    /// taken by priority (high first), then creation time, then id. Returned
    /// tasks are already `processing` and own a slot that must be handed back
    /// through [`TaskStore::release`].
    pub fn claim_eligible(&self, now: DateTime<Utc>, max_concurrent: usize) -> Vec<Task> {
        let mut state = self.lock();
        let available = max_concurrent.saturating_sub(state.in_flight.len());
        if available == 0 {
            return Vec::new();
        }

        let mut candidates: Vec<_> = state
            .tasks
            .values()
            .filter(|t| t.is_eligible(now) && !state.in_flight.contains(&t.id))
            .map(|t| (t.priority, t.created_at, t.id))
            .collect();

        candidates.sort_unstable_by(|a, b| {
            b.0.cmp(&a.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        candidates.truncate(available);

        let mut claimed = Vec::with_capacity(candidates.len());
        for (_, _, id) in candidates {
            if let Some(task) = state.tasks.get_mut(&id) {
                task.mark_processing(now);
                claimed.push(task.clone());
            }
            state.in_flight.insert(id);
        }
        claimed
    }

    /// `processing -> completed`. Returns the updated task, or `None` if the
    /// task is gone or not processing.
    pub fn complete(
        &self,
        id: TaskId,
        confirmation: Confirmation,
        now: DateTime<Utc>,
    ) -> Option<Task> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Processing {
            return None;
        }
        task.mark_completed(confirmation, now);
        Some(task.clone())
    }

    /// `processing -> pending` (with back-off) or `processing -> failed`.
    pub fn fail_attempt(
        &self,
        id: TaskId,
        error: String,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Option<(Task, FailureOutcome)> {
        let mut state = self.lock();
        let task = state.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Processing {
            return None;
        }
        let outcome = task.mark_attempt_failed(error, now, policy);
        Some((task.clone(), outcome))
    }

    /// Hand back the slot held by `id`.
    ///
    /// A task still `processing` at this point lost its executor without an
    /// outcome; it is failed with [`ABANDONED_ATTEMPT`] in the same critical
    /// section, and the resulting transition is returned.
    pub fn release(
        &self,
        id: TaskId,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Option<(Task, FailureOutcome)> {
        let mut state = self.lock();
        state.in_flight.remove(&id);
        let task = state.tasks.get_mut(&id)?;
        if task.status != TaskStatus::Processing {
            return None;
        }
        let outcome = task.mark_attempt_failed(ABANDONED_ATTEMPT.to_string(), now, policy);
        Some((task.clone(), outcome))
    }

    /// Remove terminal tasks created before `cutoff`. Tasks that still hold
    /// a slot are kept until released.
    pub fn evict_terminal(&self, cutoff: DateTime<Utc>) -> Vec<TaskId> {
        let mut state = self.lock();
        let StoreState { tasks, in_flight } = &mut *state;

        let expired: Vec<_> = tasks
            .values()
            .filter(|t| {
                t.status.is_terminal() && t.created_at < cutoff && !in_flight.contains(&t.id)
            })
            .map(|t| t.id)
            .collect();

        for id in &expired {
            tasks.remove(id);
        }
        expired
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> QueueStats {
        QueueStats::collect(self.lock().tasks.values())
    }
}
