//! Core task types and lifecycle transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{PayloadRef, TaskId};

use crate::retry::RetryPolicy;
use crate::transport::Confirmation;

/// Dispatch priority, fixed at admission.
///
/// Ordering is `Low < Normal < High`; the dispatcher serves higher values first.
#[derive(
    Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Task lifecycle status.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for `scheduled_at` and a free slot
    Pending,
    /// Owned by exactly one executor
    Processing,
    /// Delivered; `result` holds the confirmation
    Completed,
    /// Retries exhausted; `error` holds the last failure
    Failed,
    /// Cancelled before dispatch
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission request for a new task.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub payload_ref: PayloadRef,
    pub priority: Priority,
    /// Defaults to the admission time.
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Defaults to the queue's configured `default_max_retries`.
    pub max_retries: Option<u32>,
}

impl NewTask {
    pub fn new(payload_ref: impl Into<PayloadRef>) -> Self {
        Self {
            payload_ref: payload_ref.into(),
            priority: Priority::Normal,
            scheduled_at: None,
            max_retries: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Hold the task back until `at`.
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Record of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// What a failed attempt did to the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Back to pending; eligible again at `at`.
    RetryScheduled { retry: u32, at: DateTime<Utc> },
    /// Retries exhausted; the task is now `failed`.
    Exhausted,
}

/// A unit of schedulable delivery work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub payload_ref: PayloadRef,
    pub priority: Priority,
    pub max_retries: u32,
    /// Starts at 0; never exceeds `max_retries`.
    pub current_retry: u32,
    /// Not eligible for dispatch before this instant.
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the task reaches a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    /// Last failure description.
    pub error: Option<String>,
    /// Transport confirmation, present once completed.
    pub result: Option<Confirmation>,
    /// Execution history, oldest first.
    pub attempts: Vec<AttemptRecord>,
    /// Start of the attempt currently in flight.
    #[serde(skip)]
    started_at: Option<DateTime<Utc>>,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        new: NewTask,
        default_max_retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload_ref: new.payload_ref,
            priority: new.priority,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            current_retry: 0,
            scheduled_at: new.scheduled_at.unwrap_or(now),
            created_at: now,
            updated_at: now,
            completed_at: None,
            status: TaskStatus::Pending,
            error: None,
            result: None,
            attempts: Vec::new(),
            started_at: None,
        }
    }

    /// Pending and due at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.scheduled_at <= now
    }

    /// Time from admission to completion, for completed tasks only.
    pub fn processing_time(&self) -> Option<Duration> {
        if self.status != TaskStatus::Completed {
            return None;
        }
        let finished = self.completed_at?;
        (finished - self.created_at).to_std().ok()
    }

    /// Number of the attempt currently (or last) in flight, 1-indexed.
    pub fn attempt_number(&self) -> u32 {
        self.attempts.len() as u32 + u32::from(self.status == TaskStatus::Processing)
    }

    pub(crate) fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Processing;
        self.started_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_completed(&mut self, confirmation: Confirmation, now: DateTime<Utc>) {
        self.record_attempt(true, None, now);
        self.status = TaskStatus::Completed;
        // A null confirmation still leaves a result on the task
        self.result = Some(match confirmation {
            serde_json::Value::Null => serde_json::json!({}),
            other => other,
        });
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    pub(crate) fn mark_attempt_failed(
        &mut self,
        error: String,
        now: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> FailureOutcome {
        self.record_attempt(false, Some(error.clone()), now);
        self.error = Some(error);
        self.updated_at = now;

        if self.current_retry < self.max_retries {
            self.current_retry += 1;
            let delay = policy.next_delay(self.current_retry);
            let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
            let at = now
                .checked_add_signed(delay)
                .unwrap_or(DateTime::<Utc>::MAX_UTC);
            self.scheduled_at = at;
            self.status = TaskStatus::Pending;
            FailureOutcome::RetryScheduled {
                retry: self.current_retry,
                at,
            }
        } else {
            self.status = TaskStatus::Failed;
            self.completed_at = Some(now);
            FailureOutcome::Exhausted
        }
    }

    pub(crate) fn mark_cancelled(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Cancelled;
        self.completed_at = Some(now);
        self.updated_at = now;
    }

    /// Give a failed task a fresh retry budget, due immediately.
    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = TaskStatus::Pending;
        self.current_retry = 0;
        self.scheduled_at = now;
        self.error = None;
        self.completed_at = None;
        self.attempts.clear();
        self.updated_at = now;
    }

    fn record_attempt(&mut self, success: bool, error: Option<String>, now: DateTime<Utc>) {
        let started_at = self.started_at.take().unwrap_or(now);
        self.attempts.push(AttemptRecord {
            attempt: self.attempts.len() as u32 + 1,
            started_at,
            finished_at: now,
            success,
            error,
            duration_ms: (now - started_at).num_milliseconds().max(0) as u64,
        });
    }
}
