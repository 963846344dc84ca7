//! Executor: one delivery attempt per hand-off, outcome applied to the store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use courier_core::{PayloadRef, SharedClock, TaskId};

use crate::config::QueueConfig;
use crate::record::{RecordStore, RecordStoreError, RecordUpdate};
use crate::retry::RetryPolicy;
use crate::store::{ABANDONED_ATTEMPT, TaskStore};
use crate::transport::{Transport, TransportError};
use crate::types::{FailureOutcome, Task};

/// Runs delivery attempts for tasks claimed by the dispatcher.
pub struct Executor {
    store: Arc<TaskStore>,
    transport: Arc<dyn Transport>,
    records: Arc<dyn RecordStore>,
    clock: SharedClock,
    config: watch::Receiver<QueueConfig>,
}

impl Executor {
    pub fn new(
        store: Arc<TaskStore>,
        transport: Arc<dyn Transport>,
        records: Arc<dyn RecordStore>,
        clock: SharedClock,
        config: watch::Receiver<QueueConfig>,
    ) -> Self {
        Self {
            store,
            transport,
            records,
            clock,
            config,
        }
    }

    /// Run the attempt for `task` on its own tokio task.
    ///
    /// `task` must have been claimed (it is `processing` and owns a slot).
    /// The slot is released once the outcome is in the store, however the
    /// attempt ends.
    pub fn spawn(self: &Arc<Self>, task: Task) -> JoinHandle<()> {
        let slot = SlotGuard {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            records: Arc::clone(&self.records),
            retry: self.retry_policy(),
            record_timeout: self.record_timeout(),
            task_id: task.id,
            attempt: task.attempt_number(),
        };
        let this = Arc::clone(self);

        tokio::spawn(async move { this.attempt(task, slot).await })
    }

    /// Perform one delivery attempt and record its outcome.
    ///
    /// Record store writes are bounded by `record_timeout`; the final one runs
    /// after `slot` has been handed back.
    async fn attempt(&self, task: Task, slot: SlotGuard) {
        let attempt = task.attempt_number();
        let payload_ref = &task.payload_ref;

        self.persist(payload_ref, RecordUpdate::sending(attempt, self.clock.now()))
            .await;

        let timeout = self.config.borrow().attempt_timeout;
        let sent = tokio::time::timeout(timeout, self.transport.send(payload_ref)).await;
        let result = sent.unwrap_or(Err(TransportError::Timeout(timeout)));

        let now = self.clock.now();
        let update = match result {
            Ok(confirmation) => {
                let Some(done) = self.store.complete(task.id, confirmation.clone(), now) else {
                    warn!(task_id = %task.id, "task left processing; outcome dropped");
                    return;
                };
                info!(
                    task_id = %done.id,
                    payload_ref = %payload_ref,
                    attempt,
                    "delivery completed"
                );
                RecordUpdate::sent(attempt, confirmation, now)
            }
            Err(err) => {
                let message = err.to_string();
                let policy = self.retry_policy();
                let Some((task, outcome)) =
                    self.store.fail_attempt(task.id, message.clone(), now, &policy)
                else {
                    warn!(task_id = %task.id, "task left processing; outcome dropped");
                    return;
                };
                log_failure(&task, outcome, attempt, &message, now)
            }
        };

        drop(slot);
        self.persist(payload_ref, update).await;
    }

    fn retry_policy(&self) -> RetryPolicy {
        self.config.borrow().retry.clone()
    }

    fn record_timeout(&self) -> Duration {
        self.config.borrow().record_timeout
    }

    async fn persist(&self, payload_ref: &PayloadRef, update: RecordUpdate) {
        persist(self.records.as_ref(), self.record_timeout(), payload_ref, update).await;
    }
}

/// Best-effort, bounded write to the record store; failures are only logged.
async fn persist(
    records: &dyn RecordStore,
    timeout: Duration,
    payload_ref: &PayloadRef,
    update: RecordUpdate,
) {
    let status = update.status;
    let written = tokio::time::timeout(timeout, records.update_record(payload_ref, update)).await;
    if let Err(err) = written.unwrap_or(Err(RecordStoreError::Timeout(timeout))) {
        warn!(
            payload_ref = %payload_ref,
            status = ?status,
            error = %err,
            "record store update failed"
        );
    }
}

fn log_failure(
    task: &Task,
    outcome: FailureOutcome,
    attempt: u32,
    message: &str,
    now: DateTime<Utc>,
) -> RecordUpdate {
    match outcome {
        FailureOutcome::RetryScheduled { retry, at } => {
            warn!(
                task_id = %task.id,
                payload_ref = %task.payload_ref,
                attempt,
                retry,
                max_retries = task.max_retries,
                next_attempt_at = %at,
                error = %message,
                "delivery failed; retry scheduled"
            );
            RecordUpdate::retrying(attempt, message, at, now)
        }
        FailureOutcome::Exhausted => {
            error!(
                task_id = %task.id,
                payload_ref = %task.payload_ref,
                attempt,
                error = %message,
                "delivery failed; retries exhausted"
            );
            RecordUpdate::failed(attempt, message, now)
        }
    }
}

/// Owns a task's concurrency slot for the lifetime of one attempt.
///
/// Dropping it (after the outcome is stored, on panic, or when the future is
/// dropped) hands the slot back. An attempt that never reported an outcome is
/// failed, and the failure is written to the record store in the background.
struct SlotGuard {
    store: Arc<TaskStore>,
    clock: SharedClock,
    records: Arc<dyn RecordStore>,
    retry: RetryPolicy,
    record_timeout: Duration,
    task_id: TaskId,
    attempt: u32,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let now = self.clock.now();
        let Some((task, outcome)) = self.store.release(self.task_id, now, &self.retry) else {
            debug!(task_id = %self.task_id, "slot released");
            return;
        };

        let update = log_failure(&task, outcome, self.attempt, ABANDONED_ATTEMPT, now);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(task_id = %task.id, "no runtime to record abandoned attempt");
            return;
        };
        let records = Arc::clone(&self.records);
        let timeout = self.record_timeout;
        runtime.spawn(async move {
            persist(records.as_ref(), timeout, &task.payload_ref, update).await;
        });
    }
}
