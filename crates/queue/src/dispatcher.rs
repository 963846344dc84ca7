//! Dispatcher: fills free concurrency slots on every tick.

use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use courier_core::{SharedClock, TaskId};

use crate::config::QueueConfig;
use crate::executor::Executor;
use crate::store::TaskStore;

/// Result of one dispatcher tick.
#[derive(Debug, Default)]
pub struct TickOutcome {
    /// Another tick was still running; nothing was done.
    pub skipped: bool,
    /// Tasks handed to the executor, in dispatch order.
    pub dispatched: Vec<TaskId>,
    executions: Vec<JoinHandle<()>>,
}

impl TickOutcome {
    fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn is_idle(&self) -> bool {
        self.dispatched.is_empty()
    }

    /// Wait for every attempt started by this tick to finish.
    pub async fn join(self) -> Vec<TaskId> {
        for execution in self.executions {
            if let Err(err) = execution.await {
                warn!(error = %err, "delivery attempt terminated abnormally");
            }
        }
        self.dispatched
    }
}

/// Single scheduling authority: selects eligible tasks and launches attempts.
pub struct Dispatcher {
    store: Arc<TaskStore>,
    executor: Arc<Executor>,
    clock: SharedClock,
    config: watch::Receiver<QueueConfig>,
    tick_guard: Mutex<()>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<TaskStore>,
        executor: Arc<Executor>,
        clock: SharedClock,
        config: watch::Receiver<QueueConfig>,
    ) -> Self {
        Self {
            store,
            executor,
            clock,
            config,
            tick_guard: Mutex::new(()),
        }
    }

    /// Dispatch as many eligible tasks as there are free slots.
    ///
    /// Ticks never overlap: a tick that starts while another is selecting is
    /// skipped. Must be called within a tokio runtime.
    pub fn tick(&self) -> TickOutcome {
        let _guard = match self.tick_guard.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                debug!("previous tick still running; skipping");
                return TickOutcome::skipped();
            }
        };

        let max_concurrent = self.config.borrow().max_concurrent_jobs;
        let claimed = self.store.claim_eligible(self.clock.now(), max_concurrent);

        let mut outcome = TickOutcome::default();
        for task in claimed {
            debug!(
                task_id = %task.id,
                priority = ?task.priority,
                attempt = task.attempt_number(),
                "dispatching task"
            );
            outcome.dispatched.push(task.id);
            outcome.executions.push(self.executor.spawn(task));
        }
        outcome
    }

    /// Tick on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut config = self.config.clone();
        let mut period = config.borrow_and_update().tick_interval;
        let mut ticker = periodic(period);
        info!(tick_interval = ?period, "dispatcher started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = config.borrow_and_update().tick_interval;
                    if next != period {
                        debug!(from = ?period, to = ?next, "tick interval updated");
                        period = next;
                        ticker = periodic(period);
                    }
                }
                _ = ticker.tick() => {
                    let outcome = self.tick();
                    if !outcome.is_idle() {
                        debug!(dispatched = outcome.dispatched.len(), "tick dispatched tasks");
                    }
                }
            }
        }

        info!("dispatcher stopped");
    }
}

/// Interval that skips missed ticks instead of bursting to catch up.
pub(crate) fn periodic(period: Duration) -> Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    interval
}
