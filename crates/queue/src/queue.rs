//! The public queue handle tying store, dispatcher and cleaner together.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use courier_core::{SharedClock, SystemClock, TaskId};

use crate::cleaner::Cleaner;
use crate::config::{ConfigError, ConfigUpdate, QueueConfig};
use crate::dispatcher::{Dispatcher, TickOutcome};
use crate::executor::Executor;
use crate::record::{NoopRecordStore, RecordStore};
use crate::stats::QueueStats;
use crate::store::TaskStore;
use crate::transport::Transport;
use crate::types::{NewTask, Task, TaskStatus};

/// Builder for [`DeliveryQueue`].
pub struct DeliveryQueueBuilder {
    transport: Arc<dyn Transport>,
    records: Arc<dyn RecordStore>,
    clock: SharedClock,
    config: QueueConfig,
}

impl DeliveryQueueBuilder {
    pub fn record_store(mut self, records: Arc<dyn RecordStore>) -> Self {
        self.records = records;
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: QueueConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<DeliveryQueue, ConfigError> {
        self.config.validate()?;

        let store = TaskStore::arc();
        let (config_tx, config_rx) = watch::channel(self.config);

        let executor = Arc::new(Executor::new(
            Arc::clone(&store),
            self.transport,
            self.records,
            Arc::clone(&self.clock),
            config_rx.clone(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&store),
            executor,
            Arc::clone(&self.clock),
            config_rx.clone(),
        ));
        let cleaner = Arc::new(Cleaner::new(
            Arc::clone(&store),
            Arc::clone(&self.clock),
            config_rx,
        ));

        Ok(DeliveryQueue {
            store,
            config: config_tx,
            clock: self.clock,
            dispatcher,
            cleaner,
            running: Mutex::new(None),
        })
    }
}

struct Running {
    shutdown: CancellationToken,
    loops: Vec<JoinHandle<()>>,
}

/// In-process outbound delivery queue.
///
/// Each instance owns its own task store; instances never share state.
pub struct DeliveryQueue {
    store: Arc<TaskStore>,
    config: watch::Sender<QueueConfig>,
    clock: SharedClock,
    dispatcher: Arc<Dispatcher>,
    cleaner: Arc<Cleaner>,
    running: Mutex<Option<Running>>,
}

impl DeliveryQueue {
    /// Start building a queue that delivers through `transport`.
    ///
    /// Defaults: [`NoopRecordStore`], [`SystemClock`], [`QueueConfig::default`].
    pub fn builder(transport: Arc<dyn Transport>) -> DeliveryQueueBuilder {
        DeliveryQueueBuilder {
            transport,
            records: Arc::new(NoopRecordStore),
            clock: SystemClock::shared(),
            config: QueueConfig::default(),
        }
    }

    fn running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the dispatcher and cleaner loops. Returns `false` if they were
    /// already running. Must be called within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut running = self.running();
        if running.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let loops = vec![
            tokio::spawn(Arc::clone(&self.dispatcher).run(shutdown.child_token())),
            tokio::spawn(Arc::clone(&self.cleaner).run(shutdown.child_token())),
        ];
        *running = Some(Running { shutdown, loops });

        info!("delivery queue started");
        true
    }

    /// Stop the periodic loops and wait for them to exit. Attempts already
    /// in flight run to completion. Returns `false` if not running.
    pub async fn stop(&self) -> bool {
        let Some(Running { shutdown, loops }) = self.running().take() else {
            return false;
        };

        shutdown.cancel();
        for handle in loops {
            if let Err(err) = handle.await {
                warn!(error = %err, "queue loop terminated abnormally");
            }
        }

        info!("delivery queue stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running().is_some()
    }

    /// Admit a task. It is `pending` until due and a slot is free.
    pub fn add_task(&self, new: NewTask) -> TaskId {
        let default_max_retries = self.config.borrow().default_max_retries;
        let task = self.store.insert(new, default_max_retries, self.clock.now());

        info!(
            task_id = %task.id,
            payload_ref = %task.payload_ref,
            priority = ?task.priority,
            scheduled_at = %task.scheduled_at,
            max_retries = task.max_retries,
            "task admitted"
        );
        task.id
    }

    pub fn get_task(&self, id: TaskId) -> Option<Task> {
        self.store.get(id)
    }

    /// Cancel a pending task. Returns `false` (and changes nothing) for any
    /// other status or an unknown id.
    pub fn cancel_task(&self, id: TaskId) -> bool {
        let cancelled = self.store.cancel(id, self.clock.now());
        if cancelled {
            info!(task_id = %id, "task cancelled");
        }
        cancelled
    }

    /// Return a failed task to `pending` with its retry counter reset.
    pub fn requeue_task(&self, id: TaskId) -> bool {
        let requeued = self.store.requeue(id, self.clock.now());
        if requeued {
            info!(task_id = %id, "task requeued");
        }
        requeued
    }

    pub fn stats(&self) -> QueueStats {
        self.store.stats()
    }

    pub fn list_all_tasks(&self) -> Vec<Task> {
        self.store.list(None)
    }

    pub fn list_by_status(&self, status: TaskStatus) -> Vec<Task> {
        self.store.list(Some(status))
    }

    /// Apply a partial configuration change. Running loops pick up new
    /// intervals immediately; an invalid update leaves the config untouched.
    pub fn update_config(&self, update: ConfigUpdate) -> Result<QueueConfig, ConfigError> {
        let mut outcome = Ok(self.config.borrow().clone());
        self.config.send_if_modified(|current| match update.apply_to(current) {
            Ok(next) => {
                let changed = next != *current;
                *current = next.clone();
                outcome = Ok(next);
                changed
            }
            Err(err) => {
                outcome = Err(err);
                false
            }
        });

        match &outcome {
            Ok(config) => info!(?config, "queue configuration updated"),
            Err(err) => warn!(error = %err, "configuration update rejected"),
        }
        outcome
    }

    pub fn config(&self) -> QueueConfig {
        self.config.borrow().clone()
    }

    /// Run one dispatcher tick now, independent of the periodic loop.
    pub fn tick(&self) -> TickOutcome {
        self.dispatcher.tick()
    }

    /// Run one cleaner sweep now. Returns the number of evicted tasks.
    pub fn sweep(&self) -> usize {
        self.cleaner.sweep()
    }
}

impl Drop for DeliveryQueue {
    fn drop(&mut self) {
        if let Some(running) = self.running().take() {
            running.shutdown.cancel();
        }
    }
}
