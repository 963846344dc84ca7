//! Cleaner: evicts terminal tasks past the retention horizon.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use courier_core::SharedClock;

use crate::config::QueueConfig;
use crate::dispatcher::periodic;
use crate::store::TaskStore;

pub struct Cleaner {
    store: Arc<TaskStore>,
    clock: SharedClock,
    config: watch::Receiver<QueueConfig>,
}

impl Cleaner {
    pub fn new(
        store: Arc<TaskStore>,
        clock: SharedClock,
        config: watch::Receiver<QueueConfig>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Remove completed, failed and cancelled tasks created before
    /// `now - retention`. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let retention = self.config.borrow().retention;
        let Some(cutoff) = cutoff(self.clock.now(), retention) else {
            return 0;
        };

        let removed = self.store.evict_terminal(cutoff).len();
        if removed > 0 {
            info!(removed, cutoff = %cutoff, "evicted finished tasks");
        }
        removed
    }

    /// Sweep on the configured interval until `shutdown` fires.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut config = self.config.clone();
        let mut period = config.borrow_and_update().cleanup_interval;
        let mut ticker = periodic(period);
        info!(cleanup_interval = ?period, "cleaner started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = config.borrow_and_update().cleanup_interval;
                    if next != period {
                        debug!(from = ?period, to = ?next, "cleanup interval updated");
                        period = next;
                        ticker = periodic(period);
                    }
                }
                _ = ticker.tick() => {
                    self.sweep();
                }
            }
        }

        info!("cleaner stopped");
    }
}

// `None` when the horizon reaches back past the representable range.
fn cutoff(now: DateTime<Utc>, retention: std::time::Duration) -> Option<DateTime<Utc>> {
    let retention = chrono::Duration::from_std(retention).ok()?;
    now.checked_sub_signed(retention)
}
