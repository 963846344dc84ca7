//! In-process outbound delivery queue with priority dispatch, bounded
//! concurrency and retry back-off.
//!
//! ## Design
//!
//! - Tasks are admitted `pending` and move through a small state machine
//! - One dispatcher fills free concurrency slots each tick, highest priority
//!   and oldest first
//! - Failed attempts are retried with exponential back-off until the task's
//!   retry budget is spent
//! - Delivery is at-least-once: a retry may repeat a send that partially
//!   succeeded
//! - Finished tasks are evicted after a retention horizon
//!
//! ## Components
//!
//! - `TaskStore`: authoritative task map and in-flight slots
//! - `Dispatcher`: periodic selection of eligible tasks
//! - `Executor`: one delivery attempt per hand-off
//! - `Cleaner`: periodic eviction of terminal tasks
//! - `DeliveryQueue`: public handle over all of the above

pub mod cleaner;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod queue;
pub mod record;
pub mod retry;
pub mod stats;
pub mod store;
pub mod transport;
pub mod types;

pub use cleaner::Cleaner;
pub use config::{ConfigError, ConfigUpdate, QueueConfig};
pub use dispatcher::{Dispatcher, TickOutcome};
pub use executor::Executor;
pub use queue::{DeliveryQueue, DeliveryQueueBuilder};
pub use record::{
    InMemoryRecordStore, NoopRecordStore, RecordStatus, RecordStore, RecordStoreError,
    RecordUpdate,
};
pub use retry::RetryPolicy;
pub use stats::QueueStats;
pub use store::{ABANDONED_ATTEMPT, TaskStore};
pub use transport::{Confirmation, LogTransport, Transport, TransportError};
pub use types::{AttemptRecord, FailureOutcome, NewTask, Priority, Task, TaskStatus};

pub use courier_core::{PayloadRef, TaskId};
