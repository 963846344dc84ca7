//! `courier-core`: primitives shared by the delivery queue.
//!
//! This crate contains **pure** building blocks (no runtime or I/O concerns).

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{PayloadRef, TaskId};
