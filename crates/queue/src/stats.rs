//! Derived queue statistics.

use serde::Serialize;

use crate::types::{Task, TaskStatus};

/// Point-in-time projection of the task store. Not a source of truth.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total: usize,
    /// `completed + failed`
    pub total_processed: usize,
    /// Percentage of processed tasks that completed, `0.0` when none processed.
    pub success_rate: f64,
    /// Mean admission-to-completion time of completed tasks.
    pub average_processing_ms: u64,
}

impl QueueStats {
    pub fn collect<'a>(tasks: impl IntoIterator<Item = &'a Task>) -> Self {
        let mut stats = Self::default();
        let mut processing_ms_sum: u128 = 0;

        for task in tasks {
            stats.total += 1;
            match task.status {
                TaskStatus::Pending => stats.pending += 1,
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Completed => {
                    stats.completed += 1;
                    if let Some(elapsed) = task.processing_time() {
                        processing_ms_sum += elapsed.as_millis();
                    }
                }
                TaskStatus::Failed => stats.failed += 1,
                TaskStatus::Cancelled => stats.cancelled += 1,
            }
        }

        stats.total_processed = stats.completed + stats.failed;
        if stats.total_processed > 0 {
            stats.success_rate = stats.completed as f64 / stats.total_processed as f64 * 100.0;
        }
        if stats.completed > 0 {
            let mean = processing_ms_sum / stats.completed as u128;
            stats.average_processing_ms = u64::try_from(mean).unwrap_or(u64::MAX);
        }
        stats
    }
}
