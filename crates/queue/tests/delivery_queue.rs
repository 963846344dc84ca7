use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use courier_core::{Clock, ManualClock};
use courier_queue::{
    ConfigUpdate, Confirmation, DeliveryQueue, InMemoryRecordStore, NewTask, PayloadRef, Priority,
    QueueConfig, RecordStatus, RetryPolicy, TaskStatus, Transport, TransportError,
};

/// Transport that fails while `failing` is set and records every payload it sees.
#[derive(Default)]
struct Flaky {
    failing: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl Flaky {
    fn healthy() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn broken() -> Arc<Self> {
        let transport = Self::default();
        transport.failing.store(true, Ordering::SeqCst);
        Arc::new(transport)
    }

    fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for Flaky {
    async fn send(&self, payload_ref: &PayloadRef) -> Result<Confirmation, TransportError> {
        self.sent.lock().unwrap().push(payload_ref.to_string());
        if self.failing.load(Ordering::SeqCst) {
            Err(TransportError::Rejected("mailbox full".into()))
        } else {
            Ok(serde_json::json!({"accepted": payload_ref.as_str()}))
        }
    }
}

fn clock() -> Arc<ManualClock> {
    ManualClock::arc(Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap())
}

fn queue_with(
    transport: Arc<Flaky>,
    clock: Arc<ManualClock>,
    config: QueueConfig,
) -> DeliveryQueue {
    DeliveryQueue::builder(transport)
        .clock(clock)
        .config(config)
        .build()
        .unwrap()
}

#[tokio::test]
async fn five_tasks_through_two_slots_all_complete() {
    let clock = clock();
    let queue = queue_with(
        Flaky::healthy(),
        clock.clone(),
        QueueConfig {
            max_concurrent_jobs: 2,
            ..QueueConfig::default()
        },
    );

    for i in 0..5 {
        queue.add_task(NewTask::new(format!("order-{i}")));
    }

    let mut ticks = 0;
    while queue.stats().completed < 5 {
        let outcome = queue.tick();
        assert!(outcome.dispatched.len() <= 2);
        outcome.join().await;
        ticks += 1;
        assert!(ticks <= 3, "five tasks need three ticks at two slots");
    }

    let stats = queue.stats();
    assert_eq!(stats.completed, 5);
    assert_eq!(stats.total_processed, 5);
    assert_eq!(stats.success_rate, 100.0);
    assert_eq!(stats.pending + stats.processing + stats.failed, 0);
}

#[tokio::test]
async fn always_failing_task_uses_its_whole_retry_budget() {
    let clock = clock();
    let records = InMemoryRecordStore::arc();
    let transport = Flaky::broken();
    let queue = DeliveryQueue::builder(transport.clone())
        .clock(clock.clone())
        .record_store(records.clone())
        .config(QueueConfig {
            retry: RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60)),
            ..QueueConfig::default()
        })
        .build()
        .unwrap();

    let id = queue.add_task(NewTask::new("order-1").with_max_retries(2));
    let mut seen = vec![queue.get_task(id).unwrap().status];

    for _ in 0..3 {
        let outcome = queue.tick();
        assert_eq!(outcome.dispatched, vec![id]);
        seen.push(queue.get_task(id).unwrap().status);
        outcome.join().await;

        let task = queue.get_task(id).unwrap();
        seen.push(task.status);
        assert!(task.current_retry <= task.max_retries);

        if task.status == TaskStatus::Pending {
            // Back-off holds it until due
            assert!(queue.tick().is_idle());
            clock.set(task.scheduled_at);
        }
    }

    use TaskStatus::*;
    assert_eq!(
        seen,
        vec![Pending, Processing, Pending, Processing, Pending, Processing, Failed]
    );

    let task = queue.get_task(id).unwrap();
    assert_eq!(task.current_retry, 2);
    assert_eq!(task.attempts.len(), 3);
    assert!(task.attempts.iter().all(|a| !a.success));
    assert_eq!(task.error.as_deref(), Some("delivery rejected: mailbox full"));
    assert!(task.result.is_none());
    assert_eq!(transport.sent().len(), 3);

    // A failed task stays put
    assert!(queue.tick().is_idle());

    let statuses: Vec<_> = records
        .updates_for(&task.payload_ref)
        .into_iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            RecordStatus::Sending,
            RecordStatus::Retrying,
            RecordStatus::Sending,
            RecordStatus::Retrying,
            RecordStatus::Sending,
            RecordStatus::Failed,
        ]
    );
}

#[tokio::test]
async fn back_off_grows_between_retries() {
    let clock = clock();
    let queue = queue_with(
        Flaky::broken(),
        clock.clone(),
        QueueConfig {
            retry: RetryPolicy::new(Duration::from_secs(1), 2.0, Duration::from_secs(60)),
            ..QueueConfig::default()
        },
    );
    let id = queue.add_task(NewTask::new("order-1").with_max_retries(3));

    let mut gaps = Vec::new();
    for _ in 0..3 {
        let failed_at = clock.now();
        queue.tick().join().await;
        let task = queue.get_task(id).unwrap();
        gaps.push((task.scheduled_at - failed_at).num_seconds());
        clock.set(task.scheduled_at);
    }

    assert_eq!(gaps, vec![2, 4, 8]);
}

#[tokio::test]
async fn cancelled_task_is_never_dispatched() {
    let clock = clock();
    let transport = Flaky::healthy();
    let queue = queue_with(transport.clone(), clock.clone(), QueueConfig::default());

    let id = queue.add_task(NewTask::new("order-1"));
    assert!(queue.cancel_task(id));
    assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Cancelled);

    clock.advance(Duration::from_secs(3600));
    assert!(queue.tick().is_idle());
    assert!(transport.sent().is_empty());

    // Already terminal
    assert!(!queue.cancel_task(id));
}

#[tokio::test]
async fn processing_task_cannot_be_cancelled() {
    let queue = queue_with(Flaky::healthy(), clock(), QueueConfig::default());
    let id = queue.add_task(NewTask::new("order-1"));

    let outcome = queue.tick();
    assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Processing);
    assert!(!queue.cancel_task(id));
    assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Processing);

    outcome.join().await;
    assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn requeue_gives_failed_task_a_fresh_start() {
    let clock = clock();
    let transport = Flaky::broken();
    let queue = queue_with(transport.clone(), clock.clone(), QueueConfig::default());

    let id = queue.add_task(NewTask::new("order-1").with_max_retries(0));
    assert!(!queue.requeue_task(id), "pending tasks cannot be requeued");

    queue.tick().join().await;
    assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Failed);

    clock.advance(Duration::from_secs(90));
    transport.failing.store(false, Ordering::SeqCst);
    assert!(queue.requeue_task(id));

    let requeued = queue.get_task(id).unwrap();
    assert_eq!(requeued.status, TaskStatus::Pending);
    assert_eq!(requeued.current_retry, 0);
    assert!(requeued.scheduled_at <= clock.now());

    assert_eq!(queue.tick().join().await, vec![id]);
    assert_eq!(queue.get_task(id).unwrap().status, TaskStatus::Completed);
    assert!(!queue.requeue_task(id));
}

#[tokio::test]
async fn sweep_evicts_old_finished_tasks_only() {
    let clock = clock();
    let queue = queue_with(
        Flaky::healthy(),
        clock.clone(),
        QueueConfig {
            retention: Duration::from_secs(3600),
            ..QueueConfig::default()
        },
    );

    let done = queue.add_task(NewTask::new("done"));
    queue.tick().join().await;
    let waiting = queue.add_task(
        NewTask::new("waiting").scheduled_at(clock.now() + chrono::Duration::days(7)),
    );

    assert_eq!(queue.sweep(), 0);

    clock.advance(Duration::from_secs(7200));
    assert_eq!(queue.sweep(), 1);

    let ids: Vec<_> = queue.list_all_tasks().into_iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![waiting]);
    assert!(queue.get_task(done).is_none());
}

#[test]
fn empty_queue_stats_are_all_zero() {
    let queue = queue_with(Flaky::healthy(), clock(), QueueConfig::default());
    let stats = queue.stats();

    assert_eq!(stats.total, 0);
    assert_eq!(stats.total_processed, 0);
    assert_eq!(stats.success_rate, 0.0);
    assert_eq!(stats.average_processing_ms, 0);
}

#[tokio::test]
async fn list_by_status_reflects_outcomes() {
    let clock = clock();
    let queue = queue_with(Flaky::healthy(), clock.clone(), QueueConfig::default());

    let low = queue.add_task(NewTask::new("low").with_priority(Priority::Low));
    let cancelled = queue.add_task(NewTask::new("cancelled"));
    queue.cancel_task(cancelled);
    queue.tick().join().await;

    let completed: Vec<_> = queue
        .list_by_status(TaskStatus::Completed)
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(completed, vec![low]);
    assert_eq!(queue.list_by_status(TaskStatus::Cancelled).len(), 1);
    assert!(queue.list_by_status(TaskStatus::Pending).is_empty());
}

#[tokio::test(start_paused = true)]
async fn running_queue_drains_on_its_own() {
    let clock = clock();
    let transport = Flaky::healthy();
    let queue = queue_with(
        transport.clone(),
        clock.clone(),
        QueueConfig {
            max_concurrent_jobs: 2,
            tick_interval: Duration::from_millis(100),
            ..QueueConfig::default()
        },
    );

    assert!(queue.start());
    for i in 0..6 {
        queue.add_task(NewTask::new(format!("order-{i}")));
    }

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(queue.stats().completed, 6);

    assert!(queue.stop().await);
    queue.add_task(NewTask::new("after-stop"));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(queue.stats().pending, 1);
    assert_eq!(transport.sent().len(), 6);
}

#[tokio::test(start_paused = true)]
async fn config_update_reaches_running_loop() {
    let clock = clock();
    let queue = queue_with(
        Flaky::healthy(),
        clock.clone(),
        QueueConfig {
            tick_interval: Duration::from_secs(3600),
            ..QueueConfig::default()
        },
    );
    queue.start();
    // First tick of a fresh interval fires immediately
    tokio::time::sleep(Duration::from_millis(10)).await;

    queue.add_task(NewTask::new("order-1"));
    queue
        .update_config(ConfigUpdate::default().tick_interval(Duration::from_millis(50)))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(queue.stats().completed, 1);
    queue.stop().await;
}

#[test]
fn invalid_config_update_is_rejected() {
    let queue = queue_with(Flaky::healthy(), clock(), QueueConfig::default());

    assert!(
        queue
            .update_config(ConfigUpdate::default().max_concurrent_jobs(0))
            .is_err()
    );
    assert_eq!(queue.config().max_concurrent_jobs, 5);

    let next = queue
        .update_config(ConfigUpdate::default().max_concurrent_jobs(9))
        .unwrap();
    assert_eq!(next.max_concurrent_jobs, 9);
    assert_eq!(queue.config(), next);
}

/// Transport that tracks overlap: per payload and across the whole queue.
#[derive(Default)]
struct Overlap {
    active: Mutex<HashSet<String>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    duplicate: AtomicBool,
    sends: AtomicUsize,
}

#[async_trait]
impl Transport for Overlap {
    async fn send(&self, payload_ref: &PayloadRef) -> Result<Confirmation, TransportError> {
        if !self.active.lock().unwrap().insert(payload_ref.to_string()) {
            self.duplicate.store(true, Ordering::SeqCst);
        }
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.sends.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(2)).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        self.active.lock().unwrap().remove(payload_ref.as_str());
        Ok(serde_json::json!({}))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ticks_respect_slots_and_ownership() {
    let transport = Arc::new(Overlap::default());
    let queue = Arc::new(
        DeliveryQueue::builder(transport.clone())
            .config(QueueConfig {
                max_concurrent_jobs: 3,
                ..QueueConfig::default()
            })
            .build()
            .unwrap(),
    );
    for i in 0..40 {
        queue.add_task(NewTask::new(format!("order-{i}")));
    }

    let mut drivers = Vec::new();
    for _ in 0..4 {
        let queue = Arc::clone(&queue);
        drivers.push(tokio::spawn(async move {
            while queue.stats().completed < 40 {
                assert!(queue.list_by_status(TaskStatus::Processing).len() <= 3);
                queue.tick().join().await;
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        }));
    }

    tokio::time::timeout(Duration::from_secs(30), async {
        for driver in drivers {
            driver.await.unwrap();
        }
    })
    .await
    .expect("drivers should drain the queue");

    assert!(transport.peak.load(Ordering::SeqCst) <= 3);
    assert!(!transport.duplicate.load(Ordering::SeqCst));
    assert_eq!(transport.sends.load(Ordering::SeqCst), 40);
}
