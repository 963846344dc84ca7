//! Runs a delivery queue with the dry-run transport until signalled.
//!
//! Any command-line arguments are admitted as payload references on startup.

mod shutdown;

use std::sync::Arc;

use anyhow::Context;
use courier_core::PayloadRef;
use courier_queue::{DeliveryQueue, LogTransport, NewTask, NoopRecordStore, QueueConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    courier_observability::init();

    let config = QueueConfig::from_env().context("loading queue configuration")?;
    tracing::info!(?config, "configuration loaded");

    let queue = DeliveryQueue::builder(Arc::new(LogTransport))
        .record_store(Arc::new(NoopRecordStore))
        .config(config)
        .build()
        .context("building delivery queue")?;

    for arg in std::env::args().skip(1) {
        let payload_ref: PayloadRef = arg
            .parse()
            .with_context(|| format!("invalid payload reference {arg:?}"))?;
        queue.add_task(NewTask::new(payload_ref));
    }

    queue.start();
    shutdown::wait_for_signal()
        .await
        .context("installing signal handlers")?;
    queue.stop().await;

    let stats = queue.stats();
    tracing::info!(
        stats = %serde_json::to_string(&stats).unwrap_or_default(),
        "final queue statistics"
    );
    Ok(())
}
