//! Contact Worker - long-polling consumer for contact requests.
//!
//! Receives contact requests from the queue, hands each address to the
//! configured notifier and acknowledges it. Unacknowledged messages are
//! redelivered after their visibility timeout.

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use contact::runtime::{self, QueueHandle};
use contact::{Config, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();

    info!("worker_starting");

    // Load configuration from environment
    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        queue = %config.queue_name,
        queue_backend = ?config.queue_backend,
        max_messages = config.receive.max_messages,
        wait_seconds = config.receive.wait.as_secs(),
        visibility_timeout_seconds = config.receive.visibility_timeout.as_secs(),
        webhook_configured = config.notify_webhook_url.is_some(),
        "config_loaded"
    );

    let queue = QueueHandle::from_config(&config);
    let notifier = runtime::notifier(&config)?;

    // An unreachable broker at startup is fatal.
    queue
        .connect_consumer(config.receive.max_messages)
        .await
        .context("Queue unavailable")?;

    let worker = Worker::new(queue.consumer(), notifier, config.receive);

    info!(queue = %config.queue_name, "worker_listening");

    let shutdown = CancellationToken::new();
    let handle = worker.spawn(shutdown.clone());

    runtime::shutdown_signal().await;
    info!("worker_stopping");
    shutdown.cancel();

    handle.await.context("Worker task panicked")?;
    queue.close().await;

    info!("worker_shutdown_complete");
    Ok(())
}
