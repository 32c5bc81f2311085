//! Contact Web Server - HTTP intake for contact requests.
//!
//! This binary:
//! - Accepts `POST /email` with `{"email": "..."}`
//! - Validates, records and enqueues the address
//! - Replies with `{"message": "..."}` and 200, 400 or 500
//!
//! With `QUEUE_BACKEND=memory` the queue lives in this process, so a worker
//! is started alongside the server to drain it.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use contact::runtime::{self, QueueHandle};
use contact::web::router;
use contact::{AppState, Config, Worker};

#[tokio::main]
async fn main() -> Result<()> {
    runtime::init_tracing();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        port = config.port,
        queue = %config.queue_name,
        queue_backend = ?config.queue_backend,
        record_table = %config.record_table,
        store_backend = ?config.store_backend,
        "config_loaded"
    );

    let queue = QueueHandle::from_config(&config);
    let intake = runtime::intake_service(&config, &queue).await?;

    let shutdown = CancellationToken::new();
    let embedded_worker = match &queue {
        QueueHandle::Memory(_) => {
            let worker = Worker::new(queue.consumer(), runtime::notifier(&config)?, config.receive);
            info!("embedded_worker_started");
            Some(worker.spawn(shutdown.clone()))
        }
        QueueHandle::Amqp(_) => None,
    };

    let state = AppState::new(intake);
    let app = router(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            runtime::shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Some(handle) = embedded_worker {
        handle.await.context("Embedded worker panicked")?;
    }

    // Close broker connection
    queue.close().await;

    info!("web_server_shutdown_complete");

    Ok(())
}
