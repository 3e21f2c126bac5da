//! Top-level supervision.
//!
//! Provides an async `run` function that boots one listener per configured
//! mapping and orchestrates bounded graceful shutdown across all of them.

use crate::config::Config;
use crate::listener::Listener;
use crate::{Shutdown, GRACEFUL_SHUTDOWN_TIME};
use std::future::Future;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{timeout, Instant};
use tracing::{error, info};

/// Run the load balancer.
///
/// Spawns one listener task per mapping, then waits for the supplied
/// `shutdown` future (the binary passes a SIGTERM/SIGINT future). Once it
/// completes, cancellation is broadcast to every listener and `run` waits up
/// to [`GRACEFUL_SHUTDOWN_TIME`] for them to drain their sessions; whatever
/// is still alive after that is abandoned to process exit.
///
/// Listeners are isolated from each other and from this supervisor: one
/// crashing is observed here only as an already-drained listener at
/// shutdown time.
pub async fn run(config: Config, shutdown: impl Future) {
    let (notify_shutdown, _) = broadcast::channel(1);
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel(1);

    for mapping in &config.mappings {
        info!(
            "starting listener on {} -> [{}]",
            mapping.local,
            mapping
                .workers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );
        let listener = Listener::new(
            mapping.clone(),
            config.buffer_size,
            Shutdown::new(notify_shutdown.subscribe()),
            shutdown_complete_tx.clone(),
        );
        tokio::spawn(listener.run());
    }

    shutdown.await;
    info!("shutting down");

    // Dropping the pair wakes every listener and lets the drain channel
    // close once the last of them has stopped.
    let started = Instant::now();
    drop(notify_shutdown);
    drop(shutdown_complete_tx);

    match timeout(GRACEFUL_SHUTDOWN_TIME, shutdown_complete_rx.recv()).await {
        Ok(_) => info!("all listeners stopped in {:.2?}", started.elapsed()),
        Err(_) => error!(
            "could not stop all listeners within {}s",
            GRACEFUL_SHUTDOWN_TIME.as_secs()
        ),
    }
}
