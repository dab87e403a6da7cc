//! OS interrupt handling.

use std::sync::Arc;

use crate::domain::{ShutdownFlag, WritableWaker};

/// Watch for Ctrl+C / SIGINT and move the shutdown flag to `interrupted`.
///
/// Runs as a background task on the transport runtime. The waker is poked so
/// the service loop notices the interrupt before its bounded wait runs out.
/// The console read on the main thread is not unblocked by this; the user
/// still has to press Enter.
pub async fn watch_interrupt(shutdown: Arc<ShutdownFlag>, waker: WritableWaker) {
    loop {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for interrupt signal: {}", e);
            return;
        }

        match shutdown.interrupt() {
            Ok(()) => tracing::warn!("Interrupt received, shutting down (press Enter to finish)"),
            Err(e) => tracing::info!("Interrupt received while already shutting down: {}", e),
        }
        waker.request_writable();
    }
}
