//! Turns termination signals into a close request on the bus.
//!
//! The app loop runs on its own thread and only ever sees the request, so a
//! signal ends the run through the normal close path: every plugin is still
//! unloaded in order.

use std::sync::Arc;
use tbx_core::{CloseAppRequest, EventBus};
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Waits for the next termination signal (SIGINT or SIGTERM on Unix, Ctrl+C
/// on Windows).
///
/// # Returns
///
/// The name of the signal received, or an error if the handlers could not
/// be installed.
pub async fn wait_for_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => Ok("SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        Ok("Ctrl+C")
    }
}

/// Posts a [`CloseAppRequest`] on `bus` for every termination signal until
/// the returned task is aborted.
pub fn close_on_signal(bus: Arc<EventBus>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match wait_for_signal().await {
                Ok(name) => {
                    info!("Received {}, closing the app", name);
                    request_close(&bus);
                }
                Err(e) => {
                    warn!("Signal handling unavailable: {}", e);
                    return;
                }
            }
        }
    })
}

/// Queues a close request; the app picks it up at the start of its next
/// frame.
pub fn request_close(bus: &EventBus) {
    // Nobody waits on the outcome
    drop(bus.post(CloseAppRequest::new()));
}
