//! Graceful shutdown.
//!
//! One `ShutdownCoordinator` is shared by the HTTP server and every open
//! progress or log stream. Streams close with an error event when it fires,
//! which lets axum's graceful shutdown finish instead of waiting on
//! long-lived SSE responses.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::signal;
use tokio::sync::Notify;
use tracing::{info, warn};

struct Inner {
    fired: AtomicBool,
    reason: OnceLock<&'static str>,
    wake: Notify,
}

/// Process-wide stop signal. Clones share state.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                reason: OnceLock::new(),
                wake: Notify::new(),
            }),
        }
    }

    /// Fire the signal. Only the first call has an effect.
    pub fn request_shutdown(&self) {
        self.fire("requested");
    }

    fn fire(&self, reason: &'static str) {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.inner.reason.set(reason);
        info!(reason, "Shutting down, closing open streams");
        self.inner.wake.notify_waiters();
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.inner.fired.load(Ordering::SeqCst)
    }

    /// What fired the signal, once it has fired.
    pub fn reason(&self) -> Option<&'static str> {
        self.inner.reason.get().copied()
    }

    /// Resolve once the signal has fired, immediately if it already has.
    pub async fn wait_for_shutdown(&self) {
        // Registered before the flag check so a concurrent fire is not missed.
        let notified = self.inner.wake.notified();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Fire on SIGTERM or Ctrl+C.
    pub fn start_signal_listener(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let reason = wait_for_signal().await;
            this.fire(reason);
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> &'static str {
    let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("SIGTERM handler unavailable, listening for Ctrl+C only: {}", e);
            return interrupt().await;
        }
    };
    tokio::select! {
        _ = terminate.recv() => "SIGTERM",
        reason = interrupt() => reason,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> &'static str {
    interrupt().await
}

async fn interrupt() -> &'static str {
    match signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            warn!("Ctrl+C handler unavailable: {}", e);
            std::future::pending().await
        }
    }
}
