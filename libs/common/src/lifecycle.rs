//! Lifecycle control
//!
//! Holds the stop and reconfigure requests consumed by the relay loop and maps
//! process signals onto them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Stop / reconfigure flags shared between the signal watcher and the relay
///
/// Requests only flip flags and wake waiters; they never allocate or log.
#[derive(Debug, Default)]
pub struct Lifecycle {
    stop: CancellationToken,
    reconfigure: AtomicBool,
    reconfigure_notify: Notify,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the relay to finish its current iteration and stop
    pub fn request_stop(&self) {
        self.stop.cancel();
    }

    /// Ask the relay to reconfigure at the next iteration boundary
    pub fn request_reconfigure(&self) {
        self.reconfigure.store(true, Ordering::Release);
        self.reconfigure_notify.notify_one();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn reconfigure_requested(&self) -> bool {
        self.reconfigure.load(Ordering::Acquire)
    }

    /// Consume a pending reconfigure request
    pub fn take_reconfigure(&self) -> bool {
        self.reconfigure.swap(false, Ordering::AcqRel)
    }

    /// Token cancelled once stop has been requested
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Resolves as soon as a stop or reconfigure request is pending
    pub async fn interrupted(&self) {
        if self.stop_requested() || self.reconfigure_requested() {
            return;
        }
        tokio::select! {
            _ = self.stop.cancelled() => {},
            _ = self.reconfigure_notify.notified() => {},
        }
    }
}

/// Map process signals onto `lifecycle`
///
/// - On Unix: SIGINT and SIGTERM request stop, SIGHUP requests reconfigure
/// - Elsewhere: Ctrl+C requests stop
///
/// The task ends once stop has been requested.
pub fn spawn_signal_watcher(lifecycle: Arc<Lifecycle>) -> JoinHandle<()> {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut term_signal = match signal(SignalKind::terminate()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    warn!(
                        "Failed to install SIGTERM handler: {}. Service will only respond to Ctrl+C",
                        e
                    );
                    None
                },
            };
            let mut hup_signal = match signal(SignalKind::hangup()) {
                Ok(sig) => Some(sig),
                Err(e) => {
                    warn!("Failed to install SIGHUP handler: {}", e);
                    None
                },
            };

            let stop = lifecycle.stop_token();
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, stopping");
                        lifecycle.request_stop();
                    },
                    _ = recv_or_pending(&mut term_signal) => {
                        info!("SIGTERM received, stopping");
                        lifecycle.request_stop();
                    },
                    _ = recv_or_pending(&mut hup_signal) => {
                        info!("SIGHUP received, reconfigure requested");
                        lifecycle.request_reconfigure();
                    },
                }
            }
        }
        #[cfg(not(unix))]
        {
            let stop = lifecycle.stop_token();
            tokio::select! {
                _ = stop.cancelled() => {},
                _ = tokio::signal::ctrl_c() => lifecycle.request_stop(),
            }
        }
    })
}

#[cfg(unix)]
async fn recv_or_pending(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        },
        // Handler failed to install, never fires
        None => std::future::pending::<()>().await,
    }
}
