//! Process-wide graceful termination latch
//!
//! The latch is set at most once, by a trapped SIGTERM/SIGINT or an explicit
//! [`GracefulTerminator::trigger`], and is never cleared. Loops poll
//! [`GracefulTerminator::should_terminate`] at their safe points; sleeps that
//! must be cut short race against [`GracefulTerminator::terminated`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::signal;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::Result;

#[derive(Debug, Default)]
struct Latch {
    triggered: AtomicBool,
    notify: Notify,
}

/// Cloneable handle to a single-fire termination latch
#[derive(Debug, Clone, Default)]
pub struct GracefulTerminator {
    latch: Arc<Latch>,
}

static GLOBAL: OnceLock<GracefulTerminator> = OnceLock::new();

impl GracefulTerminator {
    /// Create a fresh, untriggered latch
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide latch shared by every caller
    pub fn global() -> &'static GracefulTerminator {
        GLOBAL.get_or_init(GracefulTerminator::new)
    }

    /// Trap Ctrl+C and SIGTERM and trigger the latch when either arrives.
    ///
    /// Must be called from within a Tokio runtime. Handler registration errors
    /// are returned immediately rather than from the spawned listener.
    pub fn install(&self) -> Result<JoinHandle<()>> {
        #[cfg(unix)]
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        let this = self.clone();
        Ok(tokio::spawn(async move {
            #[cfg(unix)]
            let terminate = terminate.recv();

            #[cfg(not(unix))]
            let terminate = std::future::pending::<Option<()>>();

            tokio::select! {
                result = signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Ctrl+C listener failed");
                        return;
                    }
                    info!("Received Ctrl+C, requesting graceful termination");
                }
                _ = terminate => {
                    info!("Received SIGTERM, requesting graceful termination");
                }
            }
            this.trigger();
        }))
    }

    /// Set the latch. Returns true only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        let first = !self.latch.triggered.swap(true, Ordering::SeqCst);
        if first {
            self.latch.notify.notify_waiters();
        }
        first
    }

    /// Non-blocking check of the latch
    pub fn should_terminate(&self) -> bool {
        self.latch.triggered.load(Ordering::SeqCst)
    }

    /// Completes once the latch has been triggered
    pub async fn terminated(&self) {
        loop {
            let notified = self.latch.notify.notified();
            tokio::pin!(notified);
            // Register before checking the flag so a concurrent trigger is not lost.
            notified.as_mut().enable();
            if self.should_terminate() {
                return;
            }
            notified.await;
        }
    }
}
