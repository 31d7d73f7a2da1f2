//! Cooperative cancellation for the run's timed waits.
//!
//! Every blocking point (interval wait, sensor polls and back-off, relay hold)
//! goes through [`Shutdown::sleep`] or [`Shutdown::race`], which race the wait
//! against SIGINT/SIGTERM.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tracing::warn;

use crate::error::Cancelled;

/// Receiving side, cloned into every component that waits.
#[derive(Clone)]
pub(crate) struct Shutdown {
    rx: watch::Receiver<bool>,
}

/// Sending side; firing it cancels every pending and future wait.
pub(crate) struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

pub(crate) fn channel() -> (ShutdownTrigger, Shutdown) {
    let (tx, rx) = watch::channel(false);
    (ShutdownTrigger { tx }, Shutdown { rx })
}

impl ShutdownTrigger {
    pub(crate) fn fire(&self) {
        self.tx.send_replace(true);
    }
}

impl Shutdown {
    pub(crate) fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Sleep for `duration` unless shutdown is requested first.
    pub(crate) async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        self.race(tokio::time::sleep(duration)).await
    }

    /// Drive `fut` to completion unless shutdown is requested first. The
    /// future is dropped on cancellation.
    pub(crate) async fn race<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_requested() {
            return Err(Cancelled);
        }

        let mut rx = self.rx.clone();
        let requested = async move {
            // A dropped trigger can never fire; keep waiting.
            if rx.wait_for(|stop| *stop).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            out = fut => Ok(out),
            _ = requested => Err(Cancelled),
        }
    }
}

/// Fire `trigger` on the first SIGINT or SIGTERM.
pub(crate) fn listen_for_signals(trigger: ShutdownTrigger) {
    tokio::spawn(async move {
        wait_for_signal().await;
        warn!("termination requested, cancelling pending waits");
        trigger.fire();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("cannot install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
