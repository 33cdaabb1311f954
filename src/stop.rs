//! Run-wide stop signal. A single watch channel shared by every poll and wait
//! loop so an interrupt pre-empts whatever step is currently blocking.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

/// Sending half, held by the Ctrl-C handler (and tests).
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    /// Flip the signal. Safe to call from a signal-handler context.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Receiving half, cloned into every cancellable step.
#[derive(Clone)]
pub struct StopSignal {
    rx: watch::Receiver<bool>,
}

impl StopSignal {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the signal fires. Never resolves if the handle is dropped
    /// without firing, so it is only useful inside `select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        if *rx.borrow() {
            return;
        }
        loop {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
            if *rx.borrow() {
                return;
            }
        }
    }

    /// Sleep that a stop can interrupt. Returns false if interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.cancelled() => false,
        }
    }
}

pub fn stop_channel() -> (StopHandle, StopSignal) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx: Arc::new(tx) }, StopSignal { rx })
}
