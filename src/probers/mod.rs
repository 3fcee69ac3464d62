//! Store probers.
//!
//! Each prober runs one store's probe loop until shutdown:
//! - `relational`: PostgreSQL ping, optional insert, read of the newest row
//! - `keyvalue`: Redis SET then GET of a fixed key
//!
//! Both share the [`Shutdown`] signal and the timestamp used as probe value.

pub mod keyvalue;
pub mod relational;

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Sending half of the shutdown signal
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        // Receivers may already be gone
        let _ = self.tx.send(true);
    }
}

/// Cancellation signal threaded through every store call and sleep
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    pub fn is_triggered(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires or is dropped.
    pub async fn triggered(&mut self) {
        // wait_for errs only when the sender is gone, which also means stop
        let _ = self.rx.wait_for(|stopped| *stopped).await;
    }

    /// Run `fut` unless shutdown fires first.
    pub async fn guard<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            _ = self.triggered() => None,
            out = fut => Some(out),
        }
    }

    /// Sleep for `interval`. Returns false if shutdown interrupted it.
    pub async fn sleep(&mut self, interval: Duration) -> bool {
        self.guard(tokio::time::sleep(interval)).await.is_some()
    }
}

/// Current Unix time in seconds as a decimal string
pub fn timestamp_value() -> String {
    chrono::Utc::now().timestamp().to_string()
}
