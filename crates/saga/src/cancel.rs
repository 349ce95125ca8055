//! Cooperative cancellation between steps.
//!
//! The runner only looks at the signal before starting the next `execute()`
//! or `rollback()`; a call already in flight always runs to completion.

use std::sync::Arc;

use tokio::sync::watch;

/// Requests cancellation of the runs observing the paired signal.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Read side handed to the runner.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancellationSignal {
    /// A signal that is never cancelled.
    pub fn never() -> Self {
        Self { rx: None }
    }

    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }
}

pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancellationHandle { tx: Arc::new(tx) },
        CancellationSignal { rx: Some(rx) },
    )
}
