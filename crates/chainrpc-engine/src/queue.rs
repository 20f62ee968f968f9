//! Sequential executor for user callbacks.

use std::panic::{catch_unwind, AssertUnwindSafe};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{error, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs callbacks one at a time, in submission order, on a single task.
///
/// FIFO execution is what gives per-identifier ordering: responses and
/// pushes are queued in the order the transport delivered them. A callback
/// that panics is logged and the queue moves on.
///
/// Callbacks run on a runtime worker thread, so they should not block.
#[derive(Clone)]
pub struct CallbackQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl CallbackQueue {
    /// Spawn the queue worker on the given runtime
    pub fn new(handle: &Handle) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(run(rx));
        Self { tx }
    }

    /// Spawn the queue worker on the current runtime
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn current() -> Self {
        Self::new(&Handle::current())
    }

    pub(crate) fn push(&self, job: impl FnOnce() + Send + 'static) {
        if self.tx.send(Box::new(job)).is_err() {
            warn!("Callback queue stopped; dropping callback");
        }
    }

    /// Wait until every callback queued before this call has run
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.push(move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
    }
}

async fn run(mut rx: mpsc::UnboundedReceiver<Job>) {
    while let Some(job) = rx.recv().await {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(job)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(%message, "Callback panicked");
        }
    }
}
