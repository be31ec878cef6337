//! Signal-of-Stop: cooperative cancellation token.
//!
//! Clones share one flag. Transfers check [`SignalOfStop::cancelled`] before
//! every chunk and race their only suspension point against
//! [`SignalOfStop::wait`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Shared {
    stopped: AtomicBool,
    notify: Notify,
}

#[derive(Debug, Clone, Default)]
pub struct SignalOfStop {
    shared: Arc<Shared>,
}

impl SignalOfStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag and wake every waiter. Idempotent.
    pub fn cancel(&self) {
        self.shared.stopped.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
    }

    pub fn cancelled(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    /// Resolve once the flag is raised (immediately if it already is).
    pub async fn wait(&self) {
        // Register before checking so a cancel in between is not lost.
        let notified = self.shared.notify.notified();
        if self.cancelled() {
            return;
        }
        notified.await;
    }
}
