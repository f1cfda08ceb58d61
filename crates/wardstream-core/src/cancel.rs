//! Cancellation token shared by connection drivers and timers.
//!
//! Every long-lived activity in the core (a connection driver, a reconnect
//! timer, a boundary's pending retry, the close grace period) holds a clone
//! of a `CancellationToken` so teardown is auditable: cancelling is
//! idempotent, observable synchronously via [`CancellationToken::is_cancelled`],
//! and awaitable via [`CancellationToken::cancelled`] so sleeping timers wake
//! up immediately instead of running to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

/// A cancellation token for cooperative cancellation of async work.
///
/// Clones share state: cancelling any clone cancels them all. Cancelling an
/// already-cancelled token is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Create a new, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent; wakes all pending waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Check if cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve once cancellation is requested.
    ///
    /// Safe to race with [`cancel`](Self::cancel): the notified future is
    /// created before the flag is re-checked, so a cancel between the check
    /// and the await is not lost.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Check cancellation and return an error if cancelled.
    pub fn check(&self) -> crate::Result<()> {
        if self.is_cancelled() {
            Err(crate::CoreError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Sleep for `duration` unless `token` is cancelled first.
///
/// Returns `true` if the sleep completed, `false` if it was cancelled.
pub async fn sleep_unless_cancelled(duration: std::time::Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = token.cancelled() => false,
    }
}
