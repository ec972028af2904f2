//! Count-down latch used for engine startup readiness and shutdown draining.
//!
//! Not present verbatim in the teacher (its daemons shut down via a bare
//! `CancellationToken` with no "wait for N tasks to exit" step), but named
//! explicitly in SPEC_FULL §9 as the primitive to use; implemented here as a
//! small wrapper over an atomic counter and a `Notify`, in the teacher's
//! habit of keeping cross-task coordination primitives as focused structs
//! rather than reaching for a heavier sync crate.

use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Notify;

/// A latch that starts at `count` and reaches zero once `count_down` has
/// been called that many times. `wait` resolves once the count reaches zero.
pub struct CountDownLatch {
    count: AtomicUsize,
    notify: Notify,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        let notify = Notify::new();
        if count == 0 {
            notify.notify_waiters();
        }
        Self { count: AtomicUsize::new(count), notify }
    }

    /// Decrement the count by one. Notifies any waiters once it reaches zero.
    /// Safe to call more times than the initial count (saturates at zero).
    pub fn count_down(&self) {
        let previous = self.count.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(1)));
        if let Ok(1) = previous {
            self.notify.notify_waiters();
        }
    }

    /// Current count (for diagnostics/tests).
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until the count reaches zero.
    pub async fn wait(&self) {
        loop {
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after subscribing to avoid the lost-wakeup race
            // between the initial load and the notification.
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}
