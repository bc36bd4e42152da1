//! Process-wide shutdown signal.
//!
//! Once triggered the signal stays set. Blocked transport threads observe it
//! through [`ShutdownSignal::is_triggered`] on every wake of their wait loop;
//! the host loop awaits [`ShutdownSignal::triggered`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

use crate::error::{BridgeError, Result};

/// A set-once shutdown flag that can be cloned and shared across threads.
///
/// # Example
///
/// ```
/// use hgbridge_core::ShutdownSignal;
///
/// let signal = ShutdownSignal::new();
/// let observer = signal.clone();
///
/// assert!(signal.trigger());
/// assert!(observer.is_triggered());
/// // Triggering again is a no-op.
/// assert!(!signal.trigger());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    inner: Arc<ShutdownInner>,
}

#[derive(Debug, Default)]
struct ShutdownInner {
    triggered: AtomicBool,
    notify: Notify,
}

static GLOBAL: OnceLock<ShutdownSignal> = OnceLock::new();

impl ShutdownSignal {
    /// Create a new, untriggered signal.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide signal used by sessions that are not given their own.
    pub fn global() -> &'static ShutdownSignal {
        GLOBAL.get_or_init(ShutdownSignal::new)
    }

    /// Set the signal. Returns `true` only for the call that flipped it.
    pub fn trigger(&self) -> bool {
        let first = !self.inner.triggered.swap(true, Ordering::SeqCst);
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// Check whether the signal has been set.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    /// Wait until the signal is set.
    pub async fn triggered(&self) {
        loop {
            // Register before checking so a trigger in between is not lost.
            let notified = self.inner.notify.notified();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }

    /// Return `ShutdownAborted` once the signal is set.
    pub fn check(&self) -> Result<()> {
        if self.is_triggered() {
            Err(BridgeError::ShutdownAborted)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_signal_not_triggered() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.check().is_ok());
    }

    #[test]
    fn test_trigger_is_monotonic() {
        let signal = ShutdownSignal::new();
        assert!(signal.trigger());
        assert!(!signal.trigger());
        assert!(signal.is_triggered());
        assert!(matches!(signal.check(), Err(BridgeError::ShutdownAborted)));
    }

    #[test]
    fn test_clone_shares_state() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        clone.trigger();
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn test_triggered_resolves_after_trigger() {
        let signal = ShutdownSignal::new();
        let trigger = signal.clone();

        let waiter = tokio::spawn(async move { signal.triggered().await });
        tokio::task::yield_now().await;
        trigger.trigger();

        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_triggered_returns_immediately_when_set() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        signal.triggered().await;
    }
}
