//! Process-wide shutdown signal.
//!
//! [`Shutdown`] is a cloneable handle to a single lock-guarded flag that moves
//! from running to stopped exactly once. The accept loop checks it before each
//! accept and races every pending accept against [`Shutdown::triggered`], so
//! triggering it also closes the listener.

use std::sync::Arc;

use tokio::sync::watch;

/// Cloneable handle to the shared shutdown flag.
///
/// # Examples
///
/// ```
/// use cacheproxy::shutdown::Shutdown;
///
/// let shutdown = Shutdown::new();
/// let observer = shutdown.clone();
///
/// assert!(!observer.is_triggered());
/// assert!(shutdown.trigger());
/// assert!(observer.is_triggered());
/// assert!(!shutdown.trigger());
/// ```
#[derive(Debug, Clone)]
pub struct Shutdown {
    flag: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    /// Creates a flag in the running state.
    pub fn new() -> Self {
        let (flag, _) = watch::channel(false);
        Self {
            flag: Arc::new(flag),
        }
    }

    /// Moves the flag to stopped and wakes every waiter.
    ///
    /// Returns `true` only for the call that performed the transition.
    pub fn trigger(&self) -> bool {
        self.flag.send_if_modified(|stopped| {
            if *stopped {
                false
            } else {
                *stopped = true;
                true
            }
        })
    }

    /// Returns `true` once [`trigger`](Self::trigger) has been called.
    pub fn is_triggered(&self) -> bool {
        *self.flag.borrow()
    }

    /// Resolves once the flag is stopped; immediately if it already is.
    pub async fn triggered(&self) {
        let mut rx = self.flag.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn transitions_once() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_triggered());
        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        assert!(shutdown.is_triggered());
    }

    #[tokio::test]
    async fn waiters_wake_on_trigger() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.triggered().await })
        };

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        shutdown.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }

    #[tokio::test]
    async fn triggered_resolves_when_already_stopped() {
        let shutdown = Shutdown::new();
        shutdown.trigger();
        tokio::time::timeout(Duration::from_millis(100), shutdown.triggered())
            .await
            .unwrap();
    }
}
