use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use crate::core::errors::{ForemanError, Result};

/// Cooperative cancellation token threaded through stage execution.
///
/// Cancellation is flagged once and never reset; it is checked at every
/// suspension point (before an attempt, during a backoff sleep, between
/// stages) rather than delivered by exception. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation and wake all waiters.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve when cancellation is requested. Returns immediately if it
    /// already was.
    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            // Re-check after registering so a cancel between the load and
            // the registration is not missed.
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }

    /// Error-returning check for use with `?` at suspension points.
    pub fn check<O: Into<String>>(&self, operation: O) -> Result<()> {
        if self.is_cancelled() {
            Err(ForemanError::cancelled(operation))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_is_observed() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        assert!(token.check("op").is_ok());

        token.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(
            token.check("op"),
            Err(ForemanError::Cancelled { .. })
        ));
        // Already-cancelled token resolves immediately.
        token.cancelled().await;
    }

    #[tokio::test]
    async fn test_cancel_wakes_waiter() {
        let token = CancelToken::new();
        let waiter = token.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
