//! Teardown signal shared by the orchestrator and its waits

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// Set once when the dispatcher is destroyed
///
/// Retry delays and rate-limit waits sleep through [`CancellationSignal::sleep`]
/// so that teardown wakes them immediately.
#[derive(Debug, Default)]
pub struct CancellationSignal {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fail with `CANCELLED` if teardown already happened
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }

    /// Sleep for `delay` unless cancelled first
    pub async fn sleep(&self, delay: Duration) -> Result<()> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // register before checking the flag so a concurrent cancel is not missed
        notified.as_mut().enable();
        self.check()?;

        tokio::select! {
            _ = tokio::time::sleep(delay) => Ok(()),
            _ = &mut notified => Err(Error::cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_sleep_completes() {
        let signal = CancellationSignal::new();
        assert!(signal.sleep(Duration::from_millis(5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wakes_sleepers() {
        let signal = Arc::new(CancellationSignal::new());
        let sleeper = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.sleep(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = Instant::now();
        signal.cancel();
        let result = sleeper.await.unwrap();
        assert_eq!(result.unwrap_err().code(), ErrorCode::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_sleep_after_cancel_fails_fast() {
        let signal = CancellationSignal::new();
        signal.cancel();
        assert!(signal.check().is_err());
        assert!(signal.sleep(Duration::from_secs(30)).await.is_err());
    }
}
