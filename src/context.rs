//! Cooperative cancellation + deadline context threaded through every
//! network-bound operation. Kept intentionally small rather
//! than pulling in `tokio-util` for a single `CancellationToken`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

/// Cancellation signal shared between a `Context` and whoever can cancel it.
#[derive(Clone, Default)]
pub struct CancelHandle {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelHandle {
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

    async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        self.notify.notified().await;
    }
}

/// A deadline + cancellation signal passed into every handler/connector/
/// egress operation. Operations must return `Cancelled` promptly once
/// this fires, without partial bookkeeping mutation.
#[derive(Clone)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: CancelHandle,
}

impl Context {
    /// A context with no deadline and no cancellation (mostly for tests).
    pub fn background() -> Self {
        Self {
            deadline: None,
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_timeout(timeout: Duration) -> (Self, CancelHandle) {
        let cancel = CancelHandle::new();
        let ctx = Self {
            deadline: Some(Instant::now() + timeout),
            cancel: cancel.clone(),
        };
        (ctx, cancel)
    }

    pub fn with_cancel() -> (Self, CancelHandle) {
        let cancel = CancelHandle::new();
        let ctx = Self {
            deadline: None,
            cancel: cancel.clone(),
        };
        (ctx, cancel)
    }

    /// An already-cancelled context, for the "cancel before call"
    /// testable property.
    pub fn cancelled() -> Self {
        let cancel = CancelHandle::new();
        cancel.cancel();
        Self {
            deadline: None,
            cancel,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Remaining budget, clamped to `upper` (the operation's own default
    /// timeout). Returns `Duration::ZERO` if the deadline has passed.
    pub fn remaining(&self, upper: Duration) -> Duration {
        match self.deadline {
            Some(d) => d.saturating_duration_since(Instant::now()).min(upper),
            None => upper,
        }
    }

    /// Runs `fut` with this context's deadline/cancellation applied,
    /// racing the operation timeout against whichever is tighter.
    pub async fn run<F, T>(&self, op_timeout: Duration, fut: F) -> Result<T, ContextError>
    where
        F: std::future::Future<Output = T>,
    {
        if self.is_cancelled() {
            return Err(ContextError::Cancelled);
        }
        let budget = self.remaining(op_timeout);
        if budget.is_zero() {
            return Err(ContextError::DeadlineExceeded);
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ContextError::Cancelled),
            _ = tokio::time::sleep(budget) => Err(ContextError::DeadlineExceeded),
            out = fut => Ok(out),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("operation deadline exceeded")]
    DeadlineExceeded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn already_cancelled_fails_fast_without_running_future() {
        let ctx = Context::cancelled();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let start = std::time::Instant::now();
        let result = ctx
            .run(Duration::from_secs(5), async move {
                ran2.store(true, Ordering::SeqCst);
            })
            .await;
        assert_eq!(result, Err(ContextError::Cancelled));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn cancel_mid_flight_aborts_the_wait() {
        let (ctx, cancel) = Context::with_cancel();
        let handle = tokio::spawn(async move {
            ctx.run(Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        let result = handle.await.unwrap();
        assert_eq!(result, Err(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn deadline_expires_before_future_completes() {
        let (ctx, _cancel) = Context::with_timeout(Duration::from_millis(20));
        let result = ctx
            .run(Duration::from_secs(5), async {
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
            .await;
        assert_eq!(result, Err(ContextError::DeadlineExceeded));
    }
}
