//! Cancellation support for resilience patterns
//!
//! Every engine-level wait (bulkhead queue, retry backoff) goes through a
//! [`CancellationContext`], which pairs a tokio [`CancellationToken`] with an
//! optional deadline. Whichever fires first ends the wait.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::error::ResilienceError;
use crate::core::result::ResilienceResult;

const DEADLINE_EXCEEDED: &str = "deadline exceeded";

/// Cancellation-aware operation context
#[derive(Debug, Clone)]
pub struct CancellationContext {
    /// Primary cancellation token
    token: CancellationToken,
    /// Optional reason for cancellation
    reason: Option<String>,
    /// Point in time after which the context counts as cancelled
    deadline: Option<Instant>,
}

impl CancellationContext {
    /// Create a new cancellation context
    #[must_use]
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: None,
            deadline: None,
        }
    }

    /// Create a cancellation context with a reason
    pub fn with_reason(reason: impl Into<String>) -> Self {
        Self {
            reason: Some(reason.into()),
            ..Self::new()
        }
    }

    /// Set an absolute deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline relative to now
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Create a child context that will be cancelled when parent is cancelled
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            reason: self.reason.clone(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Check if cancellation has been requested or the deadline has passed
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled() || self.deadline_passed()
    }

    fn deadline_passed(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Get the cancellation token
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Get the deadline, if any
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Get the cancellation reason if available
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        self.reason.as_deref()
    }

    /// Resolves once the token is cancelled or the deadline passes
    pub async fn cancelled(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// The error a caller should see once this context is done
    #[must_use]
    pub fn error(&self) -> ResilienceError {
        if !self.token.is_cancelled() && self.deadline_passed() {
            return ResilienceError::cancelled(Some(DEADLINE_EXCEEDED.to_string()));
        }
        ResilienceError::cancelled(self.reason.clone())
    }

    /// Sleep for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> ResilienceResult<()> {
        if self.is_cancelled() {
            return Err(self.error());
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => Ok(()),
            () = self.cancelled() => Err(self.error()),
        }
    }

    /// Execute an operation with cancellation support
    ///
    /// ```text
    /// tokio::select! {
    ///     result = operation() => result,
    ///     _ = shutdown.cancelled() => Err(Cancelled)
    /// }
    /// ```
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        tokio::select! {
            result = operation() => result,
            () = self.cancelled() => {
                tracing::debug!(reason = self.reason.as_deref().unwrap_or("none"), "operation cancelled");
                Err(self.error())
            }
        }
    }
}

impl Default for CancellationContext {
    fn default() -> Self {
        Self::new()
    }
}

impl From<CancellationToken> for CancellationContext {
    fn from(token: CancellationToken) -> Self {
        Self {
            token,
            reason: None,
            deadline: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleep_completes_without_cancellation() {
        let ctx = CancellationContext::new();
        assert!(ctx.sleep(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn sleep_returns_early_on_cancel() {
        let ctx = CancellationContext::with_reason("shutdown");
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });

        let start = Instant::now();
        let err = ctx.sleep(Duration::from_secs(60)).await.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(err.to_string(), "operation cancelled: shutdown");
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_cancels_sleep() {
        let ctx = CancellationContext::new().with_timeout(Duration::from_millis(100));
        let err = ctx.sleep(Duration::from_secs(10)).await.unwrap_err();
        assert_eq!(err.to_string(), "operation cancelled: deadline exceeded");
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = CancellationContext::new()
            .with_deadline(now + Duration::from_secs(5))
            .with_deadline(now + Duration::from_secs(1));
        assert_eq!(ctx.deadline(), Some(now + Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn child_follows_parent() {
        let parent = CancellationContext::new();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
        let result = child
            .execute(|| std::future::pending::<ResilienceResult<()>>())
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }
}
