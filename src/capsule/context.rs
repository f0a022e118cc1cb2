//! Per-call context: an optional deadline and a cancellation signal.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Caller-controlled bounds on a single tool call.
///
/// The timeout is measured by the manager's clock from the moment the call
/// starts. Cancelling the token aborts the wait from any task.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl CallContext {
    /// A context with no deadline.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            cancel: CancellationToken::new(),
        }
    }

    /// Tie the call to an existing token, e.g. the caller's request scope.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Completes once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_deadline() {
        let ctx = CallContext::new();
        assert!(ctx.timeout().is_none());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_from_clone() {
        let ctx = CallContext::with_timeout(Duration::from_secs(1));
        let token = ctx.cancellation_token();
        token.cancel();
        ctx.cancelled().await;
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.timeout(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_child_token_follows_parent() {
        let parent = CancellationToken::new();
        let ctx = CallContext::new().with_cancellation(parent.child_token());
        parent.cancel();
        assert!(ctx.is_cancelled());
    }
}
