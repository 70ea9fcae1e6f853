//! Composite cancellation signal.

use futures::future::select_all;
use hataori_core::RunError;
use tokio_util::sync::CancellationToken;

/// Cancellation signal composed of several tokens.
///
/// The signal is aborted as soon as any token is cancelled. A run's signal
/// holds its own token plus its owner's lifetime token, the caller's token
/// and every ancestor run's tokens, so aborting any of them reaches all
/// descendants.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    tokens: Vec<CancellationToken>,
    run_id: String,
}

impl AbortSignal {
    /// A signal that never aborts.
    pub fn new() -> Self {
        Self::default()
    }

    /// A signal backed by one token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            tokens: vec![token],
            run_id: String::new(),
        }
    }

    /// Names the run reported by [`check`](Self::check).
    pub fn for_run(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Adds a token to the composition.
    pub fn with(mut self, token: CancellationToken) -> Self {
        self.tokens.push(token);
        self
    }

    /// Combines this signal with every token of `other`.
    pub fn merge(mut self, other: &AbortSignal) -> Self {
        self.tokens.extend(other.tokens.iter().cloned());
        self
    }

    /// Returns `true` if any token has been cancelled.
    pub fn is_aborted(&self) -> bool {
        self.tokens.iter().any(CancellationToken::is_cancelled)
    }

    /// Fails with [`RunError::Aborted`] if any token has been cancelled.
    pub fn check(&self) -> Result<(), RunError> {
        if self.is_aborted() {
            return Err(RunError::Aborted {
                run_id: self.run_id.clone(),
            });
        }
        Ok(())
    }

    /// Resolves once any token is cancelled. Never resolves for an empty
    /// signal.
    pub async fn aborted(&self) {
        if self.tokens.is_empty() {
            return std::future::pending().await;
        }
        let waits = self.tokens.iter().map(|token| Box::pin(token.cancelled()));
        select_all(waits).await;
    }
}

impl From<CancellationToken> for AbortSignal {
    fn from(token: CancellationToken) -> Self {
        Self::from_token(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_any_token_aborts() {
        let own = CancellationToken::new();
        let ancestor = CancellationToken::new();
        let signal = AbortSignal::from_token(own.clone()).with(ancestor.clone());

        assert!(!signal.is_aborted());
        ancestor.cancel();
        assert!(signal.is_aborted());
        assert!(!own.is_cancelled());
    }

    #[test]
    fn test_merge_includes_parent_tokens() {
        let parent_token = CancellationToken::new();
        let parent = AbortSignal::from_token(parent_token.clone());
        let child = AbortSignal::from_token(CancellationToken::new()).merge(&parent);

        parent_token.cancel();
        assert!(child.is_aborted());
        assert!(!AbortSignal::new().is_aborted());
    }

    #[test]
    fn test_check_reports_run() {
        let token = CancellationToken::new();
        let signal = AbortSignal::from_token(token.clone()).for_run("run-1");

        assert!(signal.check().is_ok());
        token.cancel();
        assert!(matches!(signal.check(), Err(RunError::Aborted { run_id }) if run_id == "run-1"));
    }

    #[test]
    fn test_aborted_pending_until_cancel() {
        let token = CancellationToken::new();
        let signal = AbortSignal::from_token(token.clone());
        let mut wait = tokio_test::task::spawn(signal.aborted());
        tokio_test::assert_pending!(wait.poll());

        token.cancel();
        assert!(wait.is_woken());
        tokio_test::assert_ready!(wait.poll());

        let empty = AbortSignal::new();
        let mut never = tokio_test::task::spawn(empty.aborted());
        tokio_test::assert_pending!(never.poll());
    }

    #[tokio::test]
    async fn test_aborted_resolves() {
        let token = CancellationToken::new();
        let signal = AbortSignal::new().with(CancellationToken::new()).with(token.clone());

        let waiter = tokio::spawn(async move { signal.aborted().await });
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), waiter).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
