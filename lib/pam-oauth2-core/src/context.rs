//! Cancellation and deadline handling for token fetches.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{CancelCause, TokenError};

/// Boxed future returned by the collaborator traits so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Caller-supplied limits for one token fetch.
///
/// A PAM login has its own timeout budget; the fetch context carries it down
/// to every network call so a hung endpoint cannot hang the login.
#[derive(Debug, Clone, Default)]
pub struct FetchContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl FetchContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// Uses the given cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Sets an absolute deadline.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Sets a deadline relative to now.
    #[must_use]
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns the cancellation token, e.g. to cancel from a signal handler.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the reason this context is already done, if it is.
    pub fn check(&self) -> Result<(), TokenError> {
        if self.cancel.is_cancelled() {
            return Err(TokenError::Cancelled {
                cause: CancelCause::Cancelled,
            });
        }
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            return Err(TokenError::Cancelled {
                cause: CancelCause::DeadlineExceeded,
            });
        }
        Ok(())
    }

    /// Drives `work` until it completes, the context is cancelled or the
    /// deadline elapses. Abandoned work is dropped.
    pub async fn run<T, F>(&self, work: F) -> Result<T, TokenError>
    where
        F: Future<Output = Result<T, TokenError>>,
    {
        self.check()?;

        let bounded = async {
            match self.deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, work)
                    .await
                    .unwrap_or(Err(TokenError::Cancelled {
                        cause: CancelCause::DeadlineExceeded,
                    })),
                None => work.await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(TokenError::Cancelled {
                cause: CancelCause::Cancelled,
            }),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn should_run_work_to_completion() {
        let ctx = FetchContext::background();
        let result = ctx.run(async { Ok::<_, TokenError>(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn should_refuse_work_when_already_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = FetchContext::background().with_cancellation(cancel);

        let result = ctx.run(async { Ok::<_, TokenError>(()) }).await;
        assert_eq!(
            result,
            Err(TokenError::Cancelled {
                cause: CancelCause::Cancelled
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn should_abort_work_past_deadline() {
        let ctx = FetchContext::background().with_timeout(Duration::from_secs(5));

        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TokenError>(())
            })
            .await;

        assert_eq!(
            result,
            Err(TokenError::Cancelled {
                cause: CancelCause::DeadlineExceeded
            })
        );
    }

    #[tokio::test]
    async fn should_abort_work_on_cancellation() {
        let ctx = FetchContext::background();
        let cancel = ctx.cancellation().clone();

        let work = ctx.run(async {
            std::future::pending::<()>().await;
            Ok::<_, TokenError>(())
        });
        cancel.cancel();

        assert_eq!(
            work.await,
            Err(TokenError::Cancelled {
                cause: CancelCause::Cancelled
            })
        );
    }
}
