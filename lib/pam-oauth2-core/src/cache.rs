//! Token caching with single-flight refresh.
//!
//! # How it works
//!
//! - A valid cached token is returned under a read lock, without I/O.
//! - Otherwise the caller takes the refresh lock. Whoever gets it first
//!   fetches; the others wait on the lock.
//! - After acquiring the lock a caller re-checks the cache. If an attempt
//!   completed while it waited, it takes that attempt's outcome, token or
//!   error, instead of fetching again.
//! - A fetched token that is already expired counts as a failed fetch.
//! - A failed fetch leaves the cached token untouched and is not cached:
//!   the next caller that arrives after the failure starts a new attempt.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::context::FetchContext;
use crate::error::TokenError;
use crate::flow::FetchStrategy;
use crate::token::{DEFAULT_EXPIRY_SKEW, Token};

/// A token source that reuses a token until it is about to expire.
///
/// Share one instance (e.g. behind an [`Arc`](std::sync::Arc)) between all
/// callers of a process; at most one fetch is in flight at a time.
#[derive(Debug)]
pub struct CachedTokenSource<S> {
    strategy: S,
    current: RwLock<Option<Token>>,
    last_failure: Mutex<Option<TokenError>>,
    attempts: AtomicU64,
    expiry_skew: Duration,
}

impl<S: FetchStrategy> CachedTokenSource<S> {
    /// Creates an empty cache around `strategy`.
    pub fn new(strategy: S) -> Self {
        Self {
            strategy,
            current: RwLock::new(None),
            last_failure: Mutex::new(None),
            attempts: AtomicU64::new(0),
            expiry_skew: DEFAULT_EXPIRY_SKEW,
        }
    }

    /// Creates a cache seeded with `token`.
    pub fn with_token(strategy: S, token: Token) -> Self {
        let source = Self::new(strategy);
        Self {
            current: RwLock::new(Some(token)),
            ..source
        }
    }

    /// Overrides [`DEFAULT_EXPIRY_SKEW`].
    #[must_use]
    pub fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    /// The wrapped strategy.
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Returns the cached token, valid or not, without fetching.
    pub async fn cached_token(&self) -> Option<Token> {
        self.current.read().await.clone()
    }

    /// Returns a valid token, fetching one if needed.
    ///
    /// # Errors
    ///
    /// Returns the error of the fetch attempt this call observed.
    pub async fn token(&self) -> Result<Token, TokenError> {
        self.token_with(&FetchContext::background()).await
    }

    /// Like [`CachedTokenSource::token`], bounded by `ctx`.
    ///
    /// If `ctx` ends while this caller is fetching, every caller waiting on
    /// the same attempt receives [`TokenError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Returns the error of the fetch attempt this call observed, or
    /// [`TokenError::Cancelled`] if `ctx` ended first.
    pub async fn token_with(&self, ctx: &FetchContext) -> Result<Token, TokenError> {
        if let Some(token) = self.valid_token().await {
            return Ok(token);
        }

        let observed = self.attempts.load(Ordering::Acquire);
        let mut last_failure = ctx
            .run(async { Ok::<_, TokenError>(self.last_failure.lock().await) })
            .await?;

        if let Some(token) = self.valid_token().await {
            return Ok(token);
        }
        if self.attempts.load(Ordering::Acquire) != observed
            && let Some(err) = last_failure.as_ref()
        {
            debug!(flow = %self.strategy.flow(), "sharing the outcome of the concurrent fetch");
            return Err(err.clone());
        }

        debug!(flow = %self.strategy.flow(), "fetching a new token");
        let result = ctx
            .run(self.strategy.fetch_token(ctx))
            .await
            .and_then(|token| self.usable(token));
        match &result {
            Ok(token) => {
                *self.current.write().await = Some(token.clone());
                *last_failure = None;
            }
            Err(err) => {
                warn!(flow = %self.strategy.flow(), error = %err, "token fetch failed");
                *last_failure = Some(err.clone());
            }
        }
        self.attempts.fetch_add(1, Ordering::AcqRel);

        result
    }

    /// Drops the cached token so the next call fetches.
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    fn usable(&self, token: Token) -> Result<Token, TokenError> {
        if token.is_valid_with_skew(Duration::ZERO) {
            return Ok(token);
        }
        Err(TokenError::IncompleteToken {
            flow: self.strategy.flow(),
            hop: self.strategy.issuing_hop(),
            reason: "token expired on arrival".to_string(),
        })
    }

    async fn valid_token(&self) -> Option<Token> {
        let current = self.current.read().await;
        current
            .as_ref()
            .filter(|token| token.is_valid_with_skew(self.expiry_skew))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    use tokio::task::JoinSet;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::context::BoxFuture;
    use crate::error::{CancelCause, Flow, Hop};

    type Outcome = Box<dyn Fn(usize) -> Result<Token, TokenError> + Send + Sync>;

    /// Counts fetches; each one waits `delay` then yields `outcome(n)`.
    struct CountingStrategy {
        calls: AtomicUsize,
        delay: Duration,
        outcome: Outcome,
    }

    impl CountingStrategy {
        fn new(
            delay: Duration,
            outcome: impl Fn(usize) -> Result<Token, TokenError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                outcome: Box::new(outcome),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl FetchStrategy for CountingStrategy {
        fn flow(&self) -> Flow {
            Flow::ServiceAccount
        }

        fn fetch_token<'a>(&'a self, _ctx: &'a FetchContext) -> BoxFuture<'a, Result<Token, TokenError>> {
            Box::pin(async move {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if !self.delay.is_zero() {
                    tokio::time::sleep(self.delay).await;
                }
                (self.outcome)(call)
            })
        }
    }

    fn expiring_in(secs: u64) -> impl Fn(usize) -> Result<Token, TokenError> + Send + Sync {
        move |call| Ok(Token::new(format!("token-{call}")).with_expires_in(Duration::from_secs(secs)))
    }

    fn rejected() -> TokenError {
        TokenError::Rejected {
            flow: Flow::ServiceAccount,
            hop: Hop::TokenEndpoint,
            status: Some(400),
            reason: "invalid_grant".to_string(),
        }
    }

    #[tokio::test]
    async fn should_fetch_once_for_long_lived_token() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, expiring_in(60)));

        let first = source.token().await.expect("token");
        let second = source.token().await.expect("token");

        assert_eq!(first.access_token(), "token-0");
        assert_eq!(first, second);
        assert_eq!(source.strategy().calls(), 1);
    }

    #[tokio::test]
    async fn should_never_refetch_token_without_expiry() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, |call| {
            Ok(Token::new(format!("token-{call}")))
        }));

        for _ in 0..1000 {
            source.token().await.expect("token");
        }

        assert_eq!(source.strategy().calls(), 1);
    }

    #[tokio::test]
    async fn should_refetch_inside_skew_window() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, expiring_in(5)));

        source.token().await.expect("token");
        let token = source.token().await.expect("token");

        assert_eq!(token.access_token(), "token-1");
        assert_eq!(source.strategy().calls(), 2);
    }

    #[tokio::test]
    async fn should_honour_custom_skew() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, expiring_in(5)))
            .with_expiry_skew(Duration::from_secs(1));

        source.token().await.expect("token");
        source.token().await.expect("token");

        assert_eq!(source.strategy().calls(), 1);
    }

    #[tokio::test]
    async fn should_serve_seeded_token_without_fetching() {
        let seeded = Token::new("seeded").with_expires_in(Duration::from_secs(3600));
        let source = CachedTokenSource::with_token(
            CountingStrategy::new(Duration::ZERO, expiring_in(60)),
            seeded.clone(),
        );

        assert_eq!(source.token().await, Ok(seeded));
        assert_eq!(source.strategy().calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_fetch_once_for_concurrent_callers() {
        let source = Arc::new(CachedTokenSource::new(CountingStrategy::new(
            Duration::from_millis(50),
            expiring_in(3600),
        )));

        let mut callers = JoinSet::new();
        for _ in 0..32 {
            let source = Arc::clone(&source);
            callers.spawn(async move { source.token().await });
        }

        while let Some(result) = callers.join_next().await {
            let token = result.expect("caller task").expect("token");
            assert_eq!(token.access_token(), "token-0");
        }
        assert_eq!(source.strategy().calls(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn should_share_failure_with_waiters() {
        let source = Arc::new(CachedTokenSource::new(CountingStrategy::new(
            Duration::from_millis(50),
            |_| Err(rejected()),
        )));

        let mut callers = JoinSet::new();
        for _ in 0..16 {
            let source = Arc::clone(&source);
            callers.spawn(async move { source.token().await });
        }

        while let Some(result) = callers.join_next().await {
            assert_eq!(result.expect("caller task"), Err(rejected()));
        }
        assert_eq!(source.strategy().calls(), 1);

        // failures are not cached
        assert_eq!(source.token().await, Err(rejected()));
        assert_eq!(source.strategy().calls(), 2);
    }

    #[tokio::test]
    async fn should_keep_cached_token_when_fetch_fails() {
        let stale = Token::new("stale").with_expires_in(Duration::from_secs(1));
        let source = CachedTokenSource::with_token(
            CountingStrategy::new(Duration::ZERO, |_| Err(rejected())),
            stale.clone(),
        );

        assert_eq!(source.token().await, Err(rejected()));
        assert_eq!(source.cached_token().await, Some(stale));
    }

    #[tokio::test]
    async fn should_refuse_token_expired_on_arrival() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, |_| {
            Ok(Token::new("late").with_expires_in(Duration::ZERO))
        }));

        let result = source.token().await;

        assert_eq!(
            result,
            Err(TokenError::IncompleteToken {
                flow: Flow::ServiceAccount,
                hop: Hop::TokenEndpoint,
                reason: "token expired on arrival".to_string(),
            })
        );
        assert!(source.cached_token().await.is_none());
    }

    #[tokio::test]
    async fn should_recover_after_failure() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, |call| {
            if call == 0 {
                Err(TokenError::transport(Flow::ServiceAccount, Hop::TokenEndpoint, "reset"))
            } else {
                Ok(Token::new("recovered"))
            }
        }));

        assert!(source.token().await.is_err());
        let token = source.token().await.expect("second attempt");
        assert_eq!(token.access_token(), "recovered");
    }

    #[tokio::test]
    async fn should_fetch_again_after_invalidate() {
        let source = CachedTokenSource::new(CountingStrategy::new(Duration::ZERO, expiring_in(3600)));

        source.token().await.expect("token");
        source.invalidate().await;
        let token = source.token().await.expect("token");

        assert_eq!(token.access_token(), "token-1");
        assert_eq!(source.strategy().calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn should_give_up_at_deadline() {
        let source = CachedTokenSource::new(CountingStrategy::new(
            Duration::from_secs(60),
            expiring_in(3600),
        ));
        let ctx = FetchContext::background().with_timeout(Duration::from_secs(1));

        let result = source.token_with(&ctx).await;

        assert_eq!(
            result,
            Err(TokenError::Cancelled {
                cause: CancelCause::DeadlineExceeded
            })
        );
        assert!(source.cached_token().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn should_propagate_cancellation_to_waiters() {
        let source = Arc::new(CachedTokenSource::new(CountingStrategy::new(
            Duration::from_secs(30),
            expiring_in(3600),
        )));
        let cancel = CancellationToken::new();

        let fetcher = {
            let source = Arc::clone(&source);
            let ctx = FetchContext::background().with_cancellation(cancel.clone());
            tokio::spawn(async move { source.token_with(&ctx).await })
        };
        // let the first caller take the refresh lock
        while source.strategy().calls() == 0 {
            tokio::task::yield_now().await;
        }
        let waiter = {
            let source = Arc::clone(&source);
            tokio::spawn(async move { source.token().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        let cancelled = Err(TokenError::Cancelled {
            cause: CancelCause::Cancelled,
        });
        assert_eq!(fetcher.await.expect("fetcher task"), cancelled);
        assert_eq!(waiter.await.expect("waiter task"), cancelled);
        assert_eq!(source.strategy().calls(), 1);
    }
}
