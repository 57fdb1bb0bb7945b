//! Retry executor for remote calls.
//!
//! Wraps a single remote operation with exponential backoff and a one-shot
//! token refresh on authentication failure. Concurrent refreshes are
//! coalesced: only the first caller to observe a stale token runs the refresh
//! handler, later callers share its outcome. They retry with the token it
//! produced, or fail with the original error if it failed.

use futures::FutureExt;
use futures::future::BoxFuture;
use rand::Rng;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tonic::Code;
use tracing::{info, warn};

use super::connection::TokenSink;
use crate::config::RetrySettings;
use crate::error::RpcError;

/// Decides whether a failure is worth another attempt.
pub type RetryablePredicate = fn(&RpcError) -> bool;

/// Produces a fresh bearer token.
pub type TokenRefreshHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<String, RpcError>> + Send + Sync>;

/// Observes a failure that exhausted its retry budget: last error and number of calls made.
pub type RetryExhaustedObserver = Arc<dyn Fn(&RpcError, u32) + Send + Sync>;

/// Per-call-site retry configuration.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    pub retryable: RetryablePredicate,
    /// Allow one token refresh and retry on authentication failure.
    pub allow_token_refresh: bool,
    /// Add up to 25% random jitter on top of each delay.
    pub add_jitter: bool,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("allow_token_refresh", &self.allow_token_refresh)
            .field("add_jitter", &self.add_jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            retryable: is_retryable,
            allow_token_refresh: true,
            add_jitter: false,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    /// Exactly one attempt, no token refresh. For calls that must never be
    /// submitted twice, such as redeeming a one-time invitation secret.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            allow_token_refresh: false,
            ..Default::default()
        }
    }

    /// Short delays for interactive reads.
    pub fn quick() -> Self {
        Self {
            max_attempts: 2,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_millis(500),
            ..Default::default()
        }
    }

    /// More attempts and longer, jittered delays for background work that
    /// nobody is waiting on.
    pub fn aggressive() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            add_jitter: true,
            ..Default::default()
        }
    }

    /// Delay before retrying after the given failed attempt (1-based):
    /// `min(base_delay * 2^(attempt-1), max_delay)`.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        let backoff = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.add_jitter && !backoff.is_zero() {
            let jitter = rand::thread_rng().gen_range(0.0..0.25);
            return backoff + backoff.mul_f64(jitter);
        }

        backoff
    }
}

/// Default retryable classification: transport failures and transient server statuses.
pub fn is_retryable(err: &RpcError) -> bool {
    match err {
        RpcError::Transport(_) => true,
        RpcError::Server { code, .. } => matches!(
            code,
            Code::Unavailable       // Backend temporarily unavailable
            | Code::DeadlineExceeded // Timeout
            | Code::ResourceExhausted // Rate limited
            | Code::Aborted // Concurrency conflict, safe to retry
        ),
        _ => false,
    }
}

/// Runs remote operations under a `RetryPolicy`.
pub struct RetryExecutor {
    tokens: Arc<dyn TokenSink>,
    refresh_handler: RwLock<Option<TokenRefreshHandler>>,
    on_exhausted: RwLock<Option<RetryExhaustedObserver>>,
    /// Number of refresh handler runs so far. Bumped while `refresh_lock` is held.
    refresh_round: AtomicU64,
    /// Outcome of the latest handler run.
    refresh_lock: tokio::sync::Mutex<Result<(), RpcError>>,
}

impl RetryExecutor {
    pub fn new(tokens: Arc<dyn TokenSink>) -> Self {
        Self {
            tokens,
            refresh_handler: RwLock::new(None),
            on_exhausted: RwLock::new(None),
            refresh_round: AtomicU64::new(0),
            refresh_lock: tokio::sync::Mutex::new(Ok(())),
        }
    }

    pub fn set_token_refresh_handler<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, RpcError>> + Send + 'static,
    {
        let handler: TokenRefreshHandler = Arc::new(move || handler().boxed());
        *self
            .refresh_handler
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_on_retry_exhausted<F>(&self, observer: F)
    where
        F: Fn(&RpcError, u32) + Send + Sync + 'static,
    {
        *self.on_exhausted.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(observer));
    }

    /// Execute an operation with retry.
    ///
    /// # Example
    /// ```ignore
    /// let guests = executor
    ///     .execute(&RetryPolicy::default(), "list_guests", || {
    ///         connection.call(GUEST_SERVICE, "ListGuests", request.clone())
    ///     })
    ///     .await?;
    /// ```
    pub async fn execute<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        operation_name: &str,
        operation: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        self.run(policy, operation_name, None, operation).await
    }

    /// Like `execute`, but gives up with `RpcError::Cancelled` once `cancel`
    /// fires, checked before every attempt and raced against every backoff sleep.
    pub async fn execute_cancellable<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        operation_name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        self.run(policy, operation_name, Some(cancel), operation)
            .await
    }

    async fn run<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        operation_name: &str,
        cancel: Option<&CancellationToken>,
        mut operation: F,
    ) -> Result<T, RpcError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RpcError>>,
    {
        let max_attempts = policy.max_attempts.max(1);
        // Generic attempt slot, 1-based. The auth retry does not advance it.
        let mut attempt: u32 = 1;
        let mut calls: u32 = 0;
        let mut refreshed = false;

        loop {
            if cancel.is_some_and(|c| c.is_cancelled()) {
                return Err(RpcError::Cancelled);
            }

            let epoch = self.tokens.token_epoch();
            let round = self.refresh_round.load(Ordering::Acquire);
            calls += 1;

            let err = match operation().await {
                Ok(value) => {
                    if calls > 1 {
                        info!(
                            operation = operation_name,
                            calls, "Remote call succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => err,
            };

            if err.is_auth_failure() && policy.allow_token_refresh && !refreshed {
                if let Some(handler) = self.current_refresh_handler() {
                    refreshed = true;
                    match self.refresh_token(epoch, round, handler).await {
                        Ok(()) => {
                            info!(
                                operation = operation_name,
                                "Retrying after token refresh"
                            );
                            continue;
                        }
                        Err(refresh_err) => {
                            warn!(
                                operation = operation_name,
                                error = %refresh_err,
                                "Token refresh failed"
                            );
                            return Err(err);
                        }
                    }
                }
            }

            if !(policy.retryable)(&err) {
                warn!(
                    operation = operation_name,
                    error = %err,
                    "Remote call failed with non-retryable error"
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                warn!(
                    operation = operation_name,
                    calls,
                    error = %err,
                    "Remote call failed after max attempts"
                );
                metrics::counter!("rpc_retry_exhausted_total").increment(1);
                if let Some(observer) = self.current_exhausted_observer() {
                    observer(&err, calls);
                }
                return Err(err);
            }

            let backoff = policy.backoff_duration(attempt);
            warn!(
                operation = operation_name,
                attempt,
                error = %err,
                backoff_ms = backoff.as_millis() as u64,
                "Remote call failed, retrying after backoff"
            );
            metrics::counter!("rpc_retries_total").increment(1);

            match cancel {
                Some(cancel) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RpcError::Cancelled),
                        _ = sleep(backoff) => {}
                    }
                }
                None => sleep(backoff).await,
            }
            attempt += 1;
        }
    }

    /// Refresh the token unless it changed since `observed_epoch`. A caller
    /// that queued behind a handler run started after `observed_round` takes
    /// that run's outcome instead of invoking the handler again.
    async fn refresh_token(
        &self,
        observed_epoch: u64,
        observed_round: u64,
        handler: TokenRefreshHandler,
    ) -> Result<(), RpcError> {
        let mut last = self.refresh_lock.lock().await;

        if self.refresh_round.load(Ordering::Acquire) != observed_round {
            tracing::debug!(ok = last.is_ok(), "Sharing concurrent token refresh outcome");
            return last.clone();
        }
        if self.tokens.token_epoch() != observed_epoch {
            tracing::debug!("Token already replaced since the call started");
            return Ok(());
        }

        metrics::counter!("rpc_token_refresh_total").increment(1);
        let outcome = match handler().await {
            Ok(token) => {
                self.tokens.set_token(Some(token));
                info!("Bearer token refreshed");
                Ok(())
            }
            Err(err) => Err(err),
        };
        *last = outcome.clone();
        self.refresh_round.fetch_add(1, Ordering::Release);
        outcome
    }

    fn current_refresh_handler(&self) -> Option<TokenRefreshHandler> {
        self.refresh_handler.read().ok().and_then(|h| h.clone())
    }

    fn current_exhausted_observer(&self) -> Option<RetryExhaustedObserver> {
        self.on_exhausted.read().ok().and_then(|o| o.clone())
    }
}
