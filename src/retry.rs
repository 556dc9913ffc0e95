//! Retry utilities with exponential backoff and jitter.
//!
//! Every external call the runner makes (ARM requests, kubectl, ssh) goes
//! through [`retry`]. A [`RetryPolicy`] bounds the attempts either by count or
//! by elapsed time, and names the error kinds that must fail fast instead of
//! being retried.
//!
//! # Example
//!
//! ```ignore
//! use e2e_runner::retry::{retry, RetryPolicy};
//!
//! let rg = retry(
//!     &RetryPolicy::with_max_attempts(5),
//!     "get_resource_group",
//!     &cancel,
//!     || async { cloud.get(&rg_ref).await },
//! ).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::error::{Error, ErrorKind, Result};

/// How long a retry loop may keep going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryLimit {
    /// Stop after this many invocations of the operation
    Attempts(u32),
    /// Stop once this much time has elapsed since the first invocation
    Elapsed(Duration),
    /// Retry until success, a terminal error, or cancellation
    Unbounded,
}

/// Configuration for operations that may fail transiently.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Attempt or duration bound
    pub limit: RetryLimit,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Ceiling for the backoff delay
    pub max_delay: Duration,
    /// Multiplier applied after each failure (1.0 = constant delay)
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
    /// Error kinds returned immediately without consuming a retry
    pub terminal: Vec<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            limit: RetryLimit::Attempts(5),
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            terminal: Self::default_terminal(),
        }
    }
}

impl RetryPolicy {
    /// Error kinds no retry loop should spend attempts on: hard validation
    /// failures, configuration problems, exceeded timeouts and unrecoverable states.
    pub fn default_terminal() -> Vec<ErrorKind> {
        vec![
            ErrorKind::VersionMismatch,
            ErrorKind::NonCiImage,
            ErrorKind::ConformanceTestsFailed,
            ErrorKind::Configuration,
            ErrorKind::BuildFailed,
            ErrorKind::InvalidState,
            ErrorKind::PollTimeout,
            ErrorKind::CommandTimeout,
        ]
    }

    /// Create a policy bounded by attempt count
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            limit: RetryLimit::Attempts(attempts),
            ..Default::default()
        }
    }

    /// Create a policy bounded by elapsed time
    pub fn with_max_duration(duration: Duration) -> Self {
        Self {
            limit: RetryLimit::Elapsed(duration),
            ..Default::default()
        }
    }

    /// Create a policy that retries until success or a terminal error
    pub fn unbounded() -> Self {
        Self {
            limit: RetryLimit::Unbounded,
            ..Default::default()
        }
    }

    /// Set the backoff ceiling
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Set the first delay
    pub fn initial_delay(mut self, initial_delay: Duration) -> Self {
        self.initial_delay = initial_delay;
        self
    }

    /// Use a constant delay between attempts
    pub fn constant(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self.max_delay = delay;
        self.backoff_multiplier = 1.0;
        self
    }

    /// Disable jitter (deterministic delays)
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Add error kinds that must fail fast
    pub fn terminal_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        for kind in kinds {
            if !self.terminal.contains(&kind) {
                self.terminal.push(kind);
            }
        }
        self
    }

    /// Make error kinds retryable again
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let kinds: Vec<ErrorKind> = kinds.into_iter().collect();
        self.terminal.retain(|k| !kinds.contains(k));
        self
    }

    /// Whether an error must be returned without retrying
    pub fn is_terminal(&self, err: &Error) -> bool {
        let kind = err.kind();
        kind == ErrorKind::Cancelled || self.terminal.contains(&kind)
    }

    fn next_delay(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if !self.jitter {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(delay.as_secs_f64() * factor)
    }
}

/// Execute an async operation under a [`RetryPolicy`].
///
/// Returns the first success. Terminal errors and cancellation are returned
/// as-is; running out of attempts or time returns [`Error::RetriesExhausted`]
/// wrapping the last error.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = Instant::now();
    let mut attempt = 0u32;
    let mut delay = policy.initial_delay;

    loop {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation_name));
        }
        attempt += 1;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            outcome = operation() => outcome,
        };

        let err = match outcome {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if policy.is_terminal(&err) {
            warn!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation failed with a terminal error, not retrying"
            );
            return Err(err);
        }

        let mut sleep_for = policy.jittered(delay);
        let exhausted = match policy.limit {
            RetryLimit::Attempts(max) => attempt >= max,
            RetryLimit::Elapsed(budget) => {
                let elapsed = start.elapsed();
                if elapsed >= budget {
                    true
                } else {
                    sleep_for = sleep_for.min(budget - elapsed);
                    false
                }
            }
            RetryLimit::Unbounded => false,
        };

        if exhausted {
            error!(
                operation = %operation_name,
                attempt = attempt,
                error = %err,
                "Operation failed after max retries"
            );
            return Err(Error::RetriesExhausted {
                operation: operation_name.to_string(),
                attempts: attempt,
                source: Box::new(err),
            });
        }

        warn!(
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            delay_ms = sleep_for.as_millis(),
            "Operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled(operation_name)),
            _ = tokio::time::sleep(sleep_for) => {}
        }

        delay = policy.next_delay(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy(attempts: u32) -> RetryPolicy {
        RetryPolicy::with_max_attempts(attempts)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(10))
    }

    fn connection_refused() -> Error {
        Error::ConnectionFailed {
            target: "capi@20.0.0.1".to_string(),
            message: "Connection refused".to_string(),
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let cancel = CancellationToken::new();
        let result = retry(&fast_policy(3), "op", &cancel, || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result = retry(&fast_policy(5), "op", &cancel, || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(connection_refused())
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    // ==========================================================================
    // Story: Retry bound is exact
    // ==========================================================================

    #[tokio::test]
    async fn when_operation_always_fails_it_runs_exactly_max_attempts_times() {
        for max in [1u32, 2, 3, 7] {
            let count = Arc::new(AtomicU32::new(0));
            let c = count.clone();
            let cancel = CancellationToken::new();

            let result: Result<()> = retry(&fast_policy(max), "op", &cancel, || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(connection_refused())
                }
            })
            .await;

            assert_eq!(count.load(Ordering::SeqCst), max);
            match result {
                Err(Error::RetriesExhausted {
                    attempts, source, ..
                }) => {
                    assert_eq!(attempts, max);
                    assert!(source.to_string().contains("Connection refused"));
                }
                other => panic!("expected RetriesExhausted, got {:?}", other),
            }
        }
    }

    // ==========================================================================
    // Story: Terminal errors short-circuit
    // ==========================================================================

    #[tokio::test]
    async fn when_error_kind_is_terminal_operation_runs_once() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        let policy = fast_policy(10).terminal_on([ErrorKind::RemoteCommandFailed]);

        let result: Result<()> = retry(&policy, "clone", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::RemoteCommandFailed {
                    target: "capi@20.0.0.1".to_string(),
                    exit_code: 128,
                    stderr: "destination path already exists".to_string(),
                })
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(Error::RemoteCommandFailed { exit_code: 128, .. })
        ));
    }

    #[tokio::test]
    async fn when_version_mismatch_default_policy_does_not_retry() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<()> = retry(&fast_policy(5), "validate", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::VersionMismatch {
                    node: "n1".to_string(),
                    component: "kubelet".to_string(),
                    expected: "v1.27.1".to_string(),
                    found: "v1.27.0".to_string(),
                })
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::VersionMismatch);
    }

    #[tokio::test]
    async fn when_kind_is_made_retryable_it_is_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        let policy = fast_policy(3).retry_on([ErrorKind::PollTimeout]);

        let _: Result<()> = retry(&policy, "setup_cluster", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::PollTimeout {
                    description: "machines".to_string(),
                    timeout: Duration::from_secs(1),
                    last_reason: "0/1 running".to_string(),
                })
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    // ==========================================================================
    // Story: Cancellation is never retried
    // ==========================================================================

    #[tokio::test]
    async fn when_cancelled_before_start_operation_never_runs() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = retry(&RetryPolicy::unbounded(), "op", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn when_operation_reports_cancelled_it_is_not_retried() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();
        let cancel = CancellationToken::new();

        let result: Result<()> = retry(&RetryPolicy::unbounded(), "op", &cancel, || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(Error::cancelled("inner"))
            }
        })
        .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn when_cancelled_during_backoff_sleep_retry_stops() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let policy = RetryPolicy::unbounded()
            .constant(Duration::from_secs(30))
            .without_jitter();

        let handle = tokio::spawn(async move {
            retry(&policy, "op", &cancel, || async {
                Err::<(), _>(connection_refused())
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Cancelled);
    }

    // ==========================================================================
    // Story: Duration-bounded retries stop at the budget
    // ==========================================================================

    #[tokio::test(start_paused = true)]
    async fn when_duration_bound_elapses_last_error_is_wrapped() {
        let cancel = CancellationToken::new();
        let policy = RetryPolicy::with_max_duration(Duration::from_secs(60))
            .constant(Duration::from_secs(10))
            .without_jitter();
        let start = Instant::now();

        let result: Result<()> =
            retry(&policy, "op", &cancel, || async { Err(connection_refused()) }).await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60));
        assert!(elapsed < Duration::from_secs(71));
        assert!(matches!(result, Err(Error::RetriesExhausted { .. })));
    }

    #[test]
    fn backoff_is_capped_at_max_delay() {
        let policy = RetryPolicy::with_max_attempts(10)
            .initial_delay(Duration::from_secs(8))
            .max_delay(Duration::from_secs(10));
        assert_eq!(
            policy.next_delay(Duration::from_secs(8)),
            Duration::from_secs(10)
        );
        assert_eq!(
            policy.next_delay(Duration::from_secs(10)),
            Duration::from_secs(10)
        );
    }
}
