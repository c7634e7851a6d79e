//! Retry logic with exponential backoff
//!
//! Transient failures against the catalog API are retried with exponential
//! backoff and optional jitter. The downloader runs its own retry loop (it
//! needs shutdown checks and progress resets between attempts); this module
//! serves the search and transport layers.

use crate::error::Error;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry configuration for transient failures
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (default: 3)
    pub max_retries: u32,
    /// Base delay before the first retry (default: 2 seconds)
    pub base_delay: Duration,
    /// Maximum delay between retries (default: 60 seconds)
    pub max_delay: Duration,
    /// Add random jitter to delays (default: false)
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            jitter: false,
        }
    }
}

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (connection reset, timeout, incomplete read, catalog
/// HTTP errors) return `true`. Permanent failures (bad config, digest
/// mismatch, processor errors) return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // The transport library folds connection errors, timeouts,
            // protocol errors, and incomplete reads into this variant.
            Error::Network(_) => true,
            // Generic OS I/O during a transfer is treated as transient.
            Error::Io(_) => true,
            // Per-item deadline expiry is worth another attempt.
            Error::Timeout(_) => true,
            // Catalog responses the client could not interpret usually mean
            // a flaky upstream, not a permanent condition.
            Error::Catalog(_) => true,
            // Everything else is permanent.
            Error::Config { .. }
            | Error::InvalidInput(_)
            | Error::Credentials(_)
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::DigestMismatch { .. }
            | Error::PostProcess(_)
            | Error::NotFound(_)
            | Error::ShuttingDown
            | Error::Serialization(_)
            | Error::Yaml(_)
            | Error::Other(_) => false,
        }
    }
}

/// Execute an async operation, retrying transient failures with exponential
/// backoff (`base_delay * 2^attempt`, capped at `max_delay`).
///
/// Returns the successful result, or the last error once retries are
/// exhausted or a non-retryable error occurs.
pub async fn retry_with_backoff<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_retries => {
                let delay = backoff_delay(config, attempt);
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_retries = config.max_retries,
                    delay_ms = delay.as_millis(),
                    "Transient error, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Delay before retry number `attempt + 1`
pub(crate) fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config.base_delay.as_secs_f64() * 2f64.powi(attempt as i32);
    let mut delay = Duration::from_secs_f64(exp).min(config.max_delay);
    if config.jitter {
        delay = add_jitter(delay);
    }
    delay
}

/// Add random jitter between 0% and 100% of the delay
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + jitter_factor))
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            jitter: false,
        }
    }

    #[tokio::test]
    async fn success_does_not_retry() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(3), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_error_retries_until_success() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(3), || {
            let c = c.clone();
            async move {
                if c.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(2), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        assert!(result.is_err());
        // initial attempt + 2 retries
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_fails_immediately() {
        let counter = Arc::new(AtomicU32::new(0));
        let c = counter.clone();

        let result = retry_with_backoff(&fast_config(5), || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn backoff_doubles_per_attempt_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            jitter: false,
        };
        assert_eq!(backoff_delay(&config, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&config, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(&config, 2), Duration::from_secs(8));
        // 2 * 2^3 = 16 capped at 10
        assert_eq!(backoff_delay(&config, 3), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_double_the_delay() {
        let config = RetryConfig {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..100 {
            let d = backoff_delay(&config, 0);
            assert!(d >= Duration::from_millis(100));
            assert!(d <= Duration::from_millis(200));
        }
    }

    #[test]
    fn network_io_timeout_catalog_are_retryable() {
        let io = Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Catalog("bad gateway".into()).is_retryable());
    }

    #[test]
    fn permanent_classes_are_not_retryable() {
        assert!(!Error::config("bad").is_retryable());
        assert!(!Error::InvalidInput("no time range".into()).is_retryable());
        assert!(!Error::Credentials("missing key".into()).is_retryable());
        assert!(
            !Error::DigestMismatch {
                path: "/tmp/p".into(),
                expected: "a".into(),
                computed: "b".into(),
            }
            .is_retryable()
        );
        assert!(!Error::PostProcess("hook".into()).is_retryable());
        assert!(!Error::ShuttingDown.is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Other("x".into()).is_retryable());
    }
}
