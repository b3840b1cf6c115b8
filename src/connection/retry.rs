//! Connect retry: fixed delay, bounded attempts, unreachable-only

use std::future::Future;
use std::time::Duration;

use backon::{ConstantBuilder, Retryable};
use tracing::debug;

use crate::Error;
use crate::config::ConnectionConfig;

/// Retry policy for initial connects
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: usize,
    /// Delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// Create from config
    #[must_use]
    pub fn new(config: &ConnectionConfig) -> Self {
        Self {
            attempts: config.connect_attempts.max(1),
            delay: config.retry_delay,
        }
    }

    fn backoff(self) -> ConstantBuilder {
        ConstantBuilder::default()
            .with_delay(self.delay)
            .with_max_times(self.attempts - 1)
    }
}

/// Run `f` until it succeeds, fails with a non-retryable error, or the
/// attempts run out.
///
/// Only [`Error::BackendUnreachable`] is retried.
///
/// # Errors
///
/// Returns the last error from `f`.
pub async fn with_retry<F, Fut, T>(policy: RetryPolicy, backend: &str, f: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    f.retry(policy.backoff())
        .when(Error::is_retryable)
        .notify(|err: &Error, delay: Duration| {
            debug!(
                backend,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Connect failed, retrying"
            );
        })
        .await
}
