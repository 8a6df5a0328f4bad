//! Retry with fixed backoff.
//!
//! Transport failures against the directory or mail store are retried
//! after a fixed delay, indefinitely unless a limit is configured, and the
//! wait is abandoned as soon as shutdown is requested.

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{ConnectorError, ConnectorResult};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Delay between attempts.
    pub delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Retry forever with the given delay.
    #[must_use]
    pub fn forever(delay: Duration) -> Self {
        Self {
            max_retries: None,
            delay,
        }
    }

    /// Limit the number of retries.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Retry executor with fixed backoff.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    /// Create a new retry executor with the given configuration.
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Delay between attempts.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.config.delay
    }

    /// Execute an operation, retrying transient errors.
    ///
    /// Permanent errors are returned immediately. Cancellation during the
    /// backoff sleep returns [`ConnectorError::Cancelled`].
    pub async fn execute<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> ConnectorResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ConnectorResult<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    let exhausted = self.config.max_retries.is_some_and(|max| attempt >= max);
                    if !e.is_transient() || exhausted {
                        return Err(e);
                    }

                    attempt = attempt.saturating_add(1);
                    warn!(
                        attempt,
                        delay_secs = self.config.delay.as_secs(),
                        error = %e,
                        "Transient failure, retrying after backoff"
                    );
                    if !sleep_or_cancel(cancel, self.config.delay).await {
                        debug!("Retry abandoned on cancellation");
                        return Err(ConnectorError::Cancelled);
                    }
                }
            }
        }
    }
}

/// Sleep for `duration` unless cancelled first. Returns `false` on cancellation.
pub async fn sleep_or_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
