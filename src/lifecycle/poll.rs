//! Cancellable polling with transient-error retry

use crate::error::{ZeroError, ZeroResult};

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How often and how long a wait polls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
    /// `None` polls until cancelled
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            max_attempts: None,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

/// Call `attempt` every `policy.interval` until it yields a value
///
/// `Ok(None)` means "not yet". Retryable errors count as "not yet"; any other error
/// ends the wait. Cancellation interrupts an attempt in flight as well as the sleep.
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut attempt: F,
) -> ZeroResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ZeroResult<Option<T>>>,
{
    let mut attempts: u32 = 0;
    let mut last_error: Option<ZeroError> = None;

    let cancelled = |attempts: u32| {
        debug!("{} cancelled after {} attempts", operation, attempts);
        ZeroError::Cancelled {
            operation: operation.to_string(),
        }
    };

    loop {
        if cancel.is_cancelled() {
            return Err(cancelled(attempts));
        }

        attempts += 1;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled(attempts)),
            outcome = attempt() => outcome,
        };

        match outcome {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(e) if e.is_retryable() => {
                warn!("{} attempt {} failed, retrying: {}", operation, attempts, e);
                last_error = Some(e);
            }
            Err(e) => return Err(e),
        }

        if policy.max_attempts.is_some_and(|max| attempts >= max) {
            return Err(last_error.unwrap_or_else(|| ZeroError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
            }));
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
}
