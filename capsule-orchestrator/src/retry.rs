use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use capsule_core::error::{ErrorKind, Result};
use tracing::warn;

/// Bounded-retry wrapper around a fallible unit of work.
///
/// Attempt 1 runs immediately. A failure whose [`ErrorKind`] is in the
/// retryable set sleeps `delay` and tries again, up to `max_attempts` total
/// invocations; any other failure propagates on first occurrence. When the
/// cap is exhausted, the last failure is surfaced as terminal.
///
/// Used both for primary command execution and for the compensating cleanup
/// write, which can suffer the same transient store faults.
#[derive(Debug, Clone)]
pub struct RetriableTask {
    delay: Duration,
    max_attempts: u32,
    retryable: HashSet<ErrorKind>,
}

impl RetriableTask {
    pub fn new<I>(delay: Duration, max_attempts: u32, retryable: I) -> Self
    where
        I: IntoIterator<Item = ErrorKind>,
    {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
            retryable: retryable.into_iter().collect(),
        }
    }

    /// The executor used around persistence-store writes: transient database
    /// faults retried with the service defaults (1 s delay, 3 attempts).
    pub fn for_store_writes() -> Self {
        Self::new(Duration::from_millis(1000), 3, [ErrorKind::Database])
    }

    pub async fn run<T, F, Fut>(&self, mut work: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match work().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && self.retryable.contains(&err.kind()) => {
                    warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %err,
                        "retriable failure, retrying after delay"
                    );
                    tokio::time::sleep(self.delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
