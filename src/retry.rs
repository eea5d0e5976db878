//! Timeout and reconnection pacing utilities.
//!
//! The helpers in this module are transport-agnostic: a bounded timeout
//! wrapper, a consecutive-failure budget, and a delay that gives way to
//! cancellation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Counts consecutive failed connection attempts against a fixed limit.
#[derive(Clone, Debug)]
pub struct AttemptBudget {
    max_attempts: usize,
    failures: usize,
}

impl AttemptBudget {
    /// Creates a budget allowing `max_attempts` consecutive failures.
    ///
    /// A limit of zero is treated as one.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            failures: 0,
        }
    }

    /// Records one failed attempt and reports whether the budget is spent.
    pub fn record_failure(&mut self) -> bool {
        self.failures = self.failures.saturating_add(1);
        debug!(
            event = "attempt_failed",
            failures = self.failures,
            max_attempts = self.max_attempts
        );
        self.is_exhausted()
    }

    /// Clears the failure count after a successful attempt.
    pub fn reset(&mut self) {
        self.failures = 0;
    }

    /// Consecutive failures recorded since the last reset.
    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn is_exhausted(&self) -> bool {
        self.failures >= self.max_attempts
    }
}

/// Sleeps for `delay` unless `cancel` fires first.
///
/// Returns `true` when the full delay elapsed and `false` on cancellation.
pub async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken) -> bool {
    if delay.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{sleep_or_cancel, with_timeout, AttemptBudget};

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .expect("runtime")
    }

    #[test]
    fn budget_exhausts_after_max_consecutive_failures() {
        let mut budget = AttemptBudget::new(3);
        assert!(!budget.record_failure());
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
        assert_eq!(budget.failures(), 3);
    }

    #[test]
    fn reset_restores_full_budget() {
        let mut budget = AttemptBudget::new(2);
        budget.record_failure();
        budget.reset();
        assert_eq!(budget.failures(), 0);
        assert!(!budget.record_failure());
        assert!(budget.record_failure());
    }

    #[test]
    fn zero_limit_allows_a_single_attempt() {
        let mut budget = AttemptBudget::new(0);
        assert!(budget.record_failure());
    }

    #[test]
    fn sleep_gives_way_to_cancellation() {
        runtime().block_on(async {
            let cancel = CancellationToken::new();
            cancel.cancel();
            assert!(!sleep_or_cancel(Duration::from_secs(30), &cancel).await);
        });
    }

    #[test]
    fn sleep_completes_without_cancellation() {
        runtime().block_on(async {
            let cancel = CancellationToken::new();
            assert!(sleep_or_cancel(Duration::from_millis(1), &cancel).await);
        });
    }

    #[test]
    fn timeout_reports_elapsed() {
        runtime().block_on(async {
            let result = with_timeout(Duration::from_millis(1), std::future::pending::<()>()).await;
            assert!(result.is_err());
        });
    }
}
