//! Bounded linear-backoff retry for record handling.
//!
//! # Invariants
//! - The n-th wait is `n * base_unit`.
//! - A retry is scheduled only while `elapsed + wait < window`; otherwise the
//!   last error is final.
//! - An attempt in flight always runs to completion; shutdown only cuts a
//!   pending backoff sleep short.

use crate::lifecycle::ShutdownSignal;
use log::warn;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

const DEFAULT_BASE_UNIT: Duration = Duration::from_secs(1);
const DEFAULT_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_unit: Duration,
    pub window: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_unit: DEFAULT_BASE_UNIT,
            window: DEFAULT_WINDOW,
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`.
    pub fn wait(&self, attempt: u32) -> Duration {
        self.base_unit.saturating_mul(attempt)
    }
}

/// How a retried operation ended.
#[derive(Debug, PartialEq, Eq)]
pub enum RetryOutcome<E> {
    Succeeded { attempts: u32 },
    /// The window could not fit another wait.
    Exhausted { attempts: u32, last_error: E },
    /// Shutdown arrived during a backoff sleep.
    Interrupted { attempts: u32, last_error: E },
}

/// Runs `operation` until it succeeds, the window is spent, or shutdown
/// interrupts a backoff sleep.
pub async fn retry<E, F, Fut>(
    policy: &RetryPolicy,
    shutdown: &mut ShutdownSignal,
    mut operation: F,
) -> RetryOutcome<E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
{
    let started = Instant::now();
    let mut attempts: u32 = 0;
    loop {
        attempts = attempts.saturating_add(1);
        let last_error = match operation().await {
            Ok(()) => return RetryOutcome::Succeeded { attempts },
            Err(err) => err,
        };
        let wait = policy.wait(attempts);
        if started.elapsed() + wait >= policy.window {
            return RetryOutcome::Exhausted {
                attempts,
                last_error,
            };
        }
        warn!(
            "event=retry_scheduled module=source status=error attempt={} wait_ms={} error={}",
            attempts,
            wait.as_millis(),
            last_error
        );
        tokio::select! {
            biased;
            _ = shutdown.requested() => {
                return RetryOutcome::Interrupted {
                    attempts,
                    last_error,
                };
            }
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::shutdown_channel;

    #[test]
    fn wait_grows_linearly() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.wait(1), Duration::from_secs(1));
        assert_eq!(policy.wait(3), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn attempts_stop_before_window_is_exceeded() {
        let policy = RetryPolicy {
            base_unit: Duration::from_secs(1),
            window: Duration::from_secs(10),
        };
        let (_trigger, mut signal) = shutdown_channel();
        let started = Instant::now();
        let mut calls = 0;
        let outcome = retry(&policy, &mut signal, || {
            calls += 1;
            async { Err::<(), _>("boom") }
        })
        .await;
        // waits 1 + 2 + 3 = 6s; the fourth wait (4s) would reach the window
        assert_eq!(
            outcome,
            RetryOutcome::Exhausted {
                attempts: 4,
                last_error: "boom"
            }
        );
        assert_eq!(calls, 4);
        assert_eq!(started.elapsed(), Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn success_after_failures_reports_attempts() {
        let (_trigger, mut signal) = shutdown_channel();
        let mut remaining_failures = 2;
        let outcome = retry(&RetryPolicy::default(), &mut signal, || {
            let result = if remaining_failures > 0 {
                remaining_failures -= 1;
                Err("transient")
            } else {
                Ok(())
            };
            async move { result }
        })
        .await;
        assert_eq!(outcome, RetryOutcome::Succeeded { attempts: 3 });
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_interrupts_backoff() {
        let (trigger, mut signal) = shutdown_channel();
        trigger.trigger();
        let outcome = retry(&RetryPolicy::default(), &mut signal, || async {
            Err::<(), _>("down")
        })
        .await;
        assert_eq!(
            outcome,
            RetryOutcome::Interrupted {
                attempts: 1,
                last_error: "down"
            }
        );
    }
}
