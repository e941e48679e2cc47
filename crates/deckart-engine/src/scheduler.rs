//! Concurrency-bounded execution with per-attempt timeouts and retries.
//!
//! Generation and critique both run through [`BoundedRunner`]; they differ only
//! in the call they hand it. A permit is held only while a call is in flight,
//! never during the backoff sleep between attempts.

use std::future::Future;
use std::time::Duration;

use deckart_contracts::config::StageLimits;
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

const BACKOFF_STEP: Duration = Duration::from_millis(1500);
const BACKOFF_CAP: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_limit: u32,
    pub step: Duration,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn new(retry_limit: u32) -> Self {
        Self {
            retry_limit,
            step: BACKOFF_STEP,
            cap: BACKOFF_CAP,
        }
    }

    /// `min(cap, step * attempt)` for the 1-based retry number.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.step.saturating_mul(attempt.max(1)).min(self.cap)
    }
}

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),
    #[error("{0:#}")]
    Failed(anyhow::Error),
}

impl AttemptError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, AttemptError::TimedOut(_))
    }
}

#[derive(Debug, Error)]
#[error("gave up after {attempts} attempt(s): {last}")]
pub struct TaskFailure {
    pub attempts: u32,
    pub last: AttemptError,
}

/// Marks an error that retrying cannot fix (missing input file, unusable
/// response shape). The runner stops at the first attempt that returns one.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct Permanent(pub String);

pub fn is_permanent(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.downcast_ref::<Permanent>().is_some())
}

#[derive(Debug, Clone)]
pub struct BoundedRunner {
    stage: &'static str,
    concurrency: i64,
    timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl BoundedRunner {
    pub fn new(stage: &'static str, limits: &StageLimits) -> Self {
        Self {
            stage,
            concurrency: limits.concurrency,
            timeout: limits.timeout(),
            retry: RetryPolicy::new(limits.retry_limit),
        }
    }

    fn permits(&self, count: usize) -> usize {
        StageLimits {
            concurrency: self.concurrency,
            timeout_s: 0.0,
            retry_limit: 0,
        }
        .effective_concurrency(count)
    }

    /// Runs `call(task, attempt)` for every task in `0..count`, where `attempt`
    /// is 1-based. Results come back in task order.
    pub async fn run<T, F, Fut>(&self, count: usize, call: F) -> Vec<Result<T, TaskFailure>>
    where
        F: Fn(usize, u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        if count == 0 {
            return Vec::new();
        }
        let semaphore = Semaphore::new(self.permits(count));
        let semaphore = &semaphore;
        let call = &call;
        debug!(
            stage = self.stage,
            count,
            permits = self.permits(count),
            "dispatching"
        );
        join_all((0..count).map(|task| async move {
            self.run_one(task, semaphore, call).await
        }))
        .await
    }

    async fn run_one<T, F, Fut>(
        &self,
        task: usize,
        semaphore: &Semaphore,
        call: &F,
    ) -> Result<T, TaskFailure>
    where
        F: Fn(usize, u32) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let max_attempts = self.retry.retry_limit.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                let _permit = semaphore.acquire().await.ok();
                match self.timeout {
                    Some(limit) => match tokio::time::timeout(limit, call(task, attempt)).await {
                        Ok(result) => result.map_err(AttemptError::Failed),
                        Err(_) => Err(AttemptError::TimedOut(limit)),
                    },
                    None => call(task, attempt).await.map_err(AttemptError::Failed),
                }
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let permanent = matches!(&err, AttemptError::Failed(inner) if is_permanent(inner));
            warn!(
                stage = self.stage,
                task,
                attempt,
                max_attempts,
                permanent,
                error = %err,
                "attempt failed"
            );
            if permanent || attempt >= max_attempts {
                return Err(TaskFailure {
                    attempts: attempt,
                    last: err,
                });
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;

    use super::*;

    fn limits(concurrency: i64, timeout_s: f64, retry_limit: u32) -> StageLimits {
        StageLimits {
            concurrency,
            timeout_s,
            retry_limit,
        }
    }

    #[test]
    fn backoff_grows_linearly_and_caps_at_ten_seconds() {
        let policy = RetryPolicy::new(3);
        assert_eq!(policy.delay(1), Duration::from_millis(1500));
        assert_eq!(policy.delay(2), Duration::from_millis(3000));
        assert_eq!(policy.delay(6), Duration::from_secs(9));
        assert_eq!(policy.delay(7), Duration::from_secs(10));
        assert_eq!(policy.delay(40), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_calls_never_exceed_limit() {
        let runner = BoundedRunner::new("test", &limits(3, 0.0, 0));
        let current = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);

        let results = runner
            .run(10, |task, _attempt| {
                let current = &current;
                let peak = &peak;
                async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    Ok(task * 2)
                }
            })
            .await;

        assert_eq!(peak.load(Ordering::SeqCst), 3);
        let values: Vec<usize> = results.into_iter().filter_map(Result::ok).collect();
        assert_eq!(values, (0..10).map(|n| n * 2).collect::<Vec<usize>>());
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_retried_then_reported() {
        let runner = BoundedRunner::new("test", &limits(0, 1.0, 2));
        let calls = AtomicUsize::new(0);

        let results = runner
            .run(1, |_task, _attempt| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let failure = match results.into_iter().next() {
            Some(Err(failure)) => failure,
            other => panic!("expected failure, got {other:?}"),
        };
        assert_eq!(failure.attempts, 3);
        assert!(failure.last.is_timeout());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_recover_on_retry() {
        let runner = BoundedRunner::new("test", &limits(2, 5.0, 2));
        let results = runner
            .run(2, |task, attempt| async move {
                if task == 1 && attempt < 3 {
                    bail!("503 from provider");
                }
                Ok(attempt)
            })
            .await;

        assert_eq!(results[0].as_ref().ok(), Some(&1));
        assert_eq!(results[1].as_ref().ok(), Some(&3));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_stop_retrying() {
        let runner = BoundedRunner::new("test", &limits(1, 0.0, 5));
        let calls = AtomicUsize::new(0);
        let results: Vec<Result<(), TaskFailure>> = runner
            .run(1, |_task, _attempt| {
                let calls = &calls;
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(Permanent("missing candidate file".to_string()).into())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(&results[0], Err(failure) if failure.attempts == 1));
    }

    #[tokio::test]
    async fn empty_input_returns_immediately() {
        let runner = BoundedRunner::new("test", &limits(4, 1.0, 1));
        let results: Vec<Result<(), TaskFailure>> =
            runner.run(0, |_task, _attempt| async { Ok(()) }).await;
        assert!(results.is_empty());
    }
}
