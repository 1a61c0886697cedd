use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep, Instant};

use crate::config::RetryConfig;
use crate::error::{RemoteCallError, RemoteErrorKind};

/// Exponential backoff between attempts: `min_delay * factor^(n-1)`, capped
/// at `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(cfg: &RetryConfig) -> Self {
        Self {
            max_retries: cfg.max_retries,
            min_delay: Duration::from_millis(cfg.min_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            factor: cfg.factor,
        }
    }
}

impl RetryPolicy {
    pub fn no_retries() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.min_delay.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(scaled).max(self.min_delay.min(self.max_delay))
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. A backoff that would overrun `deadline` ends
    /// the run with a timeout instead of sleeping.
    pub async fn run<F, Fut, T>(
        &self,
        mut op: F,
        deadline: Option<Instant>,
        observer: Option<&dyn RetryObserver>,
    ) -> Result<T, RetryFailure>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, RemoteCallError>>,
    {
        let mut log: Vec<AttemptRecord> = Vec::new();
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let exhausted = attempt >= self.max_attempts();
            let delay = (!exhausted && err.is_retryable()).then(|| self.delay_for(attempt));
            let record = AttemptRecord {
                attempt,
                kind: err.kind,
                status: err.status,
                message: err.message.clone(),
                delay,
            };
            if let Some(observer) = observer {
                observer.on_attempt_failed(&record);
            }
            tracing::warn!(
                attempt,
                kind = %err.kind,
                status = ?err.status,
                retry_in_ms = delay.map(|d| d.as_millis() as u64),
                "remote attempt failed"
            );
            log.push(record);

            let Some(delay) = delay else {
                return Err(RetryFailure::new(err, log));
            };
            if let Some(deadline) = deadline {
                if Instant::now() + delay >= deadline {
                    let timeout = RemoteCallError::new(
                        RemoteErrorKind::Timeout,
                        format!("deadline leaves no room for backoff after: {}", err.message),
                    );
                    return Err(RetryFailure::new(timeout, log));
                }
            }
            sleep(delay).await;
        }
    }
}

/// One failed attempt as seen by the retry loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt: u32,
    pub kind: RemoteErrorKind,
    pub status: Option<u16>,
    pub message: String,
    /// Backoff scheduled before the next attempt; `None` when this was the last.
    pub delay: Option<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryFailure {
    pub error: RemoteCallError,
    pub attempts: Vec<AttemptRecord>,
}

impl RetryFailure {
    fn new(mut error: RemoteCallError, attempts: Vec<AttemptRecord>) -> Self {
        error.attempts = attempts.len() as u32;
        Self { error, attempts }
    }
}

pub trait RetryObserver: Send + Sync {
    fn on_attempt_failed(&self, record: &AttemptRecord);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            factor: 2.0,
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<AttemptRecord>>);

    impl RetryObserver for Recorder {
        fn on_attempt_failed(&self, record: &AttemptRecord) {
            self.0.lock().unwrap().push(record.clone());
        }
    }

    #[test]
    fn default_delays_double_then_cap() {
        let policy = RetryPolicy::default();
        let delays: Vec<u64> = (1..=5).map(|n| policy.delay_for(n).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10]);
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test]
    async fn retries_until_success() {
        let calls = AtomicU32::new(0);
        let recorder = Recorder::default();
        let result = fast(3)
            .run(
                |_| {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(RemoteCallError::new(RemoteErrorKind::ServerBusy, "busy").with_status(503))
                        } else {
                            Ok(42)
                        }
                    }
                },
                None,
                Some(&recorder),
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        let seen = recorder.0.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].status, Some(503));
        assert_eq!(seen[1].attempt, 2);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let failure = fast(3)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(RemoteCallError::new(RemoteErrorKind::Timeout, "slow")) }
                },
                None,
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(failure.error.attempts, 4);
        assert_eq!(failure.attempts.len(), 4);
        assert!(failure.attempts.last().unwrap().delay.is_none());
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let failure = fast(3)
            .run(
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async {
                        Err::<(), _>(
                            RemoteCallError::new(RemoteErrorKind::Validation, "bad query").with_status(400),
                        )
                    }
                },
                None,
                None,
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(failure.error.kind, RemoteErrorKind::Validation);
        assert_eq!(failure.error.attempts, 1);
    }

    #[tokio::test]
    async fn deadline_cuts_backoff_short() {
        let policy = RetryPolicy {
            max_retries: 3,
            min_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(10),
            factor: 2.0,
        };
        let started = Instant::now();
        let failure = policy
            .run(
                |_| async { Err::<(), _>(RemoteCallError::new(RemoteErrorKind::Connection, "refused")) },
                Some(Instant::now() + Duration::from_millis(50)),
                None,
            )
            .await
            .unwrap_err();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(failure.error.kind, RemoteErrorKind::Timeout);
        assert_eq!(failure.attempts.len(), 1);
    }
}
