//! Bounded retry with exponential backoff for store and bus calls.

use std::future::Future;
use std::time::Duration;

use crate::config::IngestConfig;

/// Backoff parameters.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Base delay for first failure.
    pub base_delay: Duration,
    /// Maximum backoff cap.
    pub max_delay: Duration,
    /// Multiplier per consecutive failure (typically 2.0).
    pub multiplier: f64,
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Deadline for each individual attempt.
    pub attempt_timeout: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
        }
    }
}

impl BackoffConfig {
    pub fn from_ingest(config: &IngestConfig, attempt_timeout: Duration) -> Self {
        Self {
            base_delay: config.backoff_base,
            max_delay: config.backoff_max,
            max_attempts: config.max_attempts.max(1),
            attempt_timeout,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows `consecutive_failures` failures.
    pub fn delay_for(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1) as i32;
        let delay_secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(delay_secs.min(self.max_delay.as_secs_f64()))
    }
}

/// Why a retried call ultimately failed.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The last attempt returned an error.
    Failed { attempts: u32, last: E },
    /// The last attempt exceeded its deadline.
    TimedOut { attempts: u32 },
}

impl<E: std::fmt::Display> std::fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed { attempts, last } => {
                write!(f, "failed after {attempts} attempt(s): {last}")
            }
            Self::TimedOut { attempts } => write!(f, "timed out after {attempts} attempt(s)"),
        }
    }
}

/// Run `op` until it succeeds, `is_retryable` rejects the error, or the
/// attempt budget is spent.
pub async fn retry_with_backoff<T, E, F, Fut>(
    label: &str,
    config: &BackoffConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let outcome = tokio::time::timeout(config.attempt_timeout, op()).await;
        let retryable = match &outcome {
            Ok(Ok(_)) => false,
            Ok(Err(err)) => is_retryable(err),
            Err(_) => true,
        };
        if !retryable || attempt >= config.max_attempts {
            return match outcome {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(last)) => Err(RetryError::Failed {
                    attempts: attempt,
                    last,
                }),
                Err(_) => Err(RetryError::TimedOut { attempts: attempt }),
            };
        }
        let delay = config.delay_for(attempt);
        match &outcome {
            Ok(Err(err)) => tracing::warn!(
                op = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            ),
            _ => tracing::warn!(
                op = label,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Retrying after timeout"
            ),
        }
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let config = BackoffConfig {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            ..BackoffConfig::default()
        };
        assert_eq!(config.delay_for(1), Duration::from_millis(100));
        assert_eq!(config.delay_for(2), Duration::from_millis(200));
        assert_eq!(config.delay_for(5), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, RetryError<String>> =
            retry_with_backoff("test", &BackoffConfig::default(), |_| true, move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(format!("boom {n}"))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), RetryError<String>> =
            retry_with_backoff("test", &BackoffConfig::default(), |_| true, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_string())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Failed { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), RetryError<String>> =
            retry_with_backoff("test", &BackoffConfig::default(), |_| false, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("bad input".to_string())
            })
            .await;
        assert!(matches!(result, Err(RetryError::Failed { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
