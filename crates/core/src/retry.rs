//! Retry with exponential backoff for calls into external backends.
//!
//! A [`RetryPolicy`] is configured per call site (issuance, ticketing) and
//! drives an async operation until it succeeds, fails permanently, or runs out
//! of attempts. Each attempt is bounded by its own timeout; a timed-out
//! attempt counts as a transient failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::backend::BackendError;
use crate::metrics;

/// Backoff parameters for one external call site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Each subsequent delay is the previous one times this factor.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound for a single delay, in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Per-attempt timeout, in milliseconds.
    #[serde(default = "default_attempt_timeout_ms")]
    pub attempt_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_attempt_timeout_ms() -> u64 {
    30_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            attempt_timeout_ms: default_attempt_timeout_ms(),
        }
    }
}

/// Terminal failure of a retried operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    /// The backend rejected the request; no further attempts were made.
    #[error("rejected after {attempts} attempt(s): {reason}")]
    Permanent { attempts: u32, reason: String },

    /// Every attempt failed transiently.
    #[error("gave up after {attempts} attempt(s): {last_reason}")]
    Exhausted { attempts: u32, last_reason: String },
}

impl RetryError {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Permanent { attempts, .. } | Self::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::Permanent { reason, .. } => reason,
            Self::Exhausted { last_reason, .. } => last_reason,
        }
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent { .. })
    }
}

/// A successful result together with the number of attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let millis = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Run `attempt` until it succeeds or the policy gives up.
    ///
    /// The closure receives the 1-based attempt number. Permanent errors stop
    /// immediately; transient errors and per-attempt timeouts are retried with
    /// exponential backoff until `max_attempts` is reached.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt: F,
    ) -> Result<Attempted<T>, RetryError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut current = 1;

        loop {
            let result = match tokio::time::timeout(self.attempt_timeout(), attempt(current)).await
            {
                Ok(result) => result,
                Err(_) => Err(BackendError::transient(format!(
                    "{} timed out after {}ms",
                    operation, self.attempt_timeout_ms
                ))),
            };

            let error = match result {
                Ok(value) => {
                    debug!(operation, attempts = current, "Backend call succeeded");
                    return Ok(Attempted {
                        value,
                        attempts: current,
                    });
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                warn!(
                    operation,
                    attempt = current,
                    reason = error.reason(),
                    "Backend rejected request, not retrying"
                );
                return Err(RetryError::Permanent {
                    attempts: current,
                    reason: error.reason().to_string(),
                });
            }

            if current >= max_attempts {
                warn!(
                    operation,
                    attempts = current,
                    reason = error.reason(),
                    "Retries exhausted"
                );
                return Err(RetryError::Exhausted {
                    attempts: current,
                    last_reason: error.reason().to_string(),
                });
            }

            let delay = self.delay_after(current);
            warn!(
                operation,
                attempt = current,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = error.reason(),
                "Transient backend failure, retrying"
            );
            metrics::RETRY_ATTEMPTS.with_label_values(&[operation]).inc();

            tokio::time::sleep(delay).await;
            current += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 60_000,
            attempt_timeout_ms: 5_000,
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_delay_ms, 1000);
        assert_eq!(policy.backoff_multiplier, 2.0);
    }

    #[test]
    fn test_delay_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_delay_ms: 5000,
            ..fast_policy(10)
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after(2), Duration::from_secs(2));
        assert_eq!(policy.delay_after(3), Duration::from_secs(4));
        assert_eq!(policy.delay_after(4), Duration::from_secs(5));
        assert_eq!(policy.delay_after(40), Duration::from_secs(5));
    }

    #[test]
    fn test_deserialize_partial_policy() {
        let toml = r#"
            max_attempts = 3
            initial_delay_ms = 250
        "#;
        let policy: RetryPolicy = toml::from_str(toml).unwrap();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_delay_ms, 250);
        assert_eq!(policy.backoff_multiplier, 2.0);
        assert_eq!(policy.attempt_timeout_ms, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let policy = fast_policy(5);
        let result = tokio_test::assert_ok!(
            policy
                .run("test", |_| async { Ok::<_, BackendError>(42) })
                .await
        );
        assert_eq!(result.value, 42);
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_then_success() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let result = policy
            .run("test", |_| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(BackendError::transient("503"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(result.value, "done");
        assert_eq!(result.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let policy = fast_policy(5);
        let calls = AtomicU32::new(0);

        let err = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::permanent("name not permitted")) }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            err,
            RetryError::Permanent {
                attempts: 1,
                reason: "name not permitted".to_string()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_uses_exponential_gaps() {
        let policy = fast_policy(5);
        let starts = Mutex::new(Vec::new());
        let origin = Instant::now();

        let err = policy
            .run("test", |_| {
                starts.lock().unwrap().push(origin.elapsed());
                async { Err::<(), _>(BackendError::transient("connection reset")) }
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 5);
        assert!(!err.is_permanent());
        assert_eq!(err.reason(), "connection reset");

        let starts = starts.into_inner().unwrap();
        let secs: Vec<u64> = starts.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![0, 1, 3, 7, 15]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_timeout_counts_as_transient() {
        let policy = RetryPolicy {
            attempt_timeout_ms: 2_000,
            ..fast_policy(3)
        };
        let calls = AtomicU32::new(0);

        let err = policy
            .run("slow", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok::<_, BackendError>(())
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert!(err.reason().contains("timed out"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_max_attempts_still_tries_once() {
        let policy = fast_policy(0);
        let calls = AtomicU32::new(0);

        let _ = policy
            .run("test", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(BackendError::transient("down")) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
