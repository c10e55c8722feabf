//! Bounded, classified retry.
//!
//! `execute_with_retry` runs an operation until it succeeds, fails with a
//! terminal error, or runs out of attempts. Inter-attempt delays grow
//! exponentially up to a cap and are `tokio` sleeps, so other tasks keep
//! running. The attempt count is always surfaced so callers can persist it.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// How a failure should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Timeout, 5xx-equivalent, transient network or browser-session fault.
    Retriable,
    /// Validation, authentication or business-rule rejection.
    Terminal,
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            FailureClass::Retriable => "retriable",
            FailureClass::Terminal => "terminal",
        })
    }
}

/// A failure already tagged by whoever produced it (the runner).
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{class}: {message}")]
pub struct ClassifiedError {
    pub class: FailureClass,
    pub message: String,
}

impl ClassifiedError {
    pub fn retriable(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Retriable,
            message: message.into(),
        }
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Terminal,
            message: message.into(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.class == FailureClass::Retriable
    }
}

/// Labels each failure as retriable or terminal.
pub trait Classify<E> {
    fn classify(&self, error: &E) -> FailureClass;
}

impl<E, F> Classify<E> for F
where
    F: Fn(&E) -> FailureClass,
{
    fn classify(&self, error: &E) -> FailureClass {
        self(error)
    }
}

/// Trusts the tag a [`ClassifiedError`] already carries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByTag;

impl Classify<ClassifiedError> for ByTag {
    fn classify(&self, error: &ClassifiedError) -> FailureClass {
        error.class
    }
}

/// Retry policy. Durations are kept in milliseconds so the struct can be
/// read straight from TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay_ms: u64,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy, handy when the operation has its own pacing.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            multiplier: 1.0,
            max_delay_ms: 0,
        }
    }

    /// Delay to wait after `attempt` (1-based) failed.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let raw = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// The operation succeeded, possibly after retries.
#[derive(Debug, Clone, PartialEq)]
pub struct Succeeded<T> {
    pub value: T,
    pub attempts: u32,
}

/// The controller gave up: terminal failure or attempts exhausted.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("gave up after {attempts} attempt(s) ({class}): {error}")]
pub struct FinalFailure<E: std::fmt::Display + std::fmt::Debug> {
    pub error: E,
    pub class: FailureClass,
    pub attempts: u32,
}

/// Run `operation` under `policy`. The closure receives the 1-based attempt
/// number.
pub async fn execute_with_retry<T, E, C, F, Fut>(
    policy: &RetryPolicy,
    classifier: &C,
    mut operation: F,
) -> Result<Succeeded<T>, FinalFailure<E>>
where
    E: std::fmt::Display + std::fmt::Debug,
    C: Classify<E> + ?Sized,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max = policy.attempts();
    let mut attempt = 1;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(Succeeded {
                    value,
                    attempts: attempt,
                });
            }
            Err(error) => {
                let class = classifier.classify(&error);
                if class == FailureClass::Terminal || attempt >= max {
                    return Err(FinalFailure {
                        error,
                        class,
                        attempts: attempt,
                    });
                }

                let delay = policy.delay_after(attempt);
                warn!(
                    attempt,
                    max_attempts = max,
                    delay_ms = delay.as_millis() as u64,
                    %error,
                    "retriable failure, backing off"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}
