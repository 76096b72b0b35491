//! Bounded retries for transient store faults.

use shardmeta_common::config::RetryConfig;
use shardmeta_common::{Error, ErrorCategory, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// How a failed attempt is treated
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultKind {
    Transient,
    Fatal,
}

/// Decides whether a store fault is worth retrying
pub trait FaultClassifier: Send + Sync {
    fn classify(&self, error: &Error) -> FaultKind;
}

/// Retries connectivity and timeout faults. Concurrency conflicts are
/// always fatal: retrying them without re-reading would act on a stale
/// version.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultFaultClassifier;

impl FaultClassifier for DefaultFaultClassifier {
    fn classify(&self, error: &Error) -> FaultKind {
        if error.category() == ErrorCategory::Concurrency {
            return FaultKind::Fatal;
        }
        if error.is_transient() {
            FaultKind::Transient
        } else {
            FaultKind::Fatal
        }
    }
}

/// Raised once per failed attempt
#[derive(Clone, Debug)]
pub struct RetryEvent {
    pub operation: String,
    /// 1-based attempt that just failed
    pub attempt: u32,
    pub fault: FaultKind,
    /// Delay before the next attempt
    pub delay: Duration,
    pub will_retry: bool,
    pub error: String,
}

pub type RetryCallback = Arc<dyn Fn(&RetryEvent) + Send + Sync>;

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: Duration::from_millis(config.initial_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            backoff_multiplier: config.backoff_multiplier.max(1.0),
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            max_delay: initial_delay.max(Duration::from_secs(5)),
            backoff_multiplier: 2.0,
        }
    }

    /// Retry immediately, for tests
    #[must_use]
    pub fn no_delay(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }

    #[must_use]
    pub const fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the `attempt`-th failure (1-based)
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `work` until it succeeds, fails fatally, or attempts run out.
    ///
    /// `work` receives the 1-based attempt number. Exhaustion surfaces as
    /// `StorageOperationFailure` wrapping the last fault.
    pub fn run<T>(
        &self,
        operation: &str,
        classifier: &dyn FaultClassifier,
        on_retry: &dyn Fn(&RetryEvent),
        mut work: impl FnMut(u32) -> Result<T>,
    ) -> Result<T> {
        let mut attempt = 1;
        loop {
            let err = match work(attempt) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let fault = classifier.classify(&err);
            let will_retry = fault == FaultKind::Transient && attempt < self.max_attempts;
            let delay = if will_retry {
                self.delay_for(attempt)
            } else {
                Duration::ZERO
            };
            on_retry(&RetryEvent {
                operation: operation.to_string(),
                attempt,
                fault,
                delay,
                will_retry,
                error: err.to_string(),
            });

            match fault {
                FaultKind::Fatal => {
                    debug!("{} failed fatally on attempt {}: {}", operation, attempt, err);
                    return Err(err);
                }
                FaultKind::Transient if !will_retry => {
                    warn!("{} exhausted {} attempts: {}", operation, attempt, err);
                    return Err(Error::StorageOperationFailure {
                        operation: operation.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                FaultKind::Transient => {
                    warn!(
                        "{} attempt {} failed, retrying in {:?}: {}",
                        operation, attempt, delay, err
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
