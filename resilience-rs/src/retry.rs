//! # Retry Handler
//!
//! Runs a fallible operation with exponential backoff. Strictly
//! sequential: one caller, one operation, one attempt at a time.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::report::{ErrorReport, ReportSink, Severity};
use crate::settings::millis;
use crate::types::{Error, Result};

/// Configuration for a retry run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure
    #[serde(with = "millis", rename = "initial_delay_ms")]
    pub initial_delay: Duration,
    /// Growth factor applied after each failure
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay
    #[serde(with = "millis", rename = "max_delay_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_millis(10_000),
        }
    }
}

impl RetryConfig {
    /// The delay that follows `current` in a failing run
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff_multiplier).min(self.max_delay)
    }
}

/// Executes operations with exponential-backoff retry and reports the outcome
#[derive(Clone)]
pub struct RetryHandler {
    defaults: RetryConfig,
    reporter: Arc<dyn ReportSink>,
}

impl RetryHandler {
    pub fn new(reporter: Arc<dyn ReportSink>, defaults: RetryConfig) -> Self {
        Self { defaults, reporter }
    }

    pub fn defaults(&self) -> &RetryConfig {
        &self.defaults
    }

    /// Runs `operation` until it succeeds or `max_attempts` is exhausted
    ///
    /// A success after at least one failure emits a low-severity report;
    /// exhaustion emits a high-severity report and returns the last error.
    pub async fn execute<F, Fut, T>(
        &self,
        operation_name: &str,
        mut operation: F,
        config: Option<&RetryConfig>,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let config = config.unwrap_or(&self.defaults);
        let max_attempts = config.max_attempts.max(1);
        let mut delay = config.initial_delay.min(config.max_delay);
        let mut attempt = 1;

        loop {
            counter!("retry.attempts", 1);

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(
                            operation = %operation_name,
                            attempt = %attempt,
                            "Operation recovered after retries"
                        );
                        counter!("retry.recovered", 1);
                        self.reporter.track_error(
                            ErrorReport::manual(
                                format!("Operation '{}' recovered after {} attempts", operation_name, attempt),
                                Severity::Low,
                            )
                            .data("operation", operation_name)
                            .data("attempts", attempt),
                        );
                    }
                    return Ok(value);
                }
                Err(error) if attempt < max_attempts => {
                    debug!(
                        operation = %operation_name,
                        attempt = %attempt,
                        max_attempts = %max_attempts,
                        backoff_ms = %delay.as_millis(),
                        error = %error,
                        "Retrying after error"
                    );
                    sleep(delay).await;
                    delay = config.next_delay(delay);
                    attempt += 1;
                }
                Err(error) => {
                    warn!(
                        operation = %operation_name,
                        attempts = %attempt,
                        error = %error,
                        "Giving up after retries"
                    );
                    counter!("retry.exhausted", 1);
                    self.reporter.track_error(
                        ErrorReport::manual(
                            format!(
                                "Operation '{}' failed after {} attempts: {}",
                                operation_name, attempt, error.message
                            ),
                            Severity::High,
                        )
                        .data("operation", operation_name)
                        .data("attempts", attempt),
                    );
                    return Err(with_attempts(error, operation_name, attempt));
                }
            }
        }
    }
}

fn with_attempts(error: Error, operation_name: &str, attempts: u32) -> Error {
    error.context("operation", operation_name).context("attempts", attempts)
}

impl fmt::Debug for RetryHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryHandler").field("defaults", &self.defaults).finish()
    }
}
