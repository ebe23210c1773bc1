//! Bounded exponential backoff for transient store and bus failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::RetryConfig;
use crate::error::{BusError, FlowError, StoreError};

/// Errors that can tell whether a retry may help.
pub trait Transient {
    /// Returns `true` if retrying the same operation later may succeed.
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Transient for BusError {
    fn is_transient(&self) -> bool {
        BusError::is_transient(self)
    }
}

impl Transient for FlowError {
    fn is_transient(&self) -> bool {
        FlowError::is_transient(self)
    }
}

/// Delay schedule: doubles from `base_delay`, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    /// Start a schedule from the given configuration.
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.base_delay,
            max: config.max_delay,
        }
    }

    /// The delay to wait now; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max);
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Run `op` until it succeeds, fails permanently, or `max_attempts` is used
/// up, sleeping with exponential backoff between transient failures.
///
/// # Arguments
///
/// * `config` - Attempt budget and delay bounds.
/// * `what` - Operation name for logs.
/// * `op` - Produces a fresh future per attempt.
///
/// # Errors
///
/// The first permanent error, or the last transient one once the budget is
/// spent.
pub async fn retry_transient<T, E, F, Fut>(config: &RetryConfig, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(config);
    let attempts = config.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = backoff.next_delay();
                warn!(operation = what, attempt, ?delay, error = %err, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                if err.is_transient() {
                    error!(operation = what, attempts, error = %err, "retries exhausted");
                }
                return Err(err);
            }
        }
    }
}
