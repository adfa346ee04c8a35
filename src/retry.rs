//! Backoff for startup dependencies
//!
//! Reconcilers never retry inside a pass; failed reconciles go back to the
//! controller runtime. This helper is for the process itself, which must wait
//! for the port registry to become reachable before the controllers start.
//!
//! # Example
//!
//! ```ignore
//! use kube_spin::retry::{retry_with_backoff, RetryConfig};
//!
//! let registry = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(10),
//!     "connect_port_registry",
//!     || RedisPortRegistry::connect(&url, timeout),
//! ).await?;
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{error, warn};

/// Backoff parameters
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = retry forever)
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Default backoff giving up after `attempts` tries
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts > 0 && attempt >= self.max_attempts
    }

    fn grow(&self, delay: Duration) -> Duration {
        Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff_multiplier).min(self.max_delay.as_secs_f64()),
        )
    }
}

/// Scale `delay` by a random factor in `[0.5, 1.5)`
fn jittered(delay: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// Run `operation` until it succeeds or `config.max_attempts` is reached
///
/// Returns the last error once attempts are exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = config.initial_delay;
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        let e = match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        if config.exhausted(attempt) {
            error!(operation = %operation_name, attempt, error = %e, "giving up");
            return Err(e);
        }

        let wait = jittered(delay);
        warn!(
            operation = %operation_name,
            attempt,
            error = %e,
            delay_ms = wait.as_millis() as u64,
            "attempt failed, retrying"
        );
        tokio::time::sleep(wait).await;
        delay = config.grow(delay);
    }
}
