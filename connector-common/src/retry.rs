//! # Retry
//!
//! Module providing a `BackoffConfig` struct to compute delays between attempts,
//! and `retry_with_backoff` to drive an async operation under it.
use std::future::Future;
use std::time;

use rand::Rng;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum InvalidBackoffConfig {
    #[error("backoff multiplier must be at least 1.0, got {0}")]
    Multiplier(f64),
    #[error("initial delay {initial:?} exceeds maximum delay {maximum:?}")]
    InitialExceedsMaximum {
        initial: time::Duration,
        maximum: time::Duration,
    },
}

#[derive(Clone, Debug, PartialEq)]
/// Parameters to determine how long to wait between attempts, and how many attempts to make.
pub struct BackoffConfig {
    /// The delay before the first retry.
    pub initial_delay: time::Duration,
    /// The maximum possible delay before jitter is applied.
    pub max_delay: time::Duration,
    /// Coefficient to multiply initial_delay with for every past attempt.
    pub multiplier: f64,
    /// Number of retries allowed. Zero means unlimited.
    pub max_retries: u32,
    /// Scale every delay by a uniform factor in [0.75, 1.25].
    pub jitter: bool,
}

impl BackoffConfig {
    /// Initialize a `BackoffConfigBuilder`.
    pub fn build(multiplier: f64, initial_delay: time::Duration) -> BackoffConfigBuilder {
        BackoffConfigBuilder::new(multiplier, initial_delay)
    }

    /// Delay before retrying after `attempt` (0-indexed) failed.
    pub fn delay(&self, attempt: u32) -> time::Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let candidate_ms = self.initial_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = candidate_ms.min(self.max_delay.as_millis() as f64);

        let delay_ms = if self.jitter {
            capped_ms * rand::thread_rng().gen_range(0.75..=1.25)
        } else {
            capped_ms
        };

        time::Duration::from_millis(delay_ms.round() as u64)
    }

    /// Whether another attempt is allowed after `attempt` (0-indexed) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_retries == 0 || attempt < self.max_retries
    }

    pub fn validate(&self) -> Result<(), InvalidBackoffConfig> {
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(InvalidBackoffConfig::Multiplier(self.multiplier));
        }
        if self.initial_delay > self.max_delay {
            return Err(InvalidBackoffConfig::InitialExceedsMaximum {
                initial: self.initial_delay,
                maximum: self.max_delay,
            });
        }
        Ok(())
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfigBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `BackoffConfig`.
pub struct BackoffConfigBuilder {
    pub initial_delay: time::Duration,
    pub max_delay: time::Duration,
    pub multiplier: f64,
    pub max_retries: u32,
    pub jitter: bool,
}

impl Default for BackoffConfigBuilder {
    fn default() -> Self {
        Self {
            initial_delay: time::Duration::from_secs(1),
            max_delay: time::Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: 3,
            jitter: true,
        }
    }
}

impl BackoffConfigBuilder {
    pub fn new(multiplier: f64, initial_delay: time::Duration) -> Self {
        Self {
            multiplier,
            initial_delay,
            ..BackoffConfigBuilder::default()
        }
    }

    pub fn maximum_delay(mut self, delay: time::Duration) -> BackoffConfigBuilder {
        self.max_delay = delay;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> BackoffConfigBuilder {
        self.max_retries = max_retries;
        self
    }

    pub fn jitter(mut self, jitter: bool) -> BackoffConfigBuilder {
        self.jitter = jitter;
        self
    }

    /// Provide a `BackoffConfig` according to build parameters provided thus far.
    pub fn provide(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: self.initial_delay,
            max_delay: self.max_delay,
            multiplier: self.multiplier,
            max_retries: self.max_retries,
            jitter: self.jitter,
        }
    }
}

/// Run `op` until it succeeds, `is_retryable` rejects its error, or `config` runs
/// out of retries. `op` receives the 0-indexed attempt number. The last error is
/// returned unchanged.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    config: &BackoffConfig,
    is_retryable: P,
    op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
{
    retry_with_delay_floor(config, is_retryable, |_| time::Duration::ZERO, op).await
}

/// Like `retry_with_backoff`, but never waits less than `delay_floor` asks for
/// after a given error, e.g. a server-provided `Retry-After`.
pub async fn retry_with_delay_floor<T, E, F, Fut, P, D>(
    config: &BackoffConfig,
    mut is_retryable: P,
    mut delay_floor: D,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: FnMut(&E) -> bool,
    D: FnMut(&E) -> time::Duration,
{
    let mut attempt = 0;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if !is_retryable(&error) || !config.should_retry(attempt) {
                    return Err(error);
                }

                let delay = config.delay(attempt).max(delay_floor(&error));
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
