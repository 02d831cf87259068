//! # Retry
//!
//! Module providing a `RetryPolicy` that runs a fallible async operation with exponential
//! backoff and jitter between attempts.
use std::future::Future;
use std::time;

use rand::Rng;

#[derive(Clone, Debug, PartialEq)]
/// A retry policy to determine how often and how long to wait between delivery attempts.
pub struct RetryPolicy {
    /// Total number of invocations, including the first one. Values below 1 behave as 1.
    pub max_attempts: u32,
    /// Coefficient to multiply the delay with after every attempt.
    pub backoff_coefficient: f64,
    /// The base delay before the first retry.
    pub initial_interval: time::Duration,
    /// The maximum possible wait between retries, jitter included.
    pub maximum_interval: time::Duration,
    /// Upper bound of the random jitter, as a fraction of the current delay.
    pub jitter_factor: f64,
}

impl RetryPolicy {
    /// Initialize a `RetryPolicyBuilder`.
    pub fn build(max_attempts: u32, initial_interval: time::Duration) -> RetryPolicyBuilder {
        RetryPolicyBuilder::new(max_attempts, initial_interval)
    }

    /// Wait time for a given base delay and a jitter sample in `[0, 1)`.
    pub fn retry_interval(&self, delay: time::Duration, jitter_sample: f64) -> time::Duration {
        let jitter = delay.mul_f64(self.jitter_factor.max(0.0) * jitter_sample.clamp(0.0, 1.0));
        std::cmp::min(delay + jitter, self.maximum_interval)
    }

    fn next_delay(&self, delay: time::Duration) -> time::Duration {
        let scaled = delay.mul_f64(self.backoff_coefficient.max(1.0));
        std::cmp::min(scaled, self.maximum_interval)
    }

    /// Run `operation` until it succeeds, fails with an error `is_retryable` rejects, or
    /// `max_attempts` invocations have been made. The last error is returned as is.
    ///
    /// `on_retry` is called before every backoff sleep with the number of the attempt that
    /// just failed, the wait about to happen, and the error.
    pub async fn execute<T, E, F, Fut, R, C>(
        &self,
        mut operation: F,
        is_retryable: R,
        mut on_retry: C,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        C: FnMut(u32, time::Duration, &E),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.initial_interval;
        let mut attempt = 0;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            attempt += 1;

            if attempt >= max_attempts || !is_retryable(&error) {
                return Err(error);
            }

            let wait = self.retry_interval(delay, rand::thread_rng().gen::<f64>());
            on_retry(attempt, wait, &error);
            tokio::time::sleep(wait).await;

            delay = self.next_delay(delay);
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicyBuilder::default().provide()
    }
}

/// Builder pattern struct to provide a `RetryPolicy`.
pub struct RetryPolicyBuilder {
    pub max_attempts: u32,
    pub backoff_coefficient: f64,
    pub initial_interval: time::Duration,
    pub maximum_interval: time::Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicyBuilder {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff_coefficient: 2.0,
            initial_interval: time::Duration::from_secs(1),
            maximum_interval: time::Duration::from_secs(16),
            jitter_factor: 0.2,
        }
    }
}

impl RetryPolicyBuilder {
    pub fn new(max_attempts: u32, initial_interval: time::Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            ..RetryPolicyBuilder::default()
        }
    }

    pub fn backoff_coefficient(mut self, coefficient: f64) -> RetryPolicyBuilder {
        self.backoff_coefficient = coefficient;
        self
    }

    pub fn maximum_interval(mut self, interval: time::Duration) -> RetryPolicyBuilder {
        self.maximum_interval = interval;
        self
    }

    pub fn jitter_factor(mut self, factor: f64) -> RetryPolicyBuilder {
        self.jitter_factor = factor;
        self
    }

    /// Provide a `RetryPolicy` according to build parameters provided thus far.
    pub fn provide(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            backoff_coefficient: self.backoff_coefficient,
            initial_interval: self.initial_interval,
            maximum_interval: self.maximum_interval,
            jitter_factor: self.jitter_factor,
        }
    }
}
