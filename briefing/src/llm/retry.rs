//! Bounded retry with exponential backoff for transient LLM failures.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

use super::LlmError;

/// Errors that can tell whether another attempt might succeed.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for LlmError {
    fn is_transient(&self) -> bool {
        LlmError::is_transient(self)
    }
}

/// Why a retried operation gave up
#[derive(Debug)]
pub enum Retry<E> {
    /// Non-transient failure, returned on the attempt it happened
    Permanent(E),
    /// Every attempt failed transiently
    Exhausted { attempts: u32, last: E },
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn from_config(cfg: &common::LlmConfig) -> Self {
        Self::new(cfg.max_retries, Duration::from_millis(cfg.retry_base_delay_ms))
    }

    /// Wait before retry number `attempt + 1`: base * 2^attempt, plus up to 25% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        let base = self.base_delay.saturating_mul(factor);
        if !self.jitter || base.is_zero() {
            return base;
        }
        let max_extra = (base.as_millis() / 4) as u64;
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_extra))
    }

    /// Run `op` up to `max_retries + 1` times, sleeping between transient failures.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, Retry<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Transient + Display,
    {
        let total = self.max_retries + 1;
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(Retry::Permanent(e)),
                Err(e) => {
                    if attempt >= self.max_retries {
                        error!(attempts = total, error = %e, "giving up after transient failures");
                        return Err(Retry::Exhausted {
                            attempts: total,
                            last: e,
                        });
                    }
                    let wait = self.delay_for(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max = total,
                        ?wait,
                        error = %e,
                        "transient failure, retrying"
                    );
                    tokio::time::sleep(wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
