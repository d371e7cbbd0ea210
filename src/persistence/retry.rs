//! Retry with exponential backoff for transient storage failures.
//!
//! Only errors that report themselves transient (lock timeouts) are retried.
//! Attempt `i` (zero based) waits `(2^i + 1) * jitter`, where `jitter` is drawn
//! uniformly from `[0.5, 1.5] * initial_delay`.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use super::{StateManager, StoreError, Transaction};
use crate::config::RetrySettings;

/// Classifies errors the retry helper may retry.
pub trait TransientError {
    fn is_transient(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct TimeoutRetryHelper {
    max_attempts: u32,
    initial_delay: Duration,
}

impl Default for TimeoutRetryHelper {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_ATTEMPTS, Self::DEFAULT_INITIAL_DELAY)
    }
}

impl TimeoutRetryHelper {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
    pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(200);

    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(settings.max_attempts, settings.initial_delay())
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry that follows attempt `attempt`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt).saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        self.initial_delay.mul_f64(jitter).saturating_mul(factor)
    }

    /// Run `op` until it succeeds, fails with a non-transient error, or the
    /// attempts are used up. `op` receives the zero-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientError + Display,
    {
        let mut attempt = 0;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.backoff(attempt);
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "transient storage failure, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Like `execute`, with every attempt running inside a fresh transaction
    /// that is committed when `op` succeeds and aborted otherwise.
    pub async fn execute_in_transaction<T, E, F, Fut>(
        &self,
        state: &StateManager,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: TransientError + Display + From<StoreError>,
    {
        self.execute(|_| {
            let tx = state.begin();
            let work = op(tx.clone());
            async move {
                match work.await {
                    Ok(value) => {
                        tx.commit().await?;
                        Ok(value)
                    }
                    Err(err) => {
                        tx.abort();
                        Err(err)
                    }
                }
            }
        })
        .await
    }
}
