// Timeout and retry wrapper for calls to external classifiers.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

use super::moderation_models::ModerationConfig;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    #[error("{0}")]
    Failed(String),
}

/// Bounded timeout plus limited retry-with-backoff.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub timeout: Duration,
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl CallPolicy {
    pub fn from_config(config: &ModerationConfig) -> Self {
        Self {
            timeout: config.call_timeout,
            max_attempts: config.max_attempts,
            initial_backoff: config.initial_backoff,
        }
    }

    /// Run `call` until it succeeds or the attempts run out.
    ///
    /// Each attempt is cut off after `timeout`. Between attempts we sleep for
    /// the current backoff plus up to 50% jitter, then double the backoff.
    pub async fn run<T, E, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let attempts = self.max_attempts.max(1);
        let mut backoff = self.initial_backoff;
        let mut last_error = CallError::Failed("no attempt made".to_string());

        for attempt in 1..=attempts {
            last_error = match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => CallError::Failed(e.to_string()),
                Err(_) => CallError::TimedOut(self.timeout),
            };

            if attempt < attempts {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts = attempts,
                    error = %last_error,
                    "External call failed, retrying"
                );
                tokio::time::sleep(with_jitter(backoff)).await;
                backoff = backoff.saturating_mul(2);
            }
        }

        Err(last_error)
    }
}

fn with_jitter(backoff: Duration) -> Duration {
    let max_jitter = backoff.as_millis() as u64 / 2;
    if max_jitter == 0 {
        return backoff;
    }
    let jitter = rand::thread_rng().gen_range(0..=max_jitter);
    backoff + Duration::from_millis(jitter)
}
