use std::thread::sleep;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Permanent,
}

pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..=599).contains(&status)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub exponential: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            exponential: true,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows the given 1-based failed attempt.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let scaled = if self.exponential {
            base.saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1).min(16)))
        } else {
            base
        };
        let jitter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| u64::from(duration.subsec_millis() % 100))
            .unwrap_or(0);
        Duration::from_millis(scaled.saturating_add(jitter))
    }

    /// Run `operation` until it succeeds, fails permanently per `classify`,
    /// or the attempt budget is spent. The operation receives the 1-based
    /// attempt number; on exhaustion the last error is returned.
    pub fn run<T, E, Op, Classify>(&self, mut operation: Op, classify: Classify) -> Result<T, E>
    where
        Op: FnMut(u32) -> Result<T, E>,
        Classify: Fn(&E) -> ErrorClass,
        E: std::fmt::Display,
    {
        let budget = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match operation(attempt) {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= budget || classify(&error) == ErrorClass::Permanent {
                        return Err(error);
                    }
                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt,
                        budget,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        %error,
                        "transient failure, retrying after backoff"
                    );
                    sleep(delay);
                }
            }
        }
    }
}
