use std::time::Duration;
use tracing::warn;

/// Gateway/server statuses worth another attempt.
pub const RETRY_STATUSES: &[u16] = &[500, 502, 503, 504];

/// Upper bound on a single backoff sleep.
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Why an HTTP attempt did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    /// Connect error, reset, or timeout before a response arrived.
    Transport,
    /// The server answered with this status.
    Status(u16),
}

impl AttemptFailure {
    pub fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Transport => true,
            AttemptFailure::Status(code) => RETRY_STATUSES.contains(code),
        }
    }
}

/// Decision returned by the retry policy after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Try again after `delay` (1-based attempt number of the retry).
    Retry { attempt: u32, delay: Duration },
    /// Not retryable, or retries exhausted.
    GiveUp,
}

/// Exponential backoff retry policy for artifact requests.
///
/// Sleeps `backoff * 2^(attempt-1)` before each retry, capped at two minutes.
/// Only transport failures and 500/502/503/504 are retried.
pub struct RetryPolicy {
    max_retries: u32,
    backoff: Duration,
    current_attempt: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
            current_attempt: 0,
        }
    }

    /// Evaluate a failed attempt and decide what to do next.
    pub fn evaluate(&mut self, failure: &AttemptFailure) -> RetryDecision {
        if !failure.is_retryable() {
            return RetryDecision::GiveUp;
        }

        self.current_attempt += 1;

        if self.current_attempt <= self.max_retries {
            let delay = backoff_delay(self.backoff, self.current_attempt);
            warn!(
                ?failure,
                attempt = self.current_attempt,
                max_retries = self.max_retries,
                delay_ms = delay.as_millis() as u64,
                "request failed, retrying"
            );
            RetryDecision::Retry {
                attempt: self.current_attempt,
                delay,
            }
        } else {
            warn!(
                ?failure,
                max_retries = self.max_retries,
                "request retries exhausted"
            );
            RetryDecision::GiveUp
        }
    }

    /// Current attempt count (0 = no retries yet).
    #[cfg(test)]
    pub fn current_attempt(&self) -> u32 {
        self.current_attempt
    }
}

/// `base * 2^(attempt-1)`, capped at [`MAX_BACKOFF`].
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let shift = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(shift).min(MAX_BACKOFF)
}
