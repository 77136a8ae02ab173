//! Retry/backoff policy
//!
//! Decides, per processing attempt, whether an entity stays in its state for another
//! attempt or is handed to its give-up state.
//!
//! ```text
//! Ok(value)                         → Outcome::Success(value)
//! Err(FATAL_ERROR)                  → Outcome::GiveUp        (state_count ignored)
//! Err(ERROR_RETRY), count <  limit  → Outcome::Retry         (state_count + 1)
//! Err(ERROR_RETRY), count >= limit  → Outcome::GiveUp        (retries exhausted)
//! ```
//!
//! A retried entity is not due again before `state_timestamp + base * 2^(count-1)`,
//! capped at `max_delay`.

use std::time::Duration;

use crate::config::RetryConfig;
use crate::spi::StatusResult;

/// Retry decision for a retryable failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Stay in state; next attempt after `delay`
    Retry { delay: Duration },
    /// `state_count` reached the limit
    Exhausted,
}

/// Classified outcome of one asynchronous operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    Success(T),
    /// Stay in the current state and try again later
    Retry(String),
    /// Move to the entity's give-up state with this error detail
    GiveUp(String),
}

/// Bounded exponential retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    limit: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(limit: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            limit,
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Policy without delays between attempts
    pub fn immediate(limit: u32) -> Self {
        Self::new(limit, Duration::ZERO, Duration::ZERO)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn decide(&self, state_count: u32) -> RetryDecision {
        if state_count >= self.limit {
            RetryDecision::Exhausted
        } else {
            RetryDecision::Retry {
                delay: self.delay_for(state_count + 1),
            }
        }
    }

    /// Delay before attempt number `attempt` (1-based) may run
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Whether an entity retried `state_count` times may be processed at `now`
    pub fn is_due(&self, state_count: u32, state_timestamp: i64, now: i64) -> bool {
        if state_count == 0 {
            return true;
        }
        let delay = self.delay_for(state_count).as_millis() as i64;
        now >= state_timestamp.saturating_add(delay)
    }

    /// Classify the result of `description` for an entity at `state_count`
    pub fn evaluate<T>(
        &self,
        state_count: u32,
        description: &str,
        result: StatusResult<T>,
    ) -> Outcome<T> {
        match result {
            Ok(value) => Outcome::Success(value),
            Err(failure) if failure.is_fatal() => {
                Outcome::GiveUp(format!("{description}: fatal error: {failure}"))
            }
            Err(failure) => match self.decide(state_count) {
                RetryDecision::Retry { .. } => Outcome::Retry(format!("{description}: {failure}")),
                RetryDecision::Exhausted => Outcome::GiveUp(format!(
                    "{description}: retry limit of {} exceeded: {failure}",
                    self.limit
                )),
            },
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.limit,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}
