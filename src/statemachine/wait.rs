//! Poll wait strategies
//!
//! Controls how long a scheduling loop sleeps between two polls. This is backoff of
//! the *poll*, not of an entity: every loop owns its own strategy instance.

use std::sync::Arc;
use std::time::Duration;

use crate::config::StateMachineConfig;

/// Decides the pause between two polls of one scheduling loop
pub trait WaitStrategy: Send {
    /// Pause before the next poll
    fn wait_for(&self) -> Duration;

    /// The last poll found work
    fn success(&mut self);

    /// The last poll found nothing to do
    fn empty(&mut self);
}

/// Creates a fresh strategy for every scheduling loop
pub type WaitStrategyFactory = Arc<dyn Fn() -> Box<dyn WaitStrategy> + Send + Sync>;

/// Doubles the pause on every empty poll, snaps back to the minimum on work
#[derive(Debug, Clone)]
pub struct ExponentialWaitStrategy {
    min_wait: Duration,
    max_wait: Duration,
    empty_polls: u32,
}

impl ExponentialWaitStrategy {
    pub fn new(min_wait: Duration, max_wait: Duration) -> Self {
        Self {
            min_wait,
            max_wait: max_wait.max(min_wait),
            empty_polls: 0,
        }
    }

    /// Factory producing one strategy per loop from the state machine config
    pub fn factory(config: &StateMachineConfig) -> WaitStrategyFactory {
        let min_wait = Duration::from_millis(config.min_wait_ms);
        let max_wait = Duration::from_millis(config.max_wait_ms);
        Arc::new(move || Box::new(ExponentialWaitStrategy::new(min_wait, max_wait)))
    }
}

impl WaitStrategy for ExponentialWaitStrategy {
    fn wait_for(&self) -> Duration {
        let factor = 1u32.checked_shl(self.empty_polls).unwrap_or(u32::MAX);
        self.min_wait
            .checked_mul(factor)
            .unwrap_or(self.max_wait)
            .min(self.max_wait)
    }

    fn success(&mut self) {
        self.empty_polls = 0;
    }

    fn empty(&mut self) {
        // Stop counting once the cap is reached
        if self.wait_for() < self.max_wait {
            self.empty_polls += 1;
        }
    }
}
