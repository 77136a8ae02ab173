//! State machine runner
//!
//! Drives a set of [`Processor`]s, one tokio task per processor. Each loop owns its own
//! [`WaitStrategy`] and sleeps between polls; a `watch` channel stops all loops. A
//! batch that is in flight when shutdown is requested completes before its loop exits.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::processor::Processor;
use super::wait::{WaitStrategy, WaitStrategyFactory};

pub struct StateMachine {
    name: String,
    processors: Vec<Arc<dyn Processor>>,
    wait_strategy: WaitStrategyFactory,
}

impl StateMachine {
    pub fn new(name: impl Into<String>, wait_strategy: WaitStrategyFactory) -> Self {
        Self {
            name: name.into(),
            processors: Vec::new(),
            wait_strategy,
        }
    }

    pub fn with_processor(mut self, processor: Arc<dyn Processor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Poll every processor once, in registration order
    pub async fn run_once(&self) -> usize {
        let mut total = 0;
        for processor in &self.processors {
            total += poll(&self.name, processor.as_ref()).await;
        }
        total
    }

    /// Spawn one scheduling loop per processor
    pub fn start(self) -> StateMachineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(
            state_machine = %self.name,
            processors = self.processors.len(),
            "Starting state machine"
        );

        let tasks = self
            .processors
            .iter()
            .map(|processor| {
                tokio::spawn(run_loop(
                    self.name.clone(),
                    Arc::clone(processor),
                    (self.wait_strategy)(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        StateMachineHandle {
            name: self.name,
            shutdown: shutdown_tx,
            tasks,
        }
    }
}

/// Handle on a started state machine
pub struct StateMachineHandle {
    name: String,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl StateMachineHandle {
    /// Stop polling and wait for in-flight batches to drain
    pub async fn stop(self) {
        info!(state_machine = %self.name, "Stopping state machine");
        // Receivers live in the loops; a send error only means they already exited
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(state_machine = %self.name, error = %e, "Scheduling loop aborted");
            }
        }
        info!(state_machine = %self.name, "State machine stopped");
    }
}

async fn poll(machine: &str, processor: &dyn Processor) -> usize {
    match AssertUnwindSafe(processor.process()).catch_unwind().await {
        Ok(processed) => processed,
        Err(_) => {
            error!(
                state_machine = %machine,
                processor = processor.name(),
                "Processor panicked"
            );
            0
        }
    }
}

async fn run_loop(
    machine: String,
    processor: Arc<dyn Processor>,
    mut wait: Box<dyn WaitStrategy>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(state_machine = %machine, processor = processor.name(), "Scheduling loop started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        if poll(&machine, processor.as_ref()).await > 0 {
            wait.success();
        } else {
            wait.empty();
        }

        tokio::select! {
            _ = tokio::time::sleep(wait.wait_for()) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(state_machine = %machine, processor = processor.name(), "Scheduling loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statemachine::ExponentialWaitStrategy;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingProcessor {
        polls: AtomicUsize,
    }

    #[async_trait]
    impl Processor for CountingProcessor {
        fn name(&self) -> &str {
            "counting"
        }

        async fn process(&self) -> usize {
            self.polls.fetch_add(1, Ordering::SeqCst);
            1
        }
    }

    struct PanickingProcessor;

    #[async_trait]
    impl Processor for PanickingProcessor {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn process(&self) -> usize {
            panic!("poll failed")
        }
    }

    fn fast_waits() -> WaitStrategyFactory {
        Arc::new(|| {
            Box::new(ExponentialWaitStrategy::new(
                Duration::from_millis(1),
                Duration::from_millis(5),
            ))
        })
    }

    #[tokio::test]
    async fn test_run_once_polls_every_processor() {
        let counting = Arc::new(CountingProcessor {
            polls: AtomicUsize::new(0),
        });
        let machine = StateMachine::new("test", fast_waits())
            .with_processor(counting.clone())
            .with_processor(Arc::new(PanickingProcessor));

        assert_eq!(machine.run_once().await, 1);
        assert_eq!(counting.polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loops_run_until_stopped() {
        let counting = Arc::new(CountingProcessor {
            polls: AtomicUsize::new(0),
        });
        let handle = StateMachine::new("test", fast_waits())
            .with_processor(counting.clone())
            .with_processor(Arc::new(PanickingProcessor))
            .start();

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop().await;

        let polls = counting.polls.load(Ordering::SeqCst);
        assert!(polls > 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counting.polls.load(Ordering::SeqCst), polls);
    }
}
