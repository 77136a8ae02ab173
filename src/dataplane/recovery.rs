//! Ownership recovery
//!
//! A STARTED flow belongs to the runtime executing its transfer. Two scans keep that
//! ownership honest across runtimes sharing a store:
//!
//! - [`OwnershipHeartbeat`] re-saves this runtime's own STARTED flows so their
//!   `updated_at` never ages past the staleness threshold while the runtime lives.
//! - [`OwnershipRecovery`] takes over STARTED flows of other runtimes whose
//!   `updated_at` is older than the threshold: push flows restart from RECEIVED, pull
//!   flows stay STARTED under the new owner.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::flow::DataFlow;
use super::listener::{DataFlowObservable, notify};
use super::state::DataFlowState;
use crate::clock::Clock;
use crate::statemachine::{Processor, StatefulEntity};
use crate::store::{Criteria, LeasedStore, OwnerFilter};

pub struct OwnershipRecovery {
    store: Arc<dyn LeasedStore<DataFlow>>,
    observable: Arc<DataFlowObservable>,
    runtime_id: String,
    stale_threshold: Duration,
    batch_size: usize,
    clock: Arc<dyn Clock>,
}

impl OwnershipRecovery {
    pub fn new(
        store: Arc<dyn LeasedStore<DataFlow>>,
        observable: Arc<DataFlowObservable>,
        runtime_id: impl Into<String>,
        stale_threshold: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            observable,
            runtime_id: runtime_id.into(),
            stale_threshold,
            batch_size: 20,
            clock,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn criteria(&self, now: i64) -> Criteria {
        let threshold = self.stale_threshold.as_millis() as i64;
        Criteria::in_states(&[DataFlowState::Started])
            .with_owner(OwnerFilter::IsNot(self.runtime_id.clone()))
            .updated_before(now.saturating_sub(threshold))
    }

    async fn recover(&self, mut flow: DataFlow, now: i64) -> bool {
        let previous = flow.state();
        let previous_owner = flow.runtime_id.clone();
        flow.take_ownership(&self.runtime_id);
        let target = if flow.is_push() {
            DataFlowState::Received
        } else {
            DataFlowState::Started
        };

        if let Err(e) = flow.transition_to(target, now) {
            error!(flow_id = %flow.id(), error = %e, "Cannot recover data flow");
            return false;
        }

        match self.store.save(&flow).await {
            Ok(()) => {
                info!(
                    flow_id = %flow.id(),
                    previous_owner = ?previous_owner,
                    runtime_id = %self.runtime_id,
                    state = %flow.state(),
                    "Recovered stale data flow"
                );
                notify(&self.observable, &flow, previous);
                true
            }
            Err(e) => {
                warn!(flow_id = %flow.id(), error = %e, "Failed to save recovered data flow");
                false
            }
        }
    }
}

#[async_trait]
impl Processor for OwnershipRecovery {
    fn name(&self) -> &str {
        "data-flow:ownership-recovery"
    }

    async fn process(&self) -> usize {
        let now = self.clock.now_millis();
        let stale = match self
            .store
            .next_not_leased(self.batch_size, &self.criteria(now))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                error!(error = %e, "Recovery scan failed");
                return 0;
            }
        };
        if stale.is_empty() {
            return 0;
        }

        info!(count = stale.len(), "Found stale data flows to recover");
        let mut recovered = 0;
        for flow in stale {
            if self.recover(flow, now).await {
                recovered += 1;
            }
        }
        recovered
    }
}

pub struct OwnershipHeartbeat {
    store: Arc<dyn LeasedStore<DataFlow>>,
    runtime_id: String,
    interval: Duration,
    batch_size: usize,
    clock: Arc<dyn Clock>,
}

impl OwnershipHeartbeat {
    pub fn new(
        store: Arc<dyn LeasedStore<DataFlow>>,
        runtime_id: impl Into<String>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            runtime_id: runtime_id.into(),
            interval,
            batch_size: 20,
            clock,
        }
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl Processor for OwnershipHeartbeat {
    fn name(&self) -> &str {
        "data-flow:ownership-heartbeat"
    }

    async fn process(&self) -> usize {
        let now = self.clock.now_millis();
        let criteria = Criteria::in_states(&[DataFlowState::Started])
            .with_owner(OwnerFilter::Is(self.runtime_id.clone()))
            .updated_before(now.saturating_sub(self.interval.as_millis() as i64));

        let flows = match self.store.next_not_leased(self.batch_size, &criteria).await {
            Ok(flows) => flows,
            Err(e) => {
                error!(error = %e, "Heartbeat scan failed");
                return 0;
            }
        };

        let mut refreshed = 0;
        for flow in flows {
            // Saving unchanged only stamps updated_at
            match self.store.save(&flow).await {
                Ok(()) => {
                    debug!(flow_id = %flow.id(), "Data flow ownership refreshed");
                    refreshed += 1;
                }
                Err(e) => warn!(flow_id = %flow.id(), error = %e, "Heartbeat save failed"),
            }
        }
        refreshed
    }
}
