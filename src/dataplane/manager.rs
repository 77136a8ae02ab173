//! Data Plane Manager
//!
//! Commands received from the control plane and the per-state processors of the data
//! flow state machine:
//!
//! | State               | Success                                       | Give-up       |
//! |---------------------|-----------------------------------------------|---------------|
//! | RECEIVED            | STARTED (push: transfer runs detached)        | FAILED        |
//! | PROVISIONING        | PROVISION_NOTIFYING / PROVISION_REQUESTED     | FAILED        |
//! | PROVISION_NOTIFYING | PROVISIONED                                   | FAILED        |
//! | COMPLETED           | DEPROVISIONING (resources) / NOTIFIED         | FAILED        |
//! | FAILED              | NOTIFIED (keeps the original failure reason)  | TERMINATED    |
//! | DEPROVISIONING      | DEPROVISIONED / DEPROVISION_REQUESTED         | DEPROVISIONED |
//!
//! A detached push transfer reports back through [`DataPlaneManager::on_transfer_finished`],
//! which leases the flow by id and only records the result while the flow is STARTED
//! and still owned by this runtime.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::client::TransferProcessApiClient;
use super::error::DataPlaneError;
use super::flow::DataFlow;
use super::listener::{DataFlowObservable, notify};
use super::recovery::{OwnershipHeartbeat, OwnershipRecovery};
use super::state::DataFlowState;
use super::transfer_service::{StreamResult, TransferService, TransferServiceRegistry};
use crate::clock::Clock;
use crate::config::{DataPlaneConfig, StateMachineConfig};
use crate::spi::{
    DataAddress, DataFlowResponse, DataFlowStartMessage, DeprovisionResponse, FlowType,
    ProvisionManager, ProvisionResponse, ProvisionedResource, ServiceFailure,
};
use crate::statemachine::{
    EngineError, EntityState, Outcome, RetryPolicy, StateMachine, StateProcessor,
    StatefulEntity, WaitStrategyFactory, handler,
};
use crate::store::{Criteria, LeasedStore};

use DataFlowState::*;

type HandlerResult = Result<DataFlow, EngineError>;

/// Collaborators of the data flow state machine
#[derive(Clone)]
pub struct DataPlaneCollaborators {
    pub transfer_services: Arc<TransferServiceRegistry>,
    pub provision_manager: Arc<dyn ProvisionManager>,
    pub control_plane: Arc<dyn TransferProcessApiClient>,
}

pub struct DataPlaneManager {
    store: Arc<dyn LeasedStore<DataFlow>>,
    observable: Arc<DataFlowObservable>,
    collaborators: DataPlaneCollaborators,
    config: DataPlaneConfig,
    runtime_id: String,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
}

/// Advance a flow according to the provisioning state of its resources
fn settle_provisioning(flow: &mut DataFlow, now: i64) -> Result<(), EngineError> {
    let (created, requested, failed) = flow.provisioning_progress();
    if created > 0 {
        flow.retry(format!("{created} resource(s) not provisioned yet"), now);
        return Ok(());
    }
    if requested > 0 {
        if flow.state() != ProvisionRequested {
            flow.transition_to(ProvisionRequested, now)?;
        }
        return Ok(());
    }
    if failed > 0 {
        let reason = format!("Provisioning failed: {}", flow.resource_failures().join("; "));
        return flow.give_up(Failed, reason, now);
    }
    flow.transition_to(ProvisionNotifying, now)
}

fn settle_deprovisioning(flow: &mut DataFlow, now: i64) -> Result<(), EngineError> {
    if flow.deprovisioning_outstanding() > 0 {
        if flow.state() != DeprovisionRequested {
            flow.transition_to(DeprovisionRequested, now)?;
        }
        return Ok(());
    }
    flow.transition_to(Deprovisioned, now)
}

impl DataPlaneManager {
    pub fn new(
        store: Arc<dyn LeasedStore<DataFlow>>,
        observable: Arc<DataFlowObservable>,
        collaborators: DataPlaneCollaborators,
        config: DataPlaneConfig,
        runtime_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            observable,
            collaborators,
            retry: RetryPolicy::from(&config.retry),
            config,
            runtime_id: runtime_id.into(),
            clock,
        }
    }

    pub fn runtime_id(&self) -> &str {
        &self.runtime_id
    }

    /// Build the state machine: one processor per actionable state plus the
    /// ownership recovery and heartbeat scans
    pub fn state_machine(
        self: &Arc<Self>,
        config: &StateMachineConfig,
        wait_strategy: WaitStrategyFactory,
    ) -> StateMachine {
        let recovery = OwnershipRecovery::new(
            Arc::clone(&self.store),
            Arc::clone(&self.observable),
            self.runtime_id.clone(),
            Duration::from_millis(self.config.staleness_threshold_ms),
            Arc::clone(&self.clock),
        )
        .batch_size(config.batch_size);
        let heartbeat = OwnershipHeartbeat::new(
            Arc::clone(&self.store),
            self.runtime_id.clone(),
            Duration::from_millis(self.config.heartbeat_interval_ms),
            Arc::clone(&self.clock),
        )
        .batch_size(config.batch_size);

        StateMachine::new("data-flow", wait_strategy)
            .with_processor(self.processor(config, Received, Self::process_received))
            .with_processor(self.processor(config, Provisioning, Self::process_provisioning))
            .with_processor(self.processor(
                config,
                ProvisionNotifying,
                Self::process_provision_notifying,
            ))
            .with_processor(self.processor(config, Completed, Self::process_completed))
            .with_processor(self.processor(config, Failed, Self::process_failed))
            .with_processor(self.processor(config, Deprovisioning, Self::process_deprovisioning))
            .with_processor(Arc::new(recovery))
            .with_processor(Arc::new(heartbeat))
    }

    fn processor<F, Fut>(
        self: &Arc<Self>,
        config: &StateMachineConfig,
        state: DataFlowState,
        f: F,
    ) -> Arc<StateProcessor<DataFlow>>
    where
        F: Fn(Arc<Self>, DataFlow) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let this = Arc::clone(self);
        let observable = Arc::clone(&self.observable);
        let processor = StateProcessor::new(
            format!("data-flow:{state}"),
            Arc::clone(&self.store),
            Criteria::in_states(&[state]),
            handler(move |flow| f(Arc::clone(&this), flow)),
        )
        .batch_size(config.batch_size)
        .retry_policy(self.retry)
        .clock(Arc::clone(&self.clock))
        .on_saved(Arc::new(move |flow: &DataFlow, previous: DataFlowState| {
            notify(&observable, flow, previous)
        }));
        Arc::new(processor)
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    // ---- commands ----

    pub async fn find_by_id(&self, id: &str) -> Result<Option<DataFlow>, DataPlaneError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn transfer_state(&self, id: &str) -> Result<Option<DataFlowState>, DataPlaneError> {
        Ok(self.store.find_by_id(id).await?.map(|f| f.state()))
    }

    /// Check that a push request can be executed by a registered transfer service
    pub fn validate(&self, request: &DataFlowStartMessage) -> Result<(), DataPlaneError> {
        if request.transfer_type.flow_type == FlowType::Pull {
            return Ok(());
        }
        let service = self.resolve(request)?;
        service
            .validate(request)
            .map_err(|e| DataPlaneError::InvalidRequest(e.to_string()))
    }

    fn resolve(
        &self,
        request: &DataFlowStartMessage,
    ) -> Result<Arc<dyn TransferService>, DataPlaneError> {
        self.collaborators
            .transfer_services
            .resolve(request)
            .ok_or_else(|| {
                DataPlaneError::InvalidRequest(format!(
                    "No transfer service for {} -> {}",
                    request.source.type_name, request.transfer_type
                ))
            })
    }

    /// Start a flow for a transfer process; repeated requests for the same process are
    /// answered from the existing flow
    pub async fn start(
        &self,
        message: DataFlowStartMessage,
    ) -> Result<DataFlowResponse, DataPlaneError> {
        if self.store.find_by_id(&message.process_id).await?.is_some() {
            return self.restart(message).await;
        }

        if message.resource_definitions.is_empty() {
            self.validate(&message)?;
        }
        let flow = DataFlow::from_start_message(message, &self.runtime_id, self.now());
        // A concurrent start for the same process surfaces as a conflict
        self.store.create(&flow).await?;
        info!(
            flow_id = %flow.id(),
            state = %flow.state(),
            transfer_type = %flow.transfer_type,
            runtime_id = %self.runtime_id,
            "Data flow received"
        );
        if flow.state() == Received {
            self.observable
                .invoke_for_each(|listener| listener.received(&flow));
        }
        Ok(self.response(&flow))
    }

    async fn restart(
        &self,
        message: DataFlowStartMessage,
    ) -> Result<DataFlowResponse, DataPlaneError> {
        let id = message.process_id.clone();
        let mut flow = self.store.find_by_id_and_lease(&id).await?;
        let previous = flow.state();

        if !matches!(previous, Provisioned | Suspended) {
            self.release(&id).await;
            if previous.is_final() {
                return Err(DataPlaneError::InvalidState {
                    id,
                    action: "started",
                    state: previous.name(),
                });
            }
            debug!(flow_id = %id, state = %previous, "Data flow already in progress");
            return Ok(self.response(&flow));
        }

        flow.restart_with(message);
        if let Err(e) = self.validate(&flow.to_start_message()) {
            self.release(&id).await;
            return Err(e);
        }
        flow.take_ownership(&self.runtime_id);
        flow.transition_to(Received, self.now())?;
        let flow = self.persist(flow, previous).await?;
        Ok(self.response(&flow))
    }

    fn response(&self, flow: &DataFlow) -> DataFlowResponse {
        let provisioning = matches!(
            flow.state(),
            Provisioning | ProvisionRequested | ProvisionNotifying
        );
        let data_address = (!flow.is_push() && !provisioning).then(|| {
            let base = self.config.public_api_url.trim_end_matches('/');
            DataAddress::new("HttpData")
                .with_property("endpoint", format!("{base}/{}", flow.id()))
                .with_property("flowId", flow.id())
        });
        DataFlowResponse {
            data_address,
            provisioning,
        }
    }

    pub async fn suspend(&self, id: &str) -> Result<DataFlow, DataPlaneError> {
        let flow = self.store.find_by_id_and_lease(id).await?;
        let previous = flow.state();
        if previous == Suspended {
            self.release(id).await;
            return Ok(flow);
        }
        if !flow.can_transition_to(Suspended) {
            self.release(id).await;
            return Err(DataPlaneError::InvalidState {
                id: id.to_string(),
                action: "suspended",
                state: previous.name(),
            });
        }

        let mut flow = self.stop_transfer(flow).await?;
        flow.transition_to(Suspended, self.now())?;
        self.persist(flow, previous).await
    }

    /// Terminate a flow; a flow holding provisioned resources deprovisions them first
    pub async fn terminate(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<DataFlow, DataPlaneError> {
        let flow = self.store.find_by_id_and_lease(id).await?;
        let previous = flow.state();
        if flow.is_final() || matches!(previous, Deprovisioning | DeprovisionRequested) {
            debug!(flow_id = %id, state = %previous, "Data flow already terminating");
            self.release(id).await;
            return Ok(flow);
        }

        let mut flow = self.stop_transfer(flow).await?;
        let reason = reason.unwrap_or_else(|| "terminated by control plane".to_string());
        let target = if flow.has_provisioned_resources() && flow.can_transition_to(Deprovisioning)
        {
            Deprovisioning
        } else {
            Terminated
        };
        flow.give_up(target, reason, self.now())?;
        info!(flow_id = %id, next_state = %target, "Data flow terminated");
        self.persist(flow, previous).await
    }

    /// Stop the running push transfer of a leased flow; releases the lease on failure
    async fn stop_transfer(&self, flow: DataFlow) -> Result<DataFlow, DataPlaneError> {
        if !flow.is_push() || flow.state() != Started {
            return Ok(flow);
        }
        let Some(service) = self
            .collaborators
            .transfer_services
            .resolve(&flow.to_start_message())
        else {
            return Ok(flow);
        };
        if let Err(e) = service.terminate(&flow).await {
            self.release(flow.id()).await;
            return Err(DataPlaneError::TransferFailed(e.to_string()));
        }
        Ok(flow)
    }

    /// Asynchronous provisioner callback
    pub async fn resource_provisioned(
        &self,
        flow_id: &str,
        definition_id: &str,
        resource: ProvisionedResource,
    ) -> Result<DataFlow, DataPlaneError> {
        self.mutate(flow_id, "provisioned", &[Provisioning, ProvisionRequested], |flow, now| {
            let entry = flow.resource_mut(definition_id).ok_or_else(|| {
                DataPlaneError::InvalidRequest(format!(
                    "unknown resource definition {definition_id}"
                ))
            })?;
            entry.mark_provisioned(resource);
            if flow.state() == ProvisionRequested {
                settle_provisioning(flow, now)?;
            }
            Ok(())
        })
        .await
    }

    /// Asynchronous deprovisioner callback
    pub async fn resource_deprovisioned(
        &self,
        flow_id: &str,
        resource_id: &str,
    ) -> Result<DataFlow, DataPlaneError> {
        let allowed = [Deprovisioning, DeprovisionRequested];
        self.mutate(flow_id, "deprovisioned", &allowed, |flow, now| {
            let entry = flow.resource_by_provisioned_id_mut(resource_id).ok_or_else(|| {
                DataPlaneError::InvalidRequest(format!("unknown resource {resource_id}"))
            })?;
            entry.mark_deprovisioned();
            if flow.state() == DeprovisionRequested {
                settle_deprovisioning(flow, now)?;
            }
            Ok(())
        })
        .await
    }

    /// Lease, check the state, mutate, save
    async fn mutate<F>(
        &self,
        id: &str,
        action: &'static str,
        allowed: &[DataFlowState],
        f: F,
    ) -> Result<DataFlow, DataPlaneError>
    where
        F: FnOnce(&mut DataFlow, i64) -> Result<(), DataPlaneError>,
    {
        let mut flow = self.store.find_by_id_and_lease(id).await?;
        let previous = flow.state();

        let result = if allowed.contains(&previous) {
            f(&mut flow, self.now())
        } else {
            Err(DataPlaneError::InvalidState {
                id: id.to_string(),
                action,
                state: previous.name(),
            })
        };
        if let Err(e) = result {
            self.release(id).await;
            return Err(e);
        }
        self.persist(flow, previous).await
    }

    async fn persist(
        &self,
        flow: DataFlow,
        previous: DataFlowState,
    ) -> Result<DataFlow, DataPlaneError> {
        self.store.save(&flow).await?;
        notify(&self.observable, &flow, previous);
        Ok(flow)
    }

    async fn release(&self, id: &str) {
        if let Err(e) = self.store.break_lease(id).await {
            warn!(flow_id = %id, error = %e, "Failed to break lease");
        }
    }

    /// Record the result of a detached transfer. The flow is leased by id and only
    /// updated while it is STARTED and owned by this runtime. While another worker
    /// holds the lease the attempt is repeated, first every `completion_lease_wait_ms`
    /// and after `completion_lease_attempts` every `heartbeat_interval_ms`, until the
    /// result is recorded or the flow moved on.
    pub async fn on_transfer_finished(&self, id: &str, result: StreamResult<()>) {
        let fast = Duration::from_millis(self.config.completion_lease_wait_ms);
        let slow = Duration::from_millis(self.config.heartbeat_interval_ms.max(1));
        let attempts = self.config.completion_lease_attempts.max(1);

        let mut attempt = 0u32;
        while !self.record_transfer_result(id, &result, attempt).await {
            attempt = attempt.saturating_add(1);
            if attempt == attempts {
                warn!(
                    flow_id = %id,
                    attempts,
                    "Data flow still leased, retrying at heartbeat interval"
                );
            }
            let wait = if attempt < attempts { fast } else { slow };
            tokio::time::sleep(wait).await;
        }
    }

    /// One attempt at recording a transfer result; false when the flow is leased elsewhere
    async fn record_transfer_result(
        &self,
        id: &str,
        result: &StreamResult<()>,
        attempt: u32,
    ) -> bool {
        let mut flow = match self.store.find_by_id_and_lease(id).await {
            Ok(flow) => flow,
            Err(e) if e.is_contention() => {
                debug!(flow_id = %id, attempt, "Data flow leased, waiting to record result");
                return false;
            }
            Err(e) => {
                error!(flow_id = %id, error = %e, "Failed to load data flow");
                return true;
            }
        };

        let previous = flow.state();
        if previous != Started || flow.owner() != Some(self.runtime_id.as_str()) {
            debug!(
                flow_id = %id,
                state = %previous,
                owner = ?flow.owner(),
                runtime_id = %self.runtime_id,
                "Transfer result ignored"
            );
            self.release(id).await;
            return true;
        }

        let now = self.now();
        let applied = match result {
            Ok(()) => flow.transition_to(Completed, now),
            Err(failure) => flow.give_up(Failed, failure.to_string(), now),
        };
        if let Err(e) = applied {
            error!(flow_id = %id, error = %e, "Cannot record transfer result");
            self.release(id).await;
            return true;
        }

        match self.persist(flow, previous).await {
            Ok(flow) => info!(flow_id = %id, state = %flow.state(), "Transfer finished"),
            Err(e) => warn!(flow_id = %id, error = %e, "Failed to record transfer result"),
        }
        true
    }

    // ---- processors ----

    fn apply<T>(
        &self,
        flow: &mut DataFlow,
        outcome: Outcome<T>,
        give_up_to: DataFlowState,
    ) -> Result<Option<T>, EngineError> {
        match outcome {
            Outcome::Success(value) => Ok(Some(value)),
            Outcome::Retry(reason) => {
                warn!(
                    flow_id = %flow.id(),
                    state = %flow.state(),
                    state_count = flow.state_count(),
                    reason = %reason,
                    "Data flow step failed, will retry"
                );
                flow.retry(reason, self.now());
                Ok(None)
            }
            Outcome::GiveUp(reason) => {
                warn!(
                    flow_id = %flow.id(),
                    state = %flow.state(),
                    give_up_to = %give_up_to,
                    reason = %reason,
                    "Data flow step failed, giving up"
                );
                flow.give_up(give_up_to, reason, self.now())?;
                Ok(None)
            }
        }
    }

    async fn process_received(self: Arc<Self>, mut flow: DataFlow) -> HandlerResult {
        if !flow.is_push() {
            flow.take_ownership(&self.runtime_id);
            flow.transition_to(Started, self.now())?;
            return Ok(flow);
        }

        let request = flow.to_start_message();
        let service = match self.resolve(&request) {
            Ok(service) => service,
            Err(e) => {
                self.apply::<()>(&mut flow, Outcome::GiveUp(e.to_string()), Failed)?;
                return Ok(flow);
            }
        };
        if let Err(e) = service.validate(&request) {
            let failure = ServiceFailure::retry(e.to_string());
            let outcome = self
                .retry
                .evaluate::<()>(flow.state_count(), "Validate transfer", Err(failure));
            self.apply(&mut flow, outcome, Failed)?;
            return Ok(flow);
        }

        flow.take_ownership(&self.runtime_id);
        flow.transition_to(Started, self.now())?;
        info!(
            flow_id = %flow.id(),
            service = service.name(),
            runtime_id = %self.runtime_id,
            "Starting transfer"
        );

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            let id = request.process_id.clone();
            let result = service.transfer(request).await;
            this.on_transfer_finished(&id, result).await;
        });
        Ok(flow)
    }

    async fn process_provisioning(self: Arc<Self>, mut flow: DataFlow) -> HandlerResult {
        let definitions = flow.definitions_to_provision();
        if !definitions.is_empty() {
            let results = self
                .collaborators
                .provision_manager
                .provision(&definitions, None)
                .await;

            let limit = self.retry.limit();
            for (definition, result) in definitions.iter().zip(results) {
                let Some(entry) = flow.resource_mut(&definition.id) else {
                    continue;
                };
                match result {
                    Ok(ProvisionResponse::Provisioned(resource)) => {
                        entry.mark_provisioned(resource)
                    }
                    Ok(ProvisionResponse::InProcess) => entry.mark_provision_requested(),
                    Err(failure) if failure.is_fatal() || entry.attempts >= limit => {
                        warn!(
                            flow_id = %definition.process_id,
                            definition_id = %definition.id,
                            attempts = entry.attempts,
                            error = %failure,
                            "Resource provisioning failed, giving up"
                        );
                        entry.fail(failure.to_string());
                    }
                    Err(failure) => entry.record_attempt(failure.to_string()),
                }
            }
        }

        settle_provisioning(&mut flow, self.now())?;
        Ok(flow)
    }

    async fn process_provision_notifying(self: Arc<Self>, mut flow: DataFlow) -> HandlerResult {
        let result = self.collaborators.control_plane.provisioned(&flow).await;
        let outcome = self
            .retry
            .evaluate(flow.state_count(), "Notify provisioned", result);
        if self.apply(&mut flow, outcome, Failed)?.is_some() {
            flow.transition_to(Provisioned, self.now())?;
        }
        Ok(flow)
    }

    async fn process_completed(self: Arc<Self>, mut flow: DataFlow) -> HandlerResult {
        let result = self.collaborators.control_plane.completed(&flow).await;
        let outcome = self
            .retry
            .evaluate(flow.state_count(), "Notify completed", result);
        if self.apply(&mut flow, outcome, Failed)?.is_some() {
            let target = if flow.has_provisioned_resources() {
                Deprovisioning
            } else {
                Notified
            };
            flow.transition_to(target, self.now())?;
        }
        Ok(flow)
    }

    async fn process_failed(self: Arc<Self>, mut flow: DataFlow) -> HandlerResult {
        let reason = flow
            .failure_reason
            .as_deref()
            .or(flow.error_detail())
            .unwrap_or("data flow failed")
            .to_string();
        let result = self.collaborators.control_plane.failed(&flow, &reason).await;
        let outcome = self
            .retry
            .evaluate(flow.state_count(), "Notify failed", result);
        if self.apply(&mut flow, outcome, Terminated)?.is_some() {
            flow.give_up(Notified, reason, self.now())?;
        }
        Ok(flow)
    }

    async fn process_deprovisioning(self: Arc<Self>, mut flow: DataFlow) -> HandlerResult {
        let resources = flow.resources_to_deprovision();
        if resources.is_empty() {
            settle_deprovisioning(&mut flow, self.now())?;
            return Ok(flow);
        }

        let results = self
            .collaborators
            .provision_manager
            .deprovision(&resources, None)
            .await;

        let mut failures = Vec::new();
        let mut fatal = false;
        for (resource, result) in resources.iter().zip(results) {
            let Some(entry) = flow.resource_by_provisioned_id_mut(&resource.id) else {
                continue;
            };
            match result {
                Ok(DeprovisionResponse::Deprovisioned) => entry.mark_deprovisioned(),
                Ok(DeprovisionResponse::InProcess) => entry.mark_deprovision_requested(),
                Err(failure) => {
                    if failure.is_fatal() {
                        fatal = true;
                        entry.fail(failure.to_string());
                    }
                    failures.push(format!("{}: {failure}", resource.id));
                }
            }
        }

        if failures.is_empty() {
            settle_deprovisioning(&mut flow, self.now())?;
            return Ok(flow);
        }

        let failure = if fatal {
            ServiceFailure::fatal(failures.join("; "))
        } else {
            ServiceFailure::retry(failures.join("; "))
        };
        let outcome = self
            .retry
            .evaluate::<()>(flow.state_count(), "Deprovisioning", Err(failure));
        self.apply(&mut flow, outcome, Deprovisioned)?;
        Ok(flow)
    }
}
