//! Transfer Process Manager
//!
//! Per-state processors of the transfer process state machine. Each handler performs
//! one side effect and returns the process to persist:
//!
//! | State          | Success                                  | Give-up                    |
//! |----------------|------------------------------------------|----------------------------|
//! | INITIAL        | PROVISIONING                             | TERMINATED / TERMINATING   |
//! | PROVISIONING   | PROVISIONED / PROVISIONING_REQUESTED     | TERMINATED / TERMINATING   |
//! | PROVISIONED    | REQUESTING (consumer) / STARTING (prov.) | -                          |
//! | REQUESTING     | REQUESTED                                | TERMINATED                 |
//! | STARTING       | STARTED                                  | TERMINATING                |
//! | SUSPENDING     | SUSPENDED                                | TERMINATING                |
//! | COMPLETING     | COMPLETED / DEPROVISIONING (provider)    | TERMINATING                |
//! | TERMINATING    | TERMINATED / DEPROVISIONING (provider)   | TERMINATED                 |
//! | DEPROVISIONING | DEPROVISIONED / DEPROVISIONING_REQUESTED | DEPROVISIONED (best effort)|
//!
//! Give-up targets with two entries are (consumer / provider).

use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::listener::{TransferProcessObservable, notify};
use super::process::TransferProcess;
use super::state::TransferProcessState;
use crate::clock::Clock;
use crate::config::{StateMachineConfig, TransferProcessConfig};
use crate::spi::{
    DataAddressResolver, DataFlowController, DataFlowStartMessage, DeprovisionResponse,
    PolicyArchive, ProvisionManager, ProvisionResourceState, ProvisionResponse,
    RemoteMessage, RemoteMessageDispatcher, ResourceManifestGenerator, ServiceFailure,
    TransferEventMessage, TransferRequestMessage, TransferStartMessage, TransferType,
};
use crate::statemachine::{
    EngineError, Outcome, RetryPolicy, SharedPendingGuard, StateMachine, StateProcessor,
    StatefulEntity, WaitStrategyFactory, handler,
};
use crate::store::{Criteria, LeasedStore};

use TransferProcessState::*;

type HandlerResult = Result<TransferProcess, EngineError>;

/// Collaborators of the transfer process state machine
#[derive(Clone)]
pub struct TransferProcessCollaborators {
    pub dispatcher: Arc<dyn RemoteMessageDispatcher>,
    pub provision_manager: Arc<dyn ProvisionManager>,
    pub policy_archive: Arc<dyn PolicyArchive>,
    pub address_resolver: Arc<dyn DataAddressResolver>,
    pub manifest_generator: Arc<dyn ResourceManifestGenerator>,
    pub data_flow_controller: Arc<dyn DataFlowController>,
}

pub struct TransferProcessManager {
    store: Arc<dyn LeasedStore<TransferProcess>>,
    observable: Arc<TransferProcessObservable>,
    collaborators: TransferProcessCollaborators,
    config: TransferProcessConfig,
    participant_id: String,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    pending_guard: Option<SharedPendingGuard<TransferProcess>>,
}

/// Give-up target of failures before the transfer was requested or started
fn setup_failure_target(process: &TransferProcess) -> TransferProcessState {
    if process.is_consumer() {
        Terminated
    } else {
        Terminating
    }
}

impl TransferProcessManager {
    pub fn new(
        store: Arc<dyn LeasedStore<TransferProcess>>,
        observable: Arc<TransferProcessObservable>,
        collaborators: TransferProcessCollaborators,
        config: TransferProcessConfig,
        participant_id: impl Into<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            observable,
            collaborators,
            retry: RetryPolicy::from(&config.retry),
            config,
            participant_id: participant_id.into(),
            clock,
            pending_guard: None,
        }
    }

    pub fn with_pending_guard(mut self, guard: SharedPendingGuard<TransferProcess>) -> Self {
        self.pending_guard = Some(guard);
        self
    }

    /// Build the state machine with one processor per actionable state
    pub fn state_machine(
        self: &Arc<Self>,
        config: &StateMachineConfig,
        wait_strategy: WaitStrategyFactory,
    ) -> StateMachine {
        let machine = StateMachine::new("transfer-process", wait_strategy);
        machine
            .with_processor(self.processor(config, Initial, Self::process_initial))
            .with_processor(self.processor(config, Provisioning, Self::process_provisioning))
            .with_processor(self.processor(config, Provisioned, Self::process_provisioned))
            .with_processor(self.processor(config, Requesting, Self::process_requesting))
            .with_processor(self.processor(config, Starting, Self::process_starting))
            .with_processor(self.processor(config, Suspending, Self::process_suspending))
            .with_processor(self.processor(config, Completing, Self::process_completing))
            .with_processor(self.processor(config, Terminating, Self::process_terminating))
            .with_processor(self.processor(config, Deprovisioning, Self::process_deprovisioning))
    }

    fn processor<F, Fut>(
        self: &Arc<Self>,
        config: &StateMachineConfig,
        state: TransferProcessState,
        f: F,
    ) -> Arc<StateProcessor<TransferProcess>>
    where
        F: Fn(Arc<Self>, TransferProcess) -> Fut + Send + Sync + Copy + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let this = Arc::clone(self);
        let observable = Arc::clone(&self.observable);
        let processor = StateProcessor::new(
            format!("transfer-process:{state}"),
            Arc::clone(&self.store),
            Criteria::in_states(&[state]),
            handler(move |process| f(Arc::clone(&this), process)),
        )
        .batch_size(config.batch_size)
        .retry_policy(self.retry)
        .clock(Arc::clone(&self.clock))
        .pending_guard(self.pending_guard.clone())
        .on_saved(Arc::new(move |process: &TransferProcess, previous: TransferProcessState| {
            notify(&observable, process, previous)
        }));
        Arc::new(processor)
    }

    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    /// Apply a classified outcome; returns the value only on success
    fn apply<T>(
        &self,
        process: &mut TransferProcess,
        outcome: Outcome<T>,
        give_up_to: TransferProcessState,
    ) -> Result<Option<T>, EngineError> {
        match outcome {
            Outcome::Success(value) => Ok(Some(value)),
            Outcome::Retry(reason) => {
                warn!(
                    process_id = %process.id(),
                    state = %process.state(),
                    state_count = process.state_count(),
                    reason = %reason,
                    "Transfer process step failed, will retry"
                );
                process.retry(reason, self.now());
                Ok(None)
            }
            Outcome::GiveUp(reason) => {
                warn!(
                    process_id = %process.id(),
                    state = %process.state(),
                    give_up_to = %give_up_to,
                    reason = %reason,
                    "Transfer process step failed, giving up"
                );
                process.give_up(give_up_to, reason, self.now())?;
                Ok(None)
            }
        }
    }

    fn fatal(
        &self,
        process: &mut TransferProcess,
        give_up_to: TransferProcessState,
        reason: String,
    ) -> Result<(), EngineError> {
        self.apply::<()>(process, Outcome::GiveUp(reason), give_up_to)
            .map(|_| ())
    }

    /// Counterparty's process id; the consumer only learns it from the request ack
    fn counterparty_id(process: &TransferProcess) -> String {
        process
            .correlation_id
            .clone()
            .unwrap_or_else(|| process.id().to_string())
    }

    fn event_message(process: &TransferProcess, reason: Option<String>) -> TransferEventMessage {
        TransferEventMessage {
            process_id: Self::counterparty_id(process),
            protocol: process.protocol.clone(),
            counter_party_address: process.counter_party_address.clone(),
            reason,
        }
    }

    async fn process_initial(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let target = setup_failure_target(&process);
        let Some(policy) = self
            .collaborators
            .policy_archive
            .find_policy_for_contract(&process.contract_id)
        else {
            let reason = format!("No policy found for contract {}", process.contract_id);
            self.fatal(&mut process, target, reason)?;
            return Ok(process);
        };

        let generator = &self.collaborators.manifest_generator;
        let manifest = if process.is_consumer() {
            generator.generate_consumer_manifest(
                process.id(),
                process.data_destination.as_ref(),
                &policy,
            )
        } else {
            let Some(content) = self
                .collaborators
                .address_resolver
                .resolve_for_asset(&process.asset_id)
            else {
                let reason = format!("No content address found for asset {}", process.asset_id);
                self.fatal(&mut process, target, reason)?;
                return Ok(process);
            };
            let manifest = generator.generate_provider_manifest(process.id(), &content, &policy);
            process.content_data_address = Some(content);
            manifest
        };

        match manifest {
            Ok(definitions) => {
                debug!(
                    process_id = %process.id(),
                    resources = definitions.len(),
                    "Resource manifest generated"
                );
                process.set_manifest(definitions);
                process.transition_to(Provisioning, self.now())?;
            }
            Err(failure) => {
                let reason = format!("Resource manifest generation failed: {failure}");
                self.fatal(&mut process, target, reason)?;
            }
        }
        Ok(process)
    }

    /// Target once nothing is left to provision
    fn provisioning_settled(&self, process: &mut TransferProcess) -> Result<(), EngineError> {
        let outstanding = process
            .resources
            .iter()
            .any(|r| r.state == ProvisionResourceState::ProvisionRequested);
        let target = if outstanding {
            ProvisioningRequested
        } else {
            Provisioned
        };
        process.transition_to(target, self.now())
    }

    async fn process_provisioning(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let definitions = process.definitions_to_provision();
        if definitions.is_empty() {
            self.provisioning_settled(&mut process)?;
            return Ok(process);
        }

        let policy = self
            .collaborators
            .policy_archive
            .find_policy_for_contract(&process.contract_id);
        let results = self
            .collaborators
            .provision_manager
            .provision(&definitions, policy.as_ref())
            .await;

        let mut failures = Vec::new();
        let mut fatal = false;
        for (definition, result) in definitions.iter().zip(results) {
            let Some(entry) = process.resource_mut(&definition.id) else {
                continue;
            };
            match result {
                Ok(ProvisionResponse::Provisioned(resource)) => entry.mark_provisioned(resource),
                Ok(ProvisionResponse::InProcess) => entry.mark_provision_requested(),
                Err(failure) => {
                    fatal |= failure.is_fatal();
                    failures.push(format!("{}: {failure}", definition.id));
                }
            }
        }

        if failures.is_empty() {
            self.provisioning_settled(&mut process)?;
            return Ok(process);
        }

        let failure = if fatal {
            ServiceFailure::fatal(failures.join("; "))
        } else {
            ServiceFailure::retry(failures.join("; "))
        };
        let outcome = self.retry.evaluate::<()>(
            process.state_count(),
            "Provisioning",
            Err(failure),
        );
        let target = setup_failure_target(&process);
        self.apply(&mut process, outcome, target)?;
        Ok(process)
    }

    async fn process_provisioned(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let target = if process.is_consumer() {
            Requesting
        } else {
            Starting
        };
        process.transition_to(target, self.now())?;
        Ok(process)
    }

    async fn process_requesting(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let message = RemoteMessage::TransferRequestMessage(TransferRequestMessage {
            process_id: process.id().to_string(),
            protocol: process.protocol.clone(),
            counter_party_address: process.counter_party_address.clone(),
            callback_address: self.config.callback_address.clone(),
            contract_id: process.contract_id.clone(),
            asset_id: process.asset_id.clone(),
            transfer_type: process.transfer_type.clone(),
            data_destination: process.effective_destination(),
        });
        let result = self.collaborators.dispatcher.dispatch(message).await;
        let outcome = self
            .retry
            .evaluate(process.state_count(), "Send TransferRequestMessage", result);

        if let Some(ack) = self.apply(&mut process, outcome, Terminated)? {
            if ack.correlation_id.is_some() {
                process.correlation_id = ack.correlation_id;
            }
            process.transition_to(Requested, self.now())?;
            info!(
                process_id = %process.id(),
                correlation_id = ?process.correlation_id,
                "Transfer requested"
            );
        }
        Ok(process)
    }

    fn start_message(&self, process: &TransferProcess) -> Result<DataFlowStartMessage, String> {
        let source = process
            .content_data_address
            .clone()
            .ok_or_else(|| "No content address resolved".to_string())?;
        let transfer_type: TransferType = process.transfer_type.parse()?;
        let policy = self
            .collaborators
            .policy_archive
            .find_policy_for_contract(&process.contract_id)
            .unwrap_or_default();
        let resource_definitions = self
            .collaborators
            .manifest_generator
            .generate_data_plane_manifest(process.id(), &source, &policy)
            .map_err(|e| format!("data plane manifest: {e}"))?;
        Ok(DataFlowStartMessage {
            process_id: process.id().to_string(),
            asset_id: process.asset_id.clone(),
            agreement_id: process.contract_id.clone(),
            participant_id: self.participant_id.clone(),
            source,
            destination: process.effective_destination(),
            transfer_type,
            callback_address: None,
            properties: process.private_properties.clone(),
            resource_definitions,
        })
    }

    async fn process_starting(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let message = match self.start_message(&process) {
            Ok(message) => message,
            Err(reason) => {
                let reason = format!("Cannot start data flow: {reason}");
                self.fatal(&mut process, Terminating, reason)?;
                return Ok(process);
            }
        };

        let started = self.collaborators.data_flow_controller.start(message).await;
        let outcome = self
            .retry
            .evaluate(process.state_count(), "Start data flow", started);
        let Some(response) = self.apply(&mut process, outcome, Terminating)? else {
            return Ok(process);
        };

        if response.provisioning {
            // Woken up by the data plane's provisioned callback
            debug!(process_id = %process.id(), "Data flow provisioning, process parked");
            process.core_mut().set_pending(true);
            return Ok(process);
        }

        let message = RemoteMessage::TransferStartMessage(TransferStartMessage {
            process_id: Self::counterparty_id(&process),
            protocol: process.protocol.clone(),
            counter_party_address: process.counter_party_address.clone(),
            data_address: response.data_address,
        });
        let result = self.collaborators.dispatcher.dispatch(message).await;
        let outcome = self
            .retry
            .evaluate(process.state_count(), "Send TransferStartMessage", result);
        if self.apply(&mut process, outcome, Terminating)?.is_some() {
            process.transition_to(Started, self.now())?;
            info!(process_id = %process.id(), "Transfer started");
        }
        Ok(process)
    }

    async fn process_suspending(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        if process.is_provider() {
            let suspended = self
                .collaborators
                .data_flow_controller
                .suspend(process.id())
                .await;
            let outcome = self
                .retry
                .evaluate(process.state_count(), "Suspend data flow", suspended);
            if self.apply(&mut process, outcome, Terminating)?.is_none() {
                return Ok(process);
            }
        }

        let reason = process.suspension_reason.clone();
        let event = Self::event_message(&process, reason.clone());
        let message = RemoteMessage::TransferSuspensionMessage(event);
        let result = self.collaborators.dispatcher.dispatch(message).await;
        let outcome = self
            .retry
            .evaluate(process.state_count(), "Send TransferSuspensionMessage", result);
        if self.apply(&mut process, outcome, Terminating)?.is_some() {
            process.transition_to(Suspended, self.now())?;
            if let Some(reason) = reason {
                process.core_mut().set_error_detail(reason);
            }
        }
        Ok(process)
    }

    async fn process_completing(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let message = RemoteMessage::TransferCompletionMessage(Self::event_message(&process, None));
        let result = self.collaborators.dispatcher.dispatch(message).await;
        let outcome = self
            .retry
            .evaluate(process.state_count(), "Send TransferCompletionMessage", result);
        if self.apply(&mut process, outcome, Terminating)?.is_some() {
            let target = if process.is_provider() {
                Deprovisioning
            } else {
                Completed
            };
            process.transition_to(target, self.now())?;
            info!(process_id = %process.id(), "Transfer completed");
        }
        Ok(process)
    }

    async fn process_terminating(self: Arc<Self>, mut process: TransferProcess) -> HandlerResult {
        let reason = process.termination_reason.clone();

        if process.is_provider() {
            let terminated = self
                .collaborators
                .data_flow_controller
                .terminate(process.id(), reason.as_deref())
                .await;
            let outcome = self
                .retry
                .evaluate(process.state_count(), "Terminate data flow", terminated);
            if self.apply(&mut process, outcome, Terminated)?.is_none() {
                return Ok(process);
            }
        }

        if !process.terminated_by_counter_party {
            let event = Self::event_message(&process, reason.clone());
            let message = RemoteMessage::TransferTerminationMessage(event);
            let result = self.collaborators.dispatcher.dispatch(message).await;
            let outcome = self.retry.evaluate(
                process.state_count(),
                "Send TransferTerminationMessage",
                result,
            );
            if self.apply(&mut process, outcome, Terminated)?.is_none() {
                return Ok(process);
            }
        }

        let target = if process.is_provider() {
            Deprovisioning
        } else {
            Terminated
        };
        process.transition_to(target, self.now())?;
        // Keep the termination reason on the terminal record
        if let Some(reason) = reason {
            process.core_mut().set_error_detail(reason);
        }
        info!(process_id = %process.id(), next_state = %target, "Transfer terminated");
        Ok(process)
    }

    fn deprovisioning_settled(&self, process: &mut TransferProcess) -> Result<(), EngineError> {
        let outstanding = process
            .resources
            .iter()
            .any(|r| r.state == ProvisionResourceState::DeprovisionRequested);
        let target = if outstanding {
            DeprovisioningRequested
        } else {
            Deprovisioned
        };
        process.transition_to(target, self.now())
    }

    async fn process_deprovisioning(
        self: Arc<Self>,
        mut process: TransferProcess,
    ) -> HandlerResult {
        let resources = process.resources_to_deprovision();
        if resources.is_empty() {
            self.deprovisioning_settled(&mut process)?;
            return Ok(process);
        }

        let policy = self
            .collaborators
            .policy_archive
            .find_policy_for_contract(&process.contract_id);
        let results = self
            .collaborators
            .provision_manager
            .deprovision(&resources, policy.as_ref())
            .await;

        let mut failures = Vec::new();
        let mut fatal = false;
        for (resource, result) in resources.iter().zip(results) {
            let Some(entry) = process.resource_by_provisioned_id_mut(&resource.id) else {
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
            self.deprovisioning_settled(&mut process)?;
            return Ok(process);
        }

        let failure = if fatal {
            ServiceFailure::fatal(failures.join("; "))
        } else {
            ServiceFailure::retry(failures.join("; "))
        };
        let outcome = self.retry.evaluate::<()>(
            process.state_count(),
            "Deprovisioning",
            Err(failure),
        );
        self.apply(&mut process, outcome, Deprovisioned)?;
        Ok(process)
    }
}
