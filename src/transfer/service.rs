//! Transfer Process Commands
//!
//! External entry points (API calls, protocol messages, provisioner and data plane
//! callbacks). Every command leases the process with `find_by_id_and_lease`, applies one
//! mutation and saves; a process currently held by a worker or another command yields
//! [`TransferProcessError::Conflict`] and is left untouched.

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::error::TransferProcessError;
use super::listener::{TransferProcessObservable, notify};
use super::process::{TransferProcess, TransferRequest};
use super::state::TransferProcessState;
use crate::clock::Clock;
use crate::spi::{DataAddress, ProvisionedResource, TransferRequestMessage, TransferType};
use crate::statemachine::{EntityState, StatefulEntity};
use crate::store::{Criteria, LeasedStore, StoreError};

use TransferProcessState::*;

pub struct TransferProcessService {
    store: Arc<dyn LeasedStore<TransferProcess>>,
    observable: Arc<TransferProcessObservable>,
    clock: Arc<dyn Clock>,
}

fn require(
    process: &TransferProcess,
    action: &'static str,
    allowed: &[TransferProcessState],
) -> Result<(), TransferProcessError> {
    if allowed.contains(&process.state()) {
        Ok(())
    } else {
        Err(TransferProcessError::InvalidState {
            id: process.id().to_string(),
            action,
            state: process.state().name(),
        })
    }
}

fn validate_request(request: &TransferRequest) -> Result<(), TransferProcessError> {
    if request.counter_party_address.is_empty() {
        return Err(TransferProcessError::InvalidRequest(
            "counterPartyAddress is required".to_string(),
        ));
    }
    if request.contract_id.is_empty() {
        return Err(TransferProcessError::InvalidRequest(
            "contractId is required".to_string(),
        ));
    }
    request
        .transfer_type
        .parse::<TransferType>()
        .map_err(TransferProcessError::InvalidRequest)?;
    Ok(())
}

pub(crate) fn new_process_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

impl TransferProcessService {
    pub fn new(
        store: Arc<dyn LeasedStore<TransferProcess>>,
        observable: Arc<TransferProcessObservable>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            observable,
            clock,
        }
    }

    pub async fn find_by_id(
        &self,
        id: &str,
    ) -> Result<Option<TransferProcess>, TransferProcessError> {
        Ok(self.store.find_by_id(id).await?)
    }

    pub async fn query(
        &self,
        criteria: &Criteria,
        limit: usize,
    ) -> Result<Vec<TransferProcess>, TransferProcessError> {
        Ok(self.store.query(criteria, limit).await?)
    }

    pub async fn transfer_state(
        &self,
        id: &str,
    ) -> Result<Option<TransferProcessState>, TransferProcessError> {
        Ok(self.store.find_by_id(id).await?.map(|p| p.state()))
    }

    /// Create a CONSUMER process in INITIAL; a known id returns the existing process
    pub async fn initiate_consumer(
        &self,
        request: TransferRequest,
    ) -> Result<TransferProcess, TransferProcessError> {
        validate_request(&request)?;
        let id = request.id.clone().unwrap_or_else(new_process_id);
        if let Some(existing) = self.store.find_by_id(&id).await? {
            debug!(process_id = %id, "Transfer already initiated");
            return Ok(existing);
        }

        let process = TransferProcess::consumer(id, request, self.clock.now_millis());
        self.insert(process).await
    }

    /// Provider side of a received TransferRequestMessage
    pub async fn notify_requested(
        &self,
        message: TransferRequestMessage,
    ) -> Result<TransferProcess, TransferProcessError> {
        let request = TransferRequest {
            id: None,
            protocol: message.protocol,
            counter_party_address: message.callback_address,
            contract_id: message.contract_id,
            asset_id: message.asset_id,
            transfer_type: message.transfer_type,
            data_destination: message.data_destination,
            ..TransferRequest::default()
        };
        validate_request(&request)?;

        let process = TransferProcess::provider(
            new_process_id(),
            message.process_id,
            request,
            self.clock.now_millis(),
        );
        self.insert(process).await
    }

    async fn insert(
        &self,
        process: TransferProcess,
    ) -> Result<TransferProcess, TransferProcessError> {
        match self.store.create(&process).await {
            Ok(()) => {}
            // Lost a race against a concurrent initiation with the same id
            Err(StoreError::AlreadyExists(id)) => {
                return self
                    .store
                    .find_by_id(&id)
                    .await?
                    .ok_or(TransferProcessError::NotFound(id));
            }
            Err(e) => return Err(e.into()),
        }
        info!(
            process_id = %process.id(),
            process_type = process.process_type.as_str(),
            contract_id = %process.contract_id,
            "Transfer process initiated"
        );
        self.observable
            .invoke_for_each(|listener| listener.initiated(&process));
        Ok(process)
    }

    /// Lease, mutate, save
    async fn mutate<F>(&self, id: &str, f: F) -> Result<TransferProcess, TransferProcessError>
    where
        F: FnOnce(&mut TransferProcess, i64) -> Result<(), TransferProcessError>,
    {
        let mut process = self.store.find_by_id_and_lease(id).await?;
        let previous = process.state();

        if let Err(e) = f(&mut process, self.clock.now_millis()) {
            if let Err(release) = self.store.break_lease(id).await {
                warn!(process_id = %id, error = %release, "Failed to break lease");
            }
            return Err(e);
        }

        self.store.save(&process).await?;
        notify(&self.observable, &process, previous);
        Ok(process)
    }

    /// Consumer: the provider started the transfer
    pub async fn notify_started(
        &self,
        id: &str,
        data_address: Option<DataAddress>,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            if !process.is_consumer() {
                return Err(TransferProcessError::InvalidRequest(
                    "start message sent to a provider process".to_string(),
                ));
            }
            require(process, "started", &[Requested, Suspended, Started])?;
            if data_address.is_some() {
                process.content_data_address = data_address;
            }
            process.transition_to(Started, now)?;
            Ok(())
        })
        .await
    }

    /// The counterparty completed the transfer
    pub async fn notify_completed(
        &self,
        id: &str,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "completed", &[Started, Completing])?;
            let target = if process.is_provider() {
                Deprovisioning
            } else {
                Completed
            };
            process.transition_to(target, now)?;
            Ok(())
        })
        .await
    }

    pub async fn notify_suspended(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "suspended", &[Started])?;
            process.transition_to(Suspended, now)?;
            if let Some(reason) = &reason {
                process.core_mut().set_error_detail(reason.clone());
            }
            process.suspension_reason = reason;
            Ok(())
        })
        .await
    }

    /// The counterparty terminated the transfer
    pub async fn notify_terminated(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            if process.is_final() {
                return Err(TransferProcessError::InvalidState {
                    id: process.id().to_string(),
                    action: "terminated",
                    state: process.state().name(),
                });
            }
            let reason = reason.unwrap_or_else(|| "terminated by counter-party".to_string());
            if process.is_consumer() {
                process.give_up(Terminated, reason, now)?;
            } else {
                process.give_up(Terminating, reason, now)?;
                process.terminated_by_counter_party = true;
            }
            Ok(())
        })
        .await
    }

    pub async fn complete(&self, id: &str) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "completed", &[Started])?;
            process.transition_to(Completing, now)?;
            Ok(())
        })
        .await
    }

    pub async fn suspend(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "suspended", &[Started])?;
            process.transition_to(Suspending, now)?;
            process.suspension_reason = reason;
            Ok(())
        })
        .await
    }

    /// Provider only: restart a suspended transfer
    pub async fn resume(&self, id: &str) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            if !process.is_provider() {
                return Err(TransferProcessError::InvalidRequest(
                    "only the provider can resume a transfer".to_string(),
                ));
            }
            require(process, "resumed", &[Suspended])?;
            process.transition_to(Starting, now)?;
            Ok(())
        })
        .await
    }

    pub async fn terminate(
        &self,
        id: &str,
        reason: impl Into<String>,
    ) -> Result<TransferProcess, TransferProcessError> {
        let reason = reason.into();
        self.mutate(id, |process, now| {
            if !process.can_transition_to(Terminating) {
                return Err(TransferProcessError::InvalidState {
                    id: process.id().to_string(),
                    action: "terminated",
                    state: process.state().name(),
                });
            }
            process.give_up(Terminating, reason, now)?;
            Ok(())
        })
        .await
    }

    pub async fn deprovision(&self, id: &str) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "deprovisioned", &[Completed, Terminated])?;
            process.transition_to(Deprovisioning, now)?;
            Ok(())
        })
        .await
    }

    /// Asynchronous provisioner callback
    pub async fn provisioning_completed(
        &self,
        id: &str,
        definition_id: &str,
        resource: ProvisionedResource,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "provisioned", &[Provisioning, ProvisioningRequested])?;
            let entry = process.resource_mut(definition_id).ok_or_else(|| {
                TransferProcessError::InvalidRequest(format!(
                    "unknown resource definition {definition_id}"
                ))
            })?;
            entry.mark_provisioned(resource);

            if process.state() == ProvisioningRequested && process.all_provisioned() {
                process.transition_to(Provisioned, now)?;
            }
            Ok(())
        })
        .await
    }

    /// Asynchronous deprovisioner callback
    pub async fn deprovisioning_completed(
        &self,
        id: &str,
        resource_id: &str,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "deprovisioned", &[Deprovisioning, DeprovisioningRequested])?;
            let entry = process.resource_by_provisioned_id_mut(resource_id).ok_or_else(|| {
                TransferProcessError::InvalidRequest(format!("unknown resource {resource_id}"))
            })?;
            entry.mark_deprovisioned();

            if process.state() == DeprovisioningRequested && process.all_deprovisioned() {
                process.transition_to(Deprovisioned, now)?;
            }
            Ok(())
        })
        .await
    }

    /// Data plane finished provisioning: wake the parked STARTING process
    pub async fn on_data_flow_provisioned(
        &self,
        id: &str,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, _now| {
            require(process, "started", &[Starting])?;
            // Not a retry: the state count and its backoff stay as they are
            process.core_mut().set_pending(false);
            Ok(())
        })
        .await
    }

    /// Data plane finished a push transfer
    pub async fn on_data_flow_completed(
        &self,
        id: &str,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "completed", &[Started])?;
            process.transition_to(Completing, now)?;
            Ok(())
        })
        .await
    }

    pub async fn on_data_flow_failed(
        &self,
        id: &str,
        reason: Option<String>,
    ) -> Result<TransferProcess, TransferProcessError> {
        self.mutate(id, |process, now| {
            require(process, "failed", &[Starting, Started])?;
            let reason = reason.unwrap_or_else(|| "data flow failed".to_string());
            process.give_up(Terminating, reason, now)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::spi::{ProvisionResourceState, ResourceDefinition, ResourceKind};
    use crate::store::InMemoryStore;
    use crate::transfer::process::tests::request;
    use std::time::Duration;

    struct Fixture {
        store: Arc<InMemoryStore<TransferProcess>>,
        service: TransferProcessService,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryStore::new(
            "runtime-a",
            Duration::from_secs(60),
            clock.clone(),
        ));
        let service = TransferProcessService::new(
            store.clone(),
            Arc::new(TransferProcessObservable::new()),
            clock.clone(),
        );
        Fixture {
            store,
            service,
            clock,
        }
    }

    /// Force a stored process into `state`, bypassing the processors
    async fn force(fixture: &Fixture, id: &str, state: TransferProcessState) {
        let mut process = fixture.store.find_by_id_and_lease(id).await.unwrap();
        let from = process.state();
        process
            .core_mut()
            .transition(state, &[from], fixture.clock.now_millis())
            .unwrap();
        fixture.store.save(&process).await.unwrap();
    }

    #[tokio::test]
    async fn test_initiate_consumer_is_idempotent() {
        let f = fixture();
        let mut req = request();
        req.id = Some("tp-1".into());

        let first = f.service.initiate_consumer(req.clone()).await.unwrap();
        assert_eq!(first.state(), Initial);
        assert!(first.is_consumer());

        force(&f, "tp-1", Provisioning).await;
        let second = f.service.initiate_consumer(req).await.unwrap();
        assert_eq!(second.state(), Provisioning);
    }

    #[tokio::test]
    async fn test_initiate_rejects_bad_transfer_type() {
        let f = fixture();
        let mut req = request();
        req.transfer_type = "HttpData".into();
        assert!(matches!(
            f.service.initiate_consumer(req).await,
            Err(TransferProcessError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_notify_requested_creates_provider() {
        let f = fixture();
        let message = TransferRequestMessage {
            process_id: "consumer-tp".into(),
            protocol: "dataspace-protocol-http".into(),
            counter_party_address: "http://provider/protocol".into(),
            callback_address: "http://consumer/protocol".into(),
            contract_id: "contract-1".into(),
            asset_id: "asset-1".into(),
            transfer_type: "HttpData-PUSH".into(),
            data_destination: None,
        };
        let process = f.service.notify_requested(message).await.unwrap();
        assert!(process.is_provider());
        assert_eq!(process.correlation_id.as_deref(), Some("consumer-tp"));
        assert_eq!(process.counter_party_address, "http://consumer/protocol");
    }

    #[tokio::test]
    async fn test_command_on_leased_process_conflicts() {
        let f = fixture();
        let process = f.service.initiate_consumer(request()).await.unwrap();
        force(&f, process.id(), Started).await;

        // A worker holds the lease
        f.store.find_by_id_and_lease(process.id()).await.unwrap();
        assert_eq!(
            f.service.complete(process.id()).await.unwrap_err(),
            TransferProcessError::Conflict(process.id().to_string())
        );

        let stored = f.service.find_by_id(process.id()).await.unwrap().unwrap();
        assert_eq!(stored.state(), Started);
    }

    #[tokio::test]
    async fn test_invalid_command_releases_lease() {
        let f = fixture();
        let process = f.service.initiate_consumer(request()).await.unwrap();

        assert!(matches!(
            f.service.complete(process.id()).await,
            Err(TransferProcessError::InvalidState { action: "completed", .. })
        ));
        assert_eq!(f.store.lease_holder(process.id()), None);
    }

    #[tokio::test]
    async fn test_received_termination() {
        let f = fixture();
        let consumer = f.service.initiate_consumer(request()).await.unwrap();
        force(&f, consumer.id(), Requested).await;
        let consumer = f
            .service
            .notify_terminated(consumer.id(), Some("policy violation".into()))
            .await
            .unwrap();
        assert_eq!(consumer.state(), Terminated);
        assert_eq!(consumer.error_detail(), Some("policy violation"));

        let provider = f
            .service
            .notify_requested(TransferRequestMessage {
                process_id: "c".into(),
                protocol: "p".into(),
                counter_party_address: "a".into(),
                callback_address: "b".into(),
                contract_id: "contract-1".into(),
                asset_id: "asset-1".into(),
                transfer_type: "HttpData-PUSH".into(),
                data_destination: None,
            })
            .await
            .unwrap();
        force(&f, provider.id(), Started).await;
        let provider = f.service.notify_terminated(provider.id(), None).await.unwrap();
        assert_eq!(provider.state(), Terminating);
        assert!(provider.terminated_by_counter_party);
    }

    #[tokio::test]
    async fn test_received_completion_by_side() {
        let f = fixture();
        let consumer = f.service.initiate_consumer(request()).await.unwrap();
        force(&f, consumer.id(), Started).await;
        let consumer = f.service.notify_completed(consumer.id()).await.unwrap();
        assert_eq!(consumer.state(), Completed);

        let deprovisioning = f.service.deprovision(consumer.id()).await.unwrap();
        assert_eq!(deprovisioning.state(), Deprovisioning);
    }

    #[tokio::test]
    async fn test_consumer_cannot_resume() {
        let f = fixture();
        let consumer = f.service.initiate_consumer(request()).await.unwrap();
        force(&f, consumer.id(), Suspended).await;
        assert!(matches!(
            f.service.resume(consumer.id()).await,
            Err(TransferProcessError::InvalidRequest(_))
        ));
        let started = f.service.notify_started(consumer.id(), None).await.unwrap();
        assert_eq!(started.state(), Started);
    }

    #[tokio::test]
    async fn test_provisioning_callback_settles_last_resource() {
        let f = fixture();
        let process = f.service.initiate_consumer(request()).await.unwrap();

        let mut leased = f.store.find_by_id_and_lease(process.id()).await.unwrap();
        let definition = ResourceDefinition::new(
            "def-1",
            process.id(),
            ResourceKind::HttpEndpoint { url: "u".into() },
        );
        leased.set_manifest(vec![definition.clone()]);
        leased.transition_to(Provisioning, 2_000).unwrap();
        leased.resource_mut("def-1").unwrap().mark_provision_requested();
        leased.transition_to(ProvisioningRequested, 2_000).unwrap();
        f.store.save(&leased).await.unwrap();

        let settled = f
            .service
            .provisioning_completed(
                process.id(),
                "def-1",
                ProvisionedResource::for_definition("res-1", &definition),
            )
            .await
            .unwrap();
        assert_eq!(settled.state(), Provisioned);
        assert_eq!(settled.resources[0].state, ProvisionResourceState::Provisioned);

        assert!(matches!(
            f.service
                .provisioning_completed(
                    process.id(),
                    "def-1",
                    ProvisionedResource::for_definition("res-1", &definition),
                )
                .await,
            Err(TransferProcessError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_data_plane_provisioned_wakes_without_retry() {
        let f = fixture();
        let provider = f
            .service
            .notify_requested(TransferRequestMessage {
                process_id: "c".into(),
                protocol: "p".into(),
                counter_party_address: "a".into(),
                callback_address: "b".into(),
                contract_id: "contract-1".into(),
                asset_id: "asset-1".into(),
                transfer_type: "HttpData-PULL".into(),
                data_destination: None,
            })
            .await
            .unwrap();
        force(&f, provider.id(), Starting).await;

        // One earlier start attempt failed, then the process was parked
        let mut parked = f.store.find_by_id_and_lease(provider.id()).await.unwrap();
        parked.retry("Start data flow: timeout", 2_000);
        parked.core_mut().set_pending(true);
        f.store.save(&parked).await.unwrap();

        let woken = f.service.on_data_flow_provisioned(provider.id()).await.unwrap();
        assert_eq!(woken.state(), Starting);
        assert!(!woken.is_pending());
        assert_eq!(woken.state_count(), 1);
        assert_eq!(woken.state_timestamp(), 2_000);
        assert_eq!(f.store.lease_holder(provider.id()), None);
    }
}
