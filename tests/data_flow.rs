//! Data flow state machine: provisioning, control plane notifications and ownership
//! recovery

mod common;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dataspace_connector::clock::{Clock, ManualClock};
use dataspace_connector::config::{DataPlaneConfig, StateMachineConfig};
use dataspace_connector::dataplane::{
    DataFlow, DataFlowObservable, DataFlowState, DataPlaneCollaborators, DataPlaneManager,
    StreamFailure, StreamResult, TransferProcessApiClient, TransferService, TransferServiceRegistry,
};
use dataspace_connector::spi::{
    DataAddress, DataFlowStartMessage, DeprovisionResponse, FlowType, Policy,
    ProvisionManagerImpl, ProvisionResourceState, ProvisionResponse, ProvisionedResource,
    Provisioner, ResourceDefinition, ResourceKind, ServiceFailure, StatusResult, TransferType,
};
use dataspace_connector::statemachine::{ExponentialWaitStrategy, StateMachine, StatefulEntity};
use dataspace_connector::store::InMemoryStore;

/// Control plane answering each notification from a queue of failures, then `Ok`
#[derive(Default)]
struct ScriptedControlPlane {
    provisioned: Mutex<VecDeque<ServiceFailure>>,
    completed: Mutex<VecDeque<ServiceFailure>>,
    failed: Mutex<VecDeque<ServiceFailure>>,
    failed_reasons: Mutex<Vec<String>>,
}

impl ScriptedControlPlane {
    fn failing_provisioned(failures: Vec<ServiceFailure>) -> Self {
        let plane = Self::default();
        plane.provisioned.lock().unwrap().extend(failures);
        plane
    }

    fn next(queue: &Mutex<VecDeque<ServiceFailure>>) -> StatusResult<()> {
        match queue.lock().unwrap().pop_front() {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl TransferProcessApiClient for ScriptedControlPlane {
    async fn provisioned(&self, _flow: &DataFlow) -> StatusResult<()> {
        Self::next(&self.provisioned)
    }

    async fn completed(&self, _flow: &DataFlow) -> StatusResult<()> {
        Self::next(&self.completed)
    }

    async fn failed(&self, _flow: &DataFlow, reason: &str) -> StatusResult<()> {
        self.failed_reasons.lock().unwrap().push(reason.to_string());
        Self::next(&self.failed)
    }
}

/// Provisions tokens at once; buckets fail on their first attempt
#[derive(Default)]
struct FlakyProvisioner {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl Provisioner for FlakyProvisioner {
    fn name(&self) -> &str {
        "flaky"
    }

    fn can_provision(&self, _kind: &ResourceKind) -> bool {
        true
    }

    async fn provision(
        &self,
        definition: &ResourceDefinition,
        _policy: Option<&Policy>,
    ) -> StatusResult<ProvisionResponse> {
        let first_bucket_attempt = {
            let mut calls = self.calls.lock().unwrap();
            calls.push(definition.id.clone());
            matches!(definition.kind, ResourceKind::ObjectStorage { .. })
                && calls.iter().filter(|id| **id == definition.id).count() == 1
        };
        if first_bucket_attempt {
            return Err(ServiceFailure::retry("bucket service timeout"));
        }
        Ok(ProvisionResponse::Provisioned(
            ProvisionedResource::for_definition(format!("{}-res", definition.id), definition),
        ))
    }

    async fn deprovision(
        &self,
        _resource: &ProvisionedResource,
        _policy: Option<&Policy>,
    ) -> StatusResult<DeprovisionResponse> {
        Ok(DeprovisionResponse::Deprovisioned)
    }
}

/// Push transfer that never finishes on its own
#[derive(Default)]
struct EndlessTransfer {
    started: AtomicUsize,
}

#[async_trait]
impl TransferService for EndlessTransfer {
    fn name(&self) -> &str {
        "endless"
    }

    fn can_handle(&self, _source_type: &str, _destination_type: &str) -> bool {
        true
    }

    fn validate(&self, _request: &DataFlowStartMessage) -> StreamResult<()> {
        Ok(())
    }

    async fn transfer(&self, _request: DataFlowStartMessage) -> StreamResult<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn terminate(&self, _flow: &DataFlow) -> StreamResult<()> {
        Ok(())
    }
}

fn start_message(id: &str, flow_type: FlowType) -> DataFlowStartMessage {
    DataFlowStartMessage {
        process_id: id.to_string(),
        asset_id: "asset-1".into(),
        agreement_id: "contract-1".into(),
        participant_id: "consumer".into(),
        source: DataAddress::new("File").with_property("path", "/data/in.csv"),
        destination: Some(DataAddress::new("File").with_property("path", "/data/out.csv")),
        transfer_type: TransferType::new("File", flow_type),
        callback_address: None,
        properties: BTreeMap::new(),
        resource_definitions: Vec::new(),
    }
}

fn data_plane_config() -> DataPlaneConfig {
    let mut config = DataPlaneConfig::default();
    config.retry.base_delay_ms = 0;
    config.retry.limit = 1;
    config
}

fn store(clock: &Arc<ManualClock>) -> Arc<InMemoryStore<DataFlow>> {
    Arc::new(InMemoryStore::new(
        "runtime-a",
        Duration::from_secs(60),
        clock.clone(),
    ))
}

fn manager(
    runtime_id: &str,
    store: Arc<InMemoryStore<DataFlow>>,
    clock: Arc<dyn Clock>,
    provision_manager: ProvisionManagerImpl,
    transfer_services: TransferServiceRegistry,
    control_plane: Arc<ScriptedControlPlane>,
) -> Arc<DataPlaneManager> {
    Arc::new(DataPlaneManager::new(
        store,
        Arc::new(DataFlowObservable::new()),
        DataPlaneCollaborators {
            transfer_services: Arc::new(transfer_services),
            provision_manager: Arc::new(provision_manager),
            control_plane,
        },
        data_plane_config(),
        runtime_id,
        clock,
    ))
}

fn machine(manager: &Arc<DataPlaneManager>) -> StateMachine {
    let config = StateMachineConfig::default();
    manager.state_machine(&config, ExponentialWaitStrategy::factory(&config))
}

#[tokio::test]
async fn test_partial_provisioning_reaches_provision_notifying() {
    let clock = Arc::new(ManualClock::new(1_000));
    let provisioner = Arc::new(FlakyProvisioner::default());
    let mut provisioners = ProvisionManagerImpl::new();
    provisioners.register(provisioner.clone());
    let manager = manager(
        "runtime-a",
        store(&clock),
        clock,
        provisioners,
        TransferServiceRegistry::new(),
        Arc::new(ScriptedControlPlane::failing_provisioned(vec![
            ServiceFailure::retry("control plane unavailable"),
        ])),
    );

    let mut message = start_message("df-1", FlowType::Pull);
    message.resource_definitions = vec![
        ResourceDefinition::new("def-1", "df-1", ResourceKind::AccessToken { scope: "read".into() }),
        ResourceDefinition::new(
            "def-2",
            "df-1",
            ResourceKind::ObjectStorage {
                bucket: "exchange".into(),
                region: None,
            },
        ),
    ];
    let response = manager.start(message).await.unwrap();
    assert!(response.provisioning);
    assert!(response.data_address.is_none());

    let machine = machine(&manager);
    machine.run_once().await;

    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Provisioning);
    let states: Vec<_> = flow.resources.iter().map(|r| r.state).collect();
    assert_eq!(
        states,
        vec![ProvisionResourceState::Provisioned, ProvisionResourceState::Created]
    );
    assert_eq!(flow.resources[1].attempts, 1);

    machine.run_once().await;

    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::ProvisionNotifying);
    assert_eq!(flow.state_count(), 1);
    assert!(flow.error_detail().unwrap().contains("control plane unavailable"));
    assert!(
        flow.resources
            .iter()
            .all(|r| r.state == ProvisionResourceState::Provisioned)
    );
    // The already provisioned token is not provisioned again
    assert_eq!(
        *provisioner.calls.lock().unwrap(),
        vec!["def-1".to_string(), "def-2".to_string(), "def-2".to_string()]
    );
}

#[tokio::test]
async fn test_stale_push_flow_moves_to_new_owner() {
    let clock = Arc::new(ManualClock::new(1_000));
    let store_a = store(&clock);
    let store_b = Arc::new(store_a.for_lessor("runtime-b"));

    let transfers = Arc::new(EndlessTransfer::default());
    let registry = || {
        let mut registry = TransferServiceRegistry::new();
        registry.register(transfers.clone());
        registry
    };
    let manager_a = manager(
        "runtime-a",
        store_a,
        clock.clone(),
        ProvisionManagerImpl::new(),
        registry(),
        Arc::new(ScriptedControlPlane::default()),
    );
    let manager_b = manager(
        "runtime-b",
        store_b,
        clock.clone(),
        ProvisionManagerImpl::new(),
        registry(),
        Arc::new(ScriptedControlPlane::default()),
    );

    manager_a
        .start(start_message("df-1", FlowType::Push))
        .await
        .unwrap();
    machine(&manager_a).run_once().await;
    let flow = manager_a.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Started);
    assert_eq!(flow.owner(), Some("runtime-a"));

    // runtime-a stops refreshing its flow
    let machine_b = machine(&manager_b);
    clock.advance(Duration::from_secs(30));
    machine_b.run_once().await;
    assert_eq!(
        manager_b.find_by_id("df-1").await.unwrap().unwrap().owner(),
        Some("runtime-a")
    );

    clock.advance(Duration::from_secs(31));
    machine_b.run_once().await;
    let flow = manager_b.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Received);
    assert_eq!(flow.owner(), Some("runtime-b"));

    machine_b.run_once().await;
    let flow = manager_b.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Started);
    assert_eq!(flow.owner(), Some("runtime-b"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(transfers.started.load(Ordering::SeqCst), 2);
}

fn token_definition(flow_id: &str) -> ResourceDefinition {
    ResourceDefinition::new(
        format!("{flow_id}-token"),
        flow_id,
        ResourceKind::AccessToken { scope: "read".into() },
    )
}

#[tokio::test]
async fn test_provisioned_notification_gives_up_after_retries() {
    let clock = Arc::new(ManualClock::new(1_000));
    let mut provisioners = ProvisionManagerImpl::new();
    provisioners.register(Arc::new(FlakyProvisioner::default()));
    let control_plane = Arc::new(ScriptedControlPlane::failing_provisioned(vec![
        ServiceFailure::retry("control plane unavailable"),
        ServiceFailure::retry("control plane unavailable"),
    ]));
    let manager = manager(
        "runtime-a",
        store(&clock),
        clock,
        provisioners,
        TransferServiceRegistry::new(),
        control_plane.clone(),
    );

    let mut message = start_message("df-1", FlowType::Pull);
    message.resource_definitions = vec![token_definition("df-1")];
    manager.start(message).await.unwrap();
    let machine = machine(&manager);

    machine.run_once().await;
    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::ProvisionNotifying);
    assert_eq!(flow.state_count(), 1);

    // Retries exhausted: FAILED, and the failure is reported in the same pass
    machine.run_once().await;
    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Notified);
    let reasons = control_plane.failed_reasons.lock().unwrap().clone();
    assert_eq!(reasons.len(), 1);
    assert!(reasons[0].starts_with("Notify provisioned: retry limit of 1 exceeded"));
    assert_eq!(flow.error_detail(), Some(reasons[0].as_str()));
}

#[tokio::test]
async fn test_completed_notification_retries_then_fails() {
    let clock = Arc::new(ManualClock::new(1_000));
    let control_plane = Arc::new(ScriptedControlPlane::default());
    control_plane.completed.lock().unwrap().extend([
        ServiceFailure::retry("control plane busy"),
        ServiceFailure::fatal("unknown transfer process"),
    ]);
    let manager = manager(
        "runtime-a",
        store(&clock),
        clock,
        ProvisionManagerImpl::new(),
        TransferServiceRegistry::new(),
        control_plane.clone(),
    );
    manager
        .start(start_message("df-1", FlowType::Pull))
        .await
        .unwrap();
    let machine = machine(&manager);
    machine.run_once().await;
    manager.on_transfer_finished("df-1", Ok(())).await;

    machine.run_once().await;
    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Completed);
    assert_eq!(flow.state_count(), 1);
    assert_eq!(flow.error_detail(), Some("Notify completed: control plane busy"));

    machine.run_once().await;
    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Notified);
    assert_eq!(
        *control_plane.failed_reasons.lock().unwrap(),
        vec!["Notify completed: fatal error: unknown transfer process".to_string()]
    );
}

#[tokio::test]
async fn test_failure_reason_survives_notify_retry() {
    let clock = Arc::new(ManualClock::new(1_000));
    let control_plane = Arc::new(ScriptedControlPlane::default());
    control_plane
        .failed
        .lock()
        .unwrap()
        .push_back(ServiceFailure::retry("timeout"));
    let manager = manager(
        "runtime-a",
        store(&clock),
        clock,
        ProvisionManagerImpl::new(),
        TransferServiceRegistry::new(),
        control_plane.clone(),
    );
    manager
        .start(start_message("df-1", FlowType::Pull))
        .await
        .unwrap();
    let machine = machine(&manager);
    machine.run_once().await;
    manager
        .on_transfer_finished("df-1", Err(StreamFailure::General("disk full".into())))
        .await;

    machine.run_once().await;
    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Failed);
    assert_eq!(flow.error_detail(), Some("Notify failed: timeout"));
    assert_eq!(flow.failure_reason.as_deref(), Some("disk full"));

    machine.run_once().await;
    let flow = manager.find_by_id("df-1").await.unwrap().unwrap();
    assert_eq!(flow.state(), DataFlowState::Notified);
    assert_eq!(flow.error_detail(), Some("disk full"));
    assert_eq!(
        *control_plane.failed_reasons.lock().unwrap(),
        vec!["disk full".to_string(), "disk full".to_string()]
    );
}
