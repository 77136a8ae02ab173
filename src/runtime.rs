//! Connector runtime
//!
//! Wires the transfer process (control plane) and data flow (data plane) state
//! machines of one runtime from [`AppConfig`]:
//!
//! ```text
//!  TransferProcessService ◀── EmbeddedControlPlaneClient ──┐
//!          │                                              │
//!  TransferProcessManager ── EmbeddedDataFlowController ─▶ DataPlaneManager
//!          │                                              │
//!  LeasedStore<TransferProcess>                  LeasedStore<DataFlow>
//! ```
//!
//! Stores are PostgreSQL when `postgres_url` is configured, in-memory otherwise. Data
//! plane callbacks go over HTTP when `data_plane.control_plane_url` is set.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::adapters::{
    EmbeddedControlPlaneClient, EmbeddedDataFlowController, FileTransferService,
    HttpControlPlaneClient, HttpRemoteMessageDispatcher,
};
use crate::clock::{Clock, SystemClock};
use crate::config::AppConfig;
use crate::dataplane::{
    DataFlow, DataFlowObservable, DataPlaneCollaborators, DataPlaneManager,
    TransferProcessApiClient, TransferService, TransferServiceRegistry,
};
use crate::spi::{
    InMemoryAssetIndex, InMemoryPolicyArchive, ProvisionManagerImpl, Provisioner,
    RemoteMessageDispatcher, ResourceDefinitionGenerator, TypeManifestGenerator,
};
use crate::statemachine::{
    ExponentialWaitStrategy, SharedPendingGuard, StateMachine, StateMachineHandle,
    TransitionCounter,
};
use crate::store::{InMemoryStore, LeasedStore, PgStore};
use crate::transfer::{
    TransferProcess, TransferProcessCollaborators, TransferProcessManager,
    TransferProcessObservable, TransferProcessService,
};

/// The two entity stores of a runtime
#[derive(Clone)]
pub struct Stores {
    pub transfer_processes: Arc<dyn LeasedStore<TransferProcess>>,
    pub data_flows: Arc<dyn LeasedStore<DataFlow>>,
}

impl Stores {
    pub fn in_memory(config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let lease = config.state_machine.lease_duration();
        Self {
            transfer_processes: Arc::new(InMemoryStore::new(
                config.runtime_id.clone(),
                lease,
                Arc::clone(&clock),
            )),
            data_flows: Arc::new(InMemoryStore::new(config.runtime_id.clone(), lease, clock)),
        }
    }

    pub async fn postgres(
        url: &str,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        info!("PostgreSQL connection pool established");

        let lease = config.state_machine.lease_duration();
        let transfer_processes = PgStore::<TransferProcess>::new(
            pool.clone(),
            config.runtime_id.clone(),
            lease,
            Arc::clone(&clock),
        );
        transfer_processes.migrate().await?;
        let data_flows = PgStore::<DataFlow>::new(pool, config.runtime_id.clone(), lease, clock);
        data_flows.migrate().await?;

        Ok(Self {
            transfer_processes: Arc::new(transfer_processes),
            data_flows: Arc::new(data_flows),
        })
    }
}

/// Assembles a [`ConnectorRuntime`]; unset parts fall back to the production adapters
pub struct RuntimeBuilder {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    stores: Option<Stores>,
    dispatcher: Option<Arc<dyn RemoteMessageDispatcher>>,
    control_plane_provisioners: ProvisionManagerImpl,
    data_plane_provisioners: ProvisionManagerImpl,
    manifest_generator: TypeManifestGenerator,
    transfer_services: TransferServiceRegistry,
    pending_guard: Option<SharedPendingGuard<TransferProcess>>,
}

impl RuntimeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            stores: None,
            dispatcher: None,
            control_plane_provisioners: ProvisionManagerImpl::new(),
            data_plane_provisioners: ProvisionManagerImpl::new(),
            manifest_generator: TypeManifestGenerator::new(),
            transfer_services: TransferServiceRegistry::new(),
            pending_guard: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn stores(mut self, stores: Stores) -> Self {
        self.stores = Some(stores);
        self
    }

    pub fn dispatcher(mut self, dispatcher: Arc<dyn RemoteMessageDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn control_plane_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.control_plane_provisioners.register(provisioner);
        self
    }

    pub fn data_plane_provisioner(mut self, provisioner: Arc<dyn Provisioner>) -> Self {
        self.data_plane_provisioners.register(provisioner);
        self
    }

    pub fn consumer_generator(mut self, generator: Arc<dyn ResourceDefinitionGenerator>) -> Self {
        self.manifest_generator.register_consumer(generator);
        self
    }

    pub fn provider_generator(mut self, generator: Arc<dyn ResourceDefinitionGenerator>) -> Self {
        self.manifest_generator.register_provider(generator);
        self
    }

    /// Resources provisioned by the data plane before a provider's flow starts
    pub fn data_plane_generator(mut self, generator: Arc<dyn ResourceDefinitionGenerator>) -> Self {
        self.manifest_generator.register_data_plane(generator);
        self
    }

    /// Parks matching transfer processes until a command moves them on
    pub fn pending_guard(mut self, guard: SharedPendingGuard<TransferProcess>) -> Self {
        self.pending_guard = Some(guard);
        self
    }

    /// Registered ahead of the built-in file service
    pub fn transfer_service(mut self, service: Arc<dyn TransferService>) -> Self {
        self.transfer_services.register(service);
        self
    }

    pub async fn build(self) -> anyhow::Result<ConnectorRuntime> {
        let RuntimeBuilder {
            config,
            clock,
            stores,
            dispatcher,
            control_plane_provisioners,
            data_plane_provisioners,
            manifest_generator,
            mut transfer_services,
            pending_guard,
        } = self;

        let stores = match (stores, config.postgres_url.as_deref()) {
            (Some(stores), _) => stores,
            (None, Some(url)) => Stores::postgres(url, &config, Arc::clone(&clock)).await?,
            (None, None) => Stores::in_memory(&config, Arc::clone(&clock)),
        };
        let dispatcher: Arc<dyn RemoteMessageDispatcher> = match dispatcher {
            Some(dispatcher) => dispatcher,
            None => Arc::new(
                HttpRemoteMessageDispatcher::new().context("Failed to build HTTP client")?,
            ),
        };
        transfer_services.register(Arc::new(FileTransferService::new()));

        let transitions = Arc::new(TransitionCounter::new());
        let transfer_observable = Arc::new(TransferProcessObservable::new());
        transfer_observable.register(transitions.clone());
        let flow_observable = Arc::new(DataFlowObservable::new());
        flow_observable.register(transitions.clone());

        let transfer_processes = Arc::new(TransferProcessService::new(
            Arc::clone(&stores.transfer_processes),
            Arc::clone(&transfer_observable),
            Arc::clone(&clock),
        ));

        let control_plane: Arc<dyn TransferProcessApiClient> =
            match &config.data_plane.control_plane_url {
                Some(url) => Arc::new(
                    HttpControlPlaneClient::new(Some(url.clone()))
                        .context("Failed to build HTTP client")?,
                ),
                None => Arc::new(EmbeddedControlPlaneClient::new(Arc::clone(
                    &transfer_processes,
                ))),
            };
        let data_plane = Arc::new(DataPlaneManager::new(
            Arc::clone(&stores.data_flows),
            flow_observable,
            DataPlaneCollaborators {
                transfer_services: Arc::new(transfer_services),
                provision_manager: Arc::new(data_plane_provisioners),
                control_plane,
            },
            config.data_plane.clone(),
            config.runtime_id.clone(),
            Arc::clone(&clock),
        ));

        let policy_archive: InMemoryPolicyArchive = config
            .policies
            .iter()
            .map(|(id, policy)| (id.clone(), policy.clone()))
            .collect();
        let asset_index: InMemoryAssetIndex = config
            .assets
            .iter()
            .map(|(id, address)| (id.clone(), address.clone()))
            .collect();
        let mut transfer_manager = TransferProcessManager::new(
            Arc::clone(&stores.transfer_processes),
            transfer_observable,
            TransferProcessCollaborators {
                dispatcher,
                provision_manager: Arc::new(control_plane_provisioners),
                policy_archive: Arc::new(policy_archive),
                address_resolver: Arc::new(asset_index),
                manifest_generator: Arc::new(manifest_generator),
                data_flow_controller: Arc::new(EmbeddedDataFlowController::new(Arc::clone(
                    &data_plane,
                ))),
            },
            config.transfer_process.clone(),
            config.participant_id.clone(),
            clock,
        );
        if let Some(guard) = pending_guard {
            transfer_manager = transfer_manager.with_pending_guard(guard);
        }
        let transfer_manager = Arc::new(transfer_manager);

        info!(
            runtime_id = %config.runtime_id,
            participant_id = %config.participant_id,
            postgres = config.postgres_url.is_some(),
            "Connector runtime assembled"
        );
        Ok(ConnectorRuntime {
            config,
            transfer_processes,
            transfer_manager,
            data_plane,
            transitions,
        })
    }
}

pub struct ConnectorRuntime {
    config: AppConfig,
    transfer_processes: Arc<TransferProcessService>,
    transfer_manager: Arc<TransferProcessManager>,
    data_plane: Arc<DataPlaneManager>,
    transitions: Arc<TransitionCounter>,
}

impl ConnectorRuntime {
    pub fn builder(config: AppConfig) -> RuntimeBuilder {
        RuntimeBuilder::new(config)
    }

    pub fn runtime_id(&self) -> &str {
        &self.config.runtime_id
    }

    /// Command surface of the control plane
    pub fn transfer_processes(&self) -> &Arc<TransferProcessService> {
        &self.transfer_processes
    }

    /// Command surface of the data plane
    pub fn data_plane(&self) -> &Arc<DataPlaneManager> {
        &self.data_plane
    }

    pub fn transitions(&self) -> &Arc<TransitionCounter> {
        &self.transitions
    }

    /// (transfer process, data flow) state machines, not yet started
    pub fn state_machines(&self) -> (StateMachine, StateMachine) {
        let sm = &self.config.state_machine;
        (
            self.transfer_manager
                .state_machine(sm, ExponentialWaitStrategy::factory(sm)),
            self.data_plane
                .state_machine(sm, ExponentialWaitStrategy::factory(sm)),
        )
    }

    pub fn start(&self) -> RunningConnector {
        let (transfer, data_flow) = self.state_machines();
        info!(runtime_id = %self.config.runtime_id, "Starting connector state machines");
        RunningConnector {
            transfer: transfer.start(),
            data_flow: data_flow.start(),
        }
    }
}

pub struct RunningConnector {
    transfer: StateMachineHandle,
    data_flow: StateMachineHandle,
}

impl RunningConnector {
    /// Stop both loops; in-flight batches complete first
    pub async fn stop(self) {
        self.transfer.stop().await;
        self.data_flow.stop().await;
    }
}
