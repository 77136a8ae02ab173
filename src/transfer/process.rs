//! Transfer Process entity
//!
//! One transfer of an asset under a contract agreement, seen from one side. The
//! consumer and the provider each keep their own process; `correlation_id` links it to
//! the counterparty's.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::state::TransferProcessState;
use crate::spi::{
    DataAddress, ProvisionResource, ProvisionResourceState, ProvisionedResource,
    ResourceDefinition,
};
use crate::statemachine::{EngineError, EntityCore, EntityState, StatefulEntity};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferProcessType {
    Consumer,
    Provider,
}

impl TransferProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferProcessType::Consumer => "CONSUMER",
            TransferProcessType::Provider => "PROVIDER",
        }
    }
}

/// Endpoint notified about process events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackAddress {
    pub uri: String,
    /// Event name prefixes, e.g. `transfer.process.started`
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub transactional: bool,
}

/// Consumer-side request to start a transfer
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Caller-provided id; makes initiation idempotent
    #[serde(default)]
    pub id: Option<String>,
    pub protocol: String,
    pub counter_party_address: String,
    pub contract_id: String,
    pub asset_id: String,
    pub transfer_type: String,
    #[serde(default)]
    pub data_destination: Option<DataAddress>,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
    #[serde(default)]
    pub private_properties: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcess {
    #[serde(flatten)]
    core: EntityCore<TransferProcessState>,
    #[serde(rename = "type")]
    pub process_type: TransferProcessType,
    /// Counterparty's process id
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub counter_party_address: String,
    pub protocol: String,
    pub contract_id: String,
    pub asset_id: String,
    pub transfer_type: String,
    #[serde(default)]
    pub data_destination: Option<DataAddress>,
    /// Provider: resolved asset address. Consumer: pull endpoint from the start message
    #[serde(default)]
    pub content_data_address: Option<DataAddress>,
    #[serde(default)]
    pub resources: Vec<ProvisionResource>,
    #[serde(default)]
    pub callback_addresses: Vec<CallbackAddress>,
    #[serde(default)]
    pub private_properties: BTreeMap<String, String>,
    /// Termination came from the counterparty; no termination message is sent back
    #[serde(default)]
    pub terminated_by_counter_party: bool,
    /// Why the process is terminating; the first cause wins and retries keep it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<String>,
    /// Reason carried by the suspension message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension_reason: Option<String>,
}

use TransferProcessState::*;

const NON_FINAL: &[TransferProcessState] = &[
    Initial,
    Provisioning,
    ProvisioningRequested,
    Provisioned,
    Requesting,
    Requested,
    Starting,
    Started,
    Suspending,
    Suspended,
    Completing,
    Terminating,
    Deprovisioning,
    DeprovisioningRequested,
];

impl TransferProcess {
    pub fn consumer(id: impl Into<String>, request: TransferRequest, now: i64) -> Self {
        Self {
            core: EntityCore::new(id, Initial, now),
            process_type: TransferProcessType::Consumer,
            correlation_id: None,
            counter_party_address: request.counter_party_address,
            protocol: request.protocol,
            contract_id: request.contract_id,
            asset_id: request.asset_id,
            transfer_type: request.transfer_type,
            data_destination: request.data_destination,
            content_data_address: None,
            resources: Vec::new(),
            callback_addresses: request.callback_addresses,
            private_properties: request.private_properties,
            terminated_by_counter_party: false,
            termination_reason: None,
            suspension_reason: None,
        }
    }

    /// Provider process answering a consumer's transfer request
    pub fn provider(
        id: impl Into<String>,
        consumer_process_id: impl Into<String>,
        request: TransferRequest,
        now: i64,
    ) -> Self {
        Self {
            process_type: TransferProcessType::Provider,
            correlation_id: Some(consumer_process_id.into()),
            ..Self::consumer(id, request, now)
        }
    }

    pub fn is_consumer(&self) -> bool {
        self.process_type == TransferProcessType::Consumer
    }

    pub fn is_provider(&self) -> bool {
        self.process_type == TransferProcessType::Provider
    }

    /// Legal source states of a transition to `target` for this process type
    fn allowed_sources(&self, target: TransferProcessState) -> &'static [TransferProcessState] {
        let consumer = self.is_consumer();
        match target {
            Initial => &[],
            Provisioning => &[Initial],
            ProvisioningRequested => &[Provisioning],
            Provisioned => &[Provisioning, ProvisioningRequested],
            Requesting if consumer => &[Provisioned],
            Requested if consumer => &[Requesting],
            Requesting | Requested => &[],
            Starting if !consumer => &[Provisioned, Suspended],
            Starting => &[],
            Started if consumer => &[Requested, Suspended],
            Started => &[Starting],
            Suspending => &[Started],
            Suspended => &[Started, Suspending],
            Completing => &[Started],
            Completed => &[Started, Completing],
            Terminating => NON_FINAL,
            Terminated => NON_FINAL,
            Deprovisioning => &[Started, Completing, Completed, Terminating, Terminated],
            DeprovisioningRequested => &[Deprovisioning],
            Deprovisioned => &[Deprovisioning, DeprovisioningRequested],
        }
    }

    /// Guarded transition; a same-state request counts as a retry
    pub fn transition_to(
        &mut self,
        target: TransferProcessState,
        now: i64,
    ) -> Result<(), EngineError> {
        let allowed = self.allowed_sources(target);
        self.core.transition(target, allowed, now)
    }

    /// Move to a give-up state and record why
    pub fn give_up(
        &mut self,
        target: TransferProcessState,
        detail: impl Into<String>,
        now: i64,
    ) -> Result<(), EngineError> {
        self.transition_to(target, now)?;
        let detail = detail.into();
        if matches!(target, Terminating | Terminated) && self.termination_reason.is_none() {
            self.termination_reason = Some(detail.clone());
        }
        self.core.set_error_detail(detail);
        Ok(())
    }

    /// Stay in the current state for another attempt
    pub fn retry(&mut self, detail: impl Into<String>, now: i64) {
        self.core.retry(detail, now);
    }

    pub fn can_transition_to(&self, target: TransferProcessState) -> bool {
        self.core.can_transition(target, self.allowed_sources(target))
    }

    pub fn is_final(&self) -> bool {
        self.state().is_final()
    }

    /// Replace the resource list with a freshly generated manifest
    pub fn set_manifest(&mut self, definitions: Vec<ResourceDefinition>) {
        self.resources = definitions.into_iter().map(ProvisionResource::new).collect();
    }

    /// Definitions that have not been provisioned nor requested yet
    pub fn definitions_to_provision(&self) -> Vec<ResourceDefinition> {
        self.resources
            .iter()
            .filter(|r| r.needs_provisioning())
            .map(|r| r.definition.clone())
            .collect()
    }

    /// Provisioned resources still to be torn down
    pub fn resources_to_deprovision(&self) -> Vec<ProvisionedResource> {
        self.resources
            .iter()
            .filter(|r| r.needs_deprovisioning())
            .filter_map(|r| r.provisioned.clone())
            .collect()
    }

    pub fn resource_mut(&mut self, definition_id: &str) -> Option<&mut ProvisionResource> {
        self.resources.iter_mut().find(|r| r.id() == definition_id)
    }

    /// Resource whose provisioned counterpart has the given id
    pub fn resource_by_provisioned_id_mut(
        &mut self,
        resource_id: &str,
    ) -> Option<&mut ProvisionResource> {
        self.resources
            .iter_mut()
            .find(|r| r.provisioned.as_ref().is_some_and(|p| p.id == resource_id))
    }

    /// Every definition has a provisioned resource
    pub fn all_provisioned(&self) -> bool {
        self.resources.iter().all(|r| r.provisioned.is_some())
    }

    /// No resource is provisioned or awaiting deprovisioning
    pub fn all_deprovisioned(&self) -> bool {
        self.resources.iter().all(|r| {
            r.provisioned.is_none() || r.failed || r.state == ProvisionResourceState::Deprovisioned
        })
    }

    /// Address the data flow writes to: a provisioned address overrides the destination
    pub fn effective_destination(&self) -> Option<DataAddress> {
        self.resources
            .iter()
            .filter_map(|r| r.provisioned.as_ref())
            .find_map(|p| p.data_address.clone())
            .or_else(|| self.data_destination.clone())
    }
}

impl StatefulEntity for TransferProcess {
    type State = TransferProcessState;

    const KIND: &'static str = "TransferProcess";

    fn core(&self) -> &EntityCore<TransferProcessState> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore<TransferProcessState> {
        &mut self.core
    }

    fn discriminator(&self) -> Option<&str> {
        Some(self.process_type.as_str())
    }
}
