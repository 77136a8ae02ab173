//! Data Flow entity
//!
//! The data plane's record of one transfer process. Its id is the transfer process id,
//! which makes a repeated start request for the same process land on the same flow.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::state::DataFlowState;
use crate::spi::{
    DataAddress, DataFlowStartMessage, FlowType, ProvisionResource, ProvisionResourceState,
    ProvisionedResource, ResourceDefinition, TransferType,
};
use crate::statemachine::{EngineError, EntityCore, EntityState, StatefulEntity};

use DataFlowState::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFlow {
    #[serde(flatten)]
    core: EntityCore<DataFlowState>,
    pub asset_id: String,
    pub agreement_id: String,
    pub participant_id: String,
    pub source: DataAddress,
    #[serde(default)]
    pub destination: Option<DataAddress>,
    pub transfer_type: TransferType,
    /// Runtime currently executing the transfer
    #[serde(default)]
    pub runtime_id: Option<String>,
    #[serde(default)]
    pub callback_address: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    #[serde(default)]
    pub resources: Vec<ProvisionResource>,
    /// Cause of the first failure; notify retries do not replace it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

const NON_FINAL: &[DataFlowState] = &[
    Provisioning,
    ProvisionRequested,
    ProvisionNotifying,
    Provisioned,
    Received,
    Started,
    Completed,
    Suspended,
    Failed,
    Deprovisioning,
    DeprovisionRequested,
];

fn allowed_sources(target: DataFlowState) -> &'static [DataFlowState] {
    match target {
        Provisioning => &[],
        ProvisionRequested => &[Provisioning],
        ProvisionNotifying => &[Provisioning, ProvisionRequested],
        Provisioned => &[ProvisionNotifying],
        Received => &[Provisioned, Started, Suspended],
        Started => &[Received],
        Completed => &[Started],
        Suspended => &[Received, Started],
        Failed => &[
            Provisioning,
            ProvisionRequested,
            ProvisionNotifying,
            Received,
            Started,
            Completed,
        ],
        Notified => &[Completed, Failed],
        Terminated => NON_FINAL,
        Deprovisioning => &[
            Provisioning,
            ProvisionRequested,
            ProvisionNotifying,
            Provisioned,
            Received,
            Started,
            Completed,
            Suspended,
        ],
        DeprovisionRequested => &[Deprovisioning],
        Deprovisioned => &[Deprovisioning, DeprovisionRequested],
    }
}

impl DataFlow {
    /// New flow for a start request; it provisions first when resources are requested
    pub fn from_start_message(
        message: DataFlowStartMessage,
        runtime_id: impl Into<String>,
        now: i64,
    ) -> Self {
        let initial = if message.resource_definitions.is_empty() {
            Received
        } else {
            Provisioning
        };
        Self {
            core: EntityCore::new(message.process_id, initial, now),
            asset_id: message.asset_id,
            agreement_id: message.agreement_id,
            participant_id: message.participant_id,
            source: message.source,
            destination: message.destination,
            transfer_type: message.transfer_type,
            runtime_id: Some(runtime_id.into()),
            callback_address: message.callback_address,
            properties: message.properties,
            resources: message
                .resource_definitions
                .into_iter()
                .map(ProvisionResource::new)
                .collect(),
            failure_reason: None,
        }
    }

    pub fn is_push(&self) -> bool {
        self.transfer_type.flow_type == FlowType::Push
    }

    pub fn transition_to(&mut self, target: DataFlowState, now: i64) -> Result<(), EngineError> {
        self.core.transition(target, allowed_sources(target), now)
    }

    pub fn give_up(
        &mut self,
        target: DataFlowState,
        detail: impl Into<String>,
        now: i64,
    ) -> Result<(), EngineError> {
        self.transition_to(target, now)?;
        let detail = detail.into();
        if target == Failed && self.failure_reason.is_none() {
            self.failure_reason = Some(detail.clone());
        }
        self.core.set_error_detail(detail);
        Ok(())
    }

    pub fn retry(&mut self, detail: impl Into<String>, now: i64) {
        self.core.retry(detail, now);
    }

    pub fn can_transition_to(&self, target: DataFlowState) -> bool {
        self.core.can_transition(target, allowed_sources(target))
    }

    pub fn is_final(&self) -> bool {
        self.state().is_final()
    }

    pub fn take_ownership(&mut self, runtime_id: &str) {
        self.runtime_id = Some(runtime_id.to_string());
    }

    /// Refresh the transfer parameters from a repeated start request
    pub fn restart_with(&mut self, message: DataFlowStartMessage) {
        self.source = message.source;
        if message.destination.is_some() {
            self.destination = message.destination;
        }
        self.transfer_type = message.transfer_type;
        if message.callback_address.is_some() {
            self.callback_address = message.callback_address;
        }
        self.properties.extend(message.properties);
    }

    /// Start request handed to a transfer service
    pub fn to_start_message(&self) -> DataFlowStartMessage {
        DataFlowStartMessage {
            process_id: self.id().to_string(),
            asset_id: self.asset_id.clone(),
            agreement_id: self.agreement_id.clone(),
            participant_id: self.participant_id.clone(),
            source: self.source.clone(),
            destination: self.effective_destination(),
            transfer_type: self.transfer_type.clone(),
            callback_address: self.callback_address.clone(),
            properties: self.properties.clone(),
            resource_definitions: Vec::new(),
        }
    }

    /// A provisioned address overrides the requested destination
    pub fn effective_destination(&self) -> Option<DataAddress> {
        self.resources
            .iter()
            .filter_map(|r| r.provisioned.as_ref())
            .find_map(|p| p.data_address.clone())
            .or_else(|| self.destination.clone())
    }

    pub fn definitions_to_provision(&self) -> Vec<ResourceDefinition> {
        self.resources
            .iter()
            .filter(|r| r.needs_provisioning())
            .map(|r| r.definition.clone())
            .collect()
    }

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

    pub fn resource_by_provisioned_id_mut(
        &mut self,
        resource_id: &str,
    ) -> Option<&mut ProvisionResource> {
        self.resources
            .iter_mut()
            .find(|r| r.provisioned.as_ref().is_some_and(|p| p.id == resource_id))
    }

    pub fn has_provisioned_resources(&self) -> bool {
        self.resources.iter().any(|r| r.needs_deprovisioning())
    }

    fn count_in(&self, state: ProvisionResourceState) -> usize {
        self.resources
            .iter()
            .filter(|r| r.state == state && !r.failed)
            .count()
    }

    /// Provisioning progress: (not attempted yet, awaiting a callback, failed)
    pub fn provisioning_progress(&self) -> (usize, usize, usize) {
        (
            self.count_in(ProvisionResourceState::Created),
            self.count_in(ProvisionResourceState::ProvisionRequested),
            self.resources.iter().filter(|r| r.failed).count(),
        )
    }

    /// Resources still awaiting a deprovisioning callback
    pub fn deprovisioning_outstanding(&self) -> usize {
        self.count_in(ProvisionResourceState::DeprovisionRequested)
    }

    /// Failure details of terminally failed resources
    pub fn resource_failures(&self) -> Vec<String> {
        self.resources
            .iter()
            .filter(|r| r.failed)
            .map(|r| {
                format!(
                    "{}: {}",
                    r.id(),
                    r.error_detail.as_deref().unwrap_or("failed")
                )
            })
            .collect()
    }
}

impl StatefulEntity for DataFlow {
    type State = DataFlowState;

    const KIND: &'static str = "DataFlow";

    fn core(&self) -> &EntityCore<DataFlowState> {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EntityCore<DataFlowState> {
        &mut self.core
    }

    fn discriminator(&self) -> Option<&str> {
        Some(match self.transfer_type.flow_type {
            FlowType::Push => "PUSH",
            FlowType::Pull => "PULL",
        })
    }

    fn owner(&self) -> Option<&str> {
        self.runtime_id.as_deref()
    }
}
