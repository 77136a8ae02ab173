//! Control plane → data plane contract

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::StatusResult;
use super::address::DataAddress;
use super::provision::ResourceDefinition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowType {
    /// The data plane moves the data to the destination
    Push,
    /// The consumer fetches the data from an endpoint handed out by the data plane
    Pull,
}

/// Destination type plus flow type, written `<destination>-<PUSH|PULL>`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferType {
    pub destination_type: String,
    pub flow_type: FlowType,
}

impl TransferType {
    pub fn new(destination_type: impl Into<String>, flow_type: FlowType) -> Self {
        Self {
            destination_type: destination_type.into(),
            flow_type,
        }
    }
}

impl fmt::Display for TransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flow = match self.flow_type {
            FlowType::Push => "PUSH",
            FlowType::Pull => "PULL",
        };
        write!(f, "{}-{}", self.destination_type, flow)
    }
}

impl FromStr for TransferType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (destination, flow) = s
            .rsplit_once('-')
            .ok_or_else(|| format!("Invalid transfer type: {s}"))?;
        let flow_type = match flow.to_ascii_uppercase().as_str() {
            "PUSH" => FlowType::Push,
            "PULL" => FlowType::Pull,
            _ => return Err(format!("Invalid flow type in transfer type: {s}")),
        };
        if destination.is_empty() {
            return Err(format!("Missing destination type in transfer type: {s}"));
        }
        Ok(Self::new(destination, flow_type))
    }
}

/// Instruction to start (or restart) a data flow for a transfer process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFlowStartMessage {
    /// Transfer process id; also the data flow id
    pub process_id: String,
    pub asset_id: String,
    pub agreement_id: String,
    pub participant_id: String,
    pub source: DataAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<DataAddress>,
    pub transfer_type: TransferType,
    /// Control plane endpoint receiving the flow's callbacks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_address: Option<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Data plane resources to provision before the flow starts
    #[serde(default)]
    pub resource_definitions: Vec<ResourceDefinition>,
}

/// Data plane answer to a start request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataFlowResponse {
    /// Endpoint the consumer pulls from (pull transfers only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_address: Option<DataAddress>,
    /// The flow starts with resource provisioning
    #[serde(default)]
    pub provisioning: bool,
}

/// Control plane view of the data plane
#[async_trait]
pub trait DataFlowController: Send + Sync {
    async fn start(&self, message: DataFlowStartMessage) -> StatusResult<DataFlowResponse>;

    async fn suspend(&self, process_id: &str) -> StatusResult<()>;

    async fn terminate(&self, process_id: &str, reason: Option<&str>) -> StatusResult<()>;
}
