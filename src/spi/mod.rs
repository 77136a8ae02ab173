//! Collaborator interfaces
//!
//! Everything the two state machines consume but do not implement themselves:
//! protocol dispatch, provisioning, policy lookup, address resolution, manifest
//! generation and the control plane's handle on the data plane. Every asynchronous
//! collaborator answers with a [`StatusResult`] whose failure carries a
//! [`FailureReason`]; the retry policy branches on it.

pub mod address;
pub mod dataflow;
pub mod dispatcher;
pub mod manifest;
pub mod policy;
pub mod provision;

pub use address::{DataAddress, DataAddressResolver, InMemoryAssetIndex};
pub use dataflow::{
    DataFlowController, DataFlowResponse, DataFlowStartMessage, FlowType, TransferType,
};
pub use dispatcher::{
    MessageAck, RemoteMessage, RemoteMessageDispatcher, TransferEventMessage,
    TransferRequestMessage, TransferStartMessage,
};
pub use manifest::{ResourceDefinitionGenerator, ResourceManifestGenerator, TypeManifestGenerator};
pub use policy::{InMemoryPolicyArchive, Policy, PolicyArchive};
pub use provision::{
    DeprovisionResponse, ProvisionManager, ProvisionManagerImpl, ProvisionResource,
    ProvisionResourceState, ProvisionResponse, ProvisionedResource, Provisioner,
    ResourceDefinition, ResourceKind,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a collaborator failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureReason {
    /// Transient: retry in place
    ErrorRetry,
    /// Non-retryable: give up immediately
    FatalError,
}

/// Failed outcome of a collaborator call
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{}", .messages.join(", "))]
pub struct ServiceFailure {
    pub reason: FailureReason,
    pub messages: Vec<String>,
}

impl ServiceFailure {
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::ErrorRetry,
            messages: vec![message.into()],
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            reason: FailureReason::FatalError,
            messages: vec![message.into()],
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.reason == FailureReason::FatalError
    }
}

/// Result of a collaborator call
pub type StatusResult<T> = Result<T, ServiceFailure>;
