//! Resource provisioning
//!
//! Resources (buckets, endpoints, tokens) that must exist before data can move and be
//! torn down afterwards. Both entity types carry a list of [`ProvisionResource`]
//! entries, each tracking its own lifecycle:
//!
//! ```text
//! CREATED → PROVISION_REQUESTED → PROVISIONED → DEPROVISION_REQUESTED → DEPROVISIONED
//!     └──────────────────────────────↗    └──────────────────────────────↗
//! ```
//!
//! A provisioner either completes synchronously or acknowledges the request and reports
//! the result later through a callback command (`*_REQUESTED` states).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::address::DataAddress;
use super::policy::Policy;
use super::{ServiceFailure, StatusResult};

/// Kind of a provisionable resource with its kind-specific parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ResourceKind {
    #[serde(rename_all = "camelCase")]
    ObjectStorage {
        bucket: String,
        #[serde(default)]
        region: Option<String>,
    },
    HttpEndpoint { url: String },
    AccessToken { scope: String },
    #[serde(rename_all = "camelCase")]
    Custom {
        type_name: String,
        #[serde(default)]
        properties: BTreeMap<String, String>,
    },
}

impl ResourceKind {
    pub fn type_name(&self) -> &str {
        match self {
            ResourceKind::ObjectStorage { .. } => "ObjectStorage",
            ResourceKind::HttpEndpoint { .. } => "HttpEndpoint",
            ResourceKind::AccessToken { .. } => "AccessToken",
            ResourceKind::Custom { type_name, .. } => type_name,
        }
    }
}

/// Something to provision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    pub id: String,
    /// Owning transfer process (or data flow) id
    pub process_id: String,
    #[serde(flatten)]
    pub kind: ResourceKind,
}

impl ResourceDefinition {
    pub fn new(id: impl Into<String>, process_id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            process_id: process_id.into(),
            kind,
        }
    }
}

/// A resource that exists as the result of provisioning a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResource {
    pub id: String,
    pub definition_id: String,
    #[serde(flatten)]
    pub kind: ResourceKind,
    /// Address of the provisioned data location, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_address: Option<DataAddress>,
    /// Secret handed out with the resource (e.g. a temporary token)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
}

impl ProvisionedResource {
    pub fn for_definition(id: impl Into<String>, definition: &ResourceDefinition) -> Self {
        Self {
            id: id.into(),
            definition_id: definition.id.clone(),
            kind: definition.kind.clone(),
            data_address: None,
            secret: None,
        }
    }

    pub fn with_data_address(mut self, address: DataAddress) -> Self {
        self.data_address = Some(address);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionResponse {
    Provisioned(ProvisionedResource),
    /// Accepted; completion arrives later through a callback
    InProcess,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeprovisionResponse {
    Deprovisioned,
    /// Accepted; completion arrives later through a callback
    InProcess,
}

/// Lifecycle of a single provisioned sub-resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionResourceState {
    Created,
    ProvisionRequested,
    Provisioned,
    DeprovisionRequested,
    Deprovisioned,
}

/// Resource definition plus its provisioning progress
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionResource {
    pub definition: ResourceDefinition,
    pub state: ProvisionResourceState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioned: Option<ProvisionedResource>,
    /// Attempts in the current resource state, independent of the entity's state count
    #[serde(default)]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    /// Terminally failed; never attempted again
    #[serde(default)]
    pub failed: bool,
}

impl ProvisionResource {
    pub fn new(definition: ResourceDefinition) -> Self {
        Self {
            definition,
            state: ProvisionResourceState::Created,
            provisioned: None,
            attempts: 0,
            error_detail: None,
            failed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.definition.id
    }

    /// Still waiting for a provisioning attempt
    pub fn needs_provisioning(&self) -> bool {
        self.state == ProvisionResourceState::Created && !self.failed
    }

    /// Provisioned and not yet torn down
    pub fn needs_deprovisioning(&self) -> bool {
        self.state == ProvisionResourceState::Provisioned && !self.failed
    }

    pub fn mark_provision_requested(&mut self) {
        self.state = ProvisionResourceState::ProvisionRequested;
        self.attempts = 0;
        self.error_detail = None;
    }

    pub fn mark_provisioned(&mut self, resource: ProvisionedResource) {
        self.state = ProvisionResourceState::Provisioned;
        self.provisioned = Some(resource);
        self.attempts = 0;
        self.error_detail = None;
    }

    pub fn mark_deprovision_requested(&mut self) {
        self.state = ProvisionResourceState::DeprovisionRequested;
        self.attempts = 0;
        self.error_detail = None;
    }

    pub fn mark_deprovisioned(&mut self) {
        self.state = ProvisionResourceState::Deprovisioned;
        self.attempts = 0;
        self.error_detail = None;
    }

    /// Record a retryable failure of the current attempt
    pub fn record_attempt(&mut self, detail: impl Into<String>) {
        self.attempts += 1;
        self.error_detail = Some(detail.into());
    }

    pub fn fail(&mut self, detail: impl Into<String>) {
        self.failed = true;
        self.error_detail = Some(detail.into());
    }
}

/// Provisions and deprovisions resources of the kinds it can handle
#[async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &str;

    fn can_provision(&self, kind: &ResourceKind) -> bool;

    async fn provision(
        &self,
        definition: &ResourceDefinition,
        policy: Option<&Policy>,
    ) -> StatusResult<ProvisionResponse>;

    async fn deprovision(
        &self,
        resource: &ProvisionedResource,
        policy: Option<&Policy>,
    ) -> StatusResult<DeprovisionResponse>;
}

/// Provisions a batch of definitions; one result per input, in input order
#[async_trait]
pub trait ProvisionManager: Send + Sync {
    async fn provision(
        &self,
        definitions: &[ResourceDefinition],
        policy: Option<&Policy>,
    ) -> Vec<StatusResult<ProvisionResponse>>;

    async fn deprovision(
        &self,
        resources: &[ProvisionedResource],
        policy: Option<&Policy>,
    ) -> Vec<StatusResult<DeprovisionResponse>>;
}

/// Routes every entry to the first registered provisioner able to handle its kind
#[derive(Default)]
pub struct ProvisionManagerImpl {
    provisioners: Vec<Arc<dyn Provisioner>>,
}

impl ProvisionManagerImpl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.push(provisioner);
    }

    fn provisioner_for(&self, kind: &ResourceKind) -> StatusResult<&Arc<dyn Provisioner>> {
        self.provisioners
            .iter()
            .find(|p| p.can_provision(kind))
            .ok_or_else(|| {
                ServiceFailure::fatal(format!(
                    "No provisioner available for resource kind {}",
                    kind.type_name()
                ))
            })
    }
}

#[async_trait]
impl ProvisionManager for ProvisionManagerImpl {
    async fn provision(
        &self,
        definitions: &[ResourceDefinition],
        policy: Option<&Policy>,
    ) -> Vec<StatusResult<ProvisionResponse>> {
        join_all(definitions.iter().map(|definition| async move {
            let provisioner = self.provisioner_for(&definition.kind)?;
            debug!(
                definition_id = %definition.id,
                provisioner = provisioner.name(),
                "Provisioning resource"
            );
            provisioner.provision(definition, policy).await
        }))
        .await
    }

    async fn deprovision(
        &self,
        resources: &[ProvisionedResource],
        policy: Option<&Policy>,
    ) -> Vec<StatusResult<DeprovisionResponse>> {
        join_all(resources.iter().map(|resource| async move {
            let provisioner = self.provisioner_for(&resource.kind)?;
            debug!(
                resource_id = %resource.id,
                provisioner = provisioner.name(),
                "Deprovisioning resource"
            );
            provisioner.deprovision(resource, policy).await
        }))
        .await
    }
}
