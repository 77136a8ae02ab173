//! Resource manifest generation
//!
//! A manifest is the list of resource definitions to provision for one transfer
//! process. The consumer derives it from the data destination, the provider from the
//! asset's content address. A third manifest travels with the data flow start request
//! and is provisioned by the data plane before the flow runs.

use std::sync::Arc;

use super::address::DataAddress;
use super::policy::Policy;
use super::provision::ResourceDefinition;
use super::StatusResult;

/// Produces one resource definition for addresses it understands
pub trait ResourceDefinitionGenerator: Send + Sync {
    fn can_generate(&self, address: &DataAddress, policy: &Policy) -> bool;

    fn generate(
        &self,
        process_id: &str,
        address: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<ResourceDefinition>;
}

pub trait ResourceManifestGenerator: Send + Sync {
    /// Manifest for the consumer side; `destination` is absent for pull transfers
    fn generate_consumer_manifest(
        &self,
        process_id: &str,
        destination: Option<&DataAddress>,
        policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>>;

    fn generate_provider_manifest(
        &self,
        process_id: &str,
        content: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>>;

    /// Resources the data plane provisions for the flow reading `source`
    fn generate_data_plane_manifest(
        &self,
        _process_id: &str,
        _source: &DataAddress,
        _policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>> {
        Ok(Vec::new())
    }
}

/// Runs every registered generator that accepts the address
#[derive(Default)]
pub struct TypeManifestGenerator {
    consumer: Vec<Arc<dyn ResourceDefinitionGenerator>>,
    provider: Vec<Arc<dyn ResourceDefinitionGenerator>>,
    data_plane: Vec<Arc<dyn ResourceDefinitionGenerator>>,
}

impl TypeManifestGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_consumer(&mut self, generator: Arc<dyn ResourceDefinitionGenerator>) {
        self.consumer.push(generator);
    }

    pub fn register_provider(&mut self, generator: Arc<dyn ResourceDefinitionGenerator>) {
        self.provider.push(generator);
    }

    pub fn register_data_plane(&mut self, generator: Arc<dyn ResourceDefinitionGenerator>) {
        self.data_plane.push(generator);
    }

    fn generate(
        generators: &[Arc<dyn ResourceDefinitionGenerator>],
        process_id: &str,
        address: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>> {
        generators
            .iter()
            .filter(|g| g.can_generate(address, policy))
            .map(|g| g.generate(process_id, address, policy))
            .collect()
    }
}

impl ResourceManifestGenerator for TypeManifestGenerator {
    fn generate_consumer_manifest(
        &self,
        process_id: &str,
        destination: Option<&DataAddress>,
        policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>> {
        match destination {
            Some(address) => Self::generate(&self.consumer, process_id, address, policy),
            None => Ok(Vec::new()),
        }
    }

    fn generate_provider_manifest(
        &self,
        process_id: &str,
        content: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>> {
        Self::generate(&self.provider, process_id, content, policy)
    }

    fn generate_data_plane_manifest(
        &self,
        process_id: &str,
        source: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<Vec<ResourceDefinition>> {
        Self::generate(&self.data_plane, process_id, source, policy)
    }
}
