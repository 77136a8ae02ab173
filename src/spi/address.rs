//! Data addresses and asset address resolution

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Typed location of data (e.g. a file path, an HTTP endpoint, a bucket)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataAddress {
    #[serde(rename = "type")]
    pub type_name: String,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Resolves the content address of an asset on the provider side
pub trait DataAddressResolver: Send + Sync {
    fn resolve_for_asset(&self, asset_id: &str) -> Option<DataAddress>;
}

/// Static asset index, populated from configuration
#[derive(Debug, Default)]
pub struct InMemoryAssetIndex {
    assets: RwLock<HashMap<String, DataAddress>>,
}

impl InMemoryAssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, asset_id: impl Into<String>, address: DataAddress) {
        self.assets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(asset_id.into(), address);
    }
}

impl DataAddressResolver for InMemoryAssetIndex {
    fn resolve_for_asset(&self, asset_id: &str) -> Option<DataAddress> {
        self.assets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(asset_id)
            .cloned()
    }
}

impl FromIterator<(String, DataAddress)> for InMemoryAssetIndex {
    fn from_iter<T: IntoIterator<Item = (String, DataAddress)>>(iter: T) -> Self {
        Self {
            assets: RwLock::new(iter.into_iter().collect()),
        }
    }
}
