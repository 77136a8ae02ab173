//! Contract policies

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use serde::{Deserialize, Serialize};

/// Usage policy agreed for a contract
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    #[serde(default)]
    pub assigner: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
    /// Flattened constraints (left operand → right operand)
    #[serde(default)]
    pub constraints: BTreeMap<String, String>,
}

/// Lookup of the policy attached to a contract agreement
pub trait PolicyArchive: Send + Sync {
    fn find_policy_for_contract(&self, contract_id: &str) -> Option<Policy>;
}

#[derive(Debug, Default)]
pub struct InMemoryPolicyArchive {
    policies: RwLock<HashMap<String, Policy>>,
}

impl InMemoryPolicyArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, contract_id: impl Into<String>, policy: Policy) {
        self.policies
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contract_id.into(), policy);
    }
}

impl PolicyArchive for InMemoryPolicyArchive {
    fn find_policy_for_contract(&self, contract_id: &str) -> Option<Policy> {
        self.policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(contract_id)
            .cloned()
    }
}

impl FromIterator<(String, Policy)> for InMemoryPolicyArchive {
    fn from_iter<T: IntoIterator<Item = (String, Policy)>>(iter: T) -> Self {
        Self {
            policies: RwLock::new(iter.into_iter().collect()),
        }
    }
}
