//! Server and server replica views held by the store

use crate::ids::ModelVersionId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A named server and its connected replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSnapshot {
    pub name: String,
    pub replicas: BTreeMap<u32, ServerReplica>,
    /// Whether models from any owner may be placed here
    #[serde(default)]
    pub shared: bool,
}

impl ServerSnapshot {
    pub fn new(name: impl Into<String>, shared: bool) -> Self {
        Self {
            name: name.into(),
            replicas: BTreeMap::new(),
            shared,
        }
    }
}

/// One connected agent, as seen by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerReplica {
    pub inference_svc: String,
    pub inference_http_port: u16,
    pub capabilities: Vec<String>,
    pub memory_bytes: u64,
    pub available_memory_bytes: u64,
    #[serde(default)]
    pub loaded_models: BTreeSet<ModelVersionId>,
}

impl ServerReplica {
    /// Whether this replica advertises every capability in `requirements`
    pub fn satisfies(&self, requirements: &[String]) -> bool {
        requirements
            .iter()
            .all(|r| self.capabilities.iter().any(|c| c == r))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_satisfies_requirements() {
        let replica = ServerReplica {
            inference_svc: "localhost".into(),
            inference_http_port: 8080,
            capabilities: vec!["sklearn".into(), "xgboost".into()],
            memory_bytes: 1000,
            available_memory_bytes: 1000,
            loaded_models: BTreeSet::new(),
        };
        assert!(replica.satisfies(&["sklearn".to_string()]));
        assert!(replica.satisfies(&[]));
        assert!(!replica.satisfies(&["pytorch".to_string()]));
    }
}
