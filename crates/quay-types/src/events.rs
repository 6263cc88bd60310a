//! Store change notifications

use serde::{Deserialize, Serialize};

/// A model (or one of its versions) changed in the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEventMsg {
    pub model_name: String,
    pub model_version: u32,
    pub source: String,
}

impl ModelEventMsg {
    pub fn new(model_name: impl Into<String>, model_version: u32, source: &str) -> Self {
        Self {
            model_name: model_name.into(),
            model_version,
            source: source.to_string(),
        }
    }
}

/// A server gained or lost a replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEventMsg {
    pub server_name: String,
    pub replica_idx: u32,
    pub source: String,
}
