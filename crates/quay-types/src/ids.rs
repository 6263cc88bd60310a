//! Identifiers for servers and model versions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one physical agent instance.
///
/// Used as the key of the live agent registry on the scheduler side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub server_name: String,
    pub replica_idx: u32,
}

impl ServerKey {
    pub fn new(server_name: impl Into<String>, replica_idx: u32) -> Self {
        Self {
            server_name: server_name.into(),
            replica_idx,
        }
    }
}

impl fmt::Display for ServerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.server_name, self.replica_idx)
    }
}

/// A (model name, version) pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelVersionId {
    pub name: String,
    pub version: u32,
}

impl ModelVersionId {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Name under which the backend inference server knows this version.
    pub fn backend_name(&self) -> String {
        format!("{}_{}", self.name, self.version)
    }
}

impl fmt::Display for ModelVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_key_display() {
        assert_eq!(ServerKey::new("mlserver", 2).to_string(), "mlserver/2");
    }

    #[test]
    fn test_backend_name() {
        assert_eq!(ModelVersionId::new("iris", 3).backend_name(), "iris_3");
    }
}
