//! Control channel messages between agents and the scheduler
//!
//! Commands flow down (`ModelOperationMessage`), status and scale triggers
//! flow up (`ModelEventMessage`, `ModelScalingTriggerMessage`). All messages
//! are plain JSON documents.

use crate::ids::{ModelVersionId, ServerKey};
use crate::model::Model;
use serde::{Deserialize, Serialize};

/// One model version as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelVersionDetails {
    pub model: Model,
    pub version: u32,
}

impl ModelVersionDetails {
    pub fn id(&self) -> ModelVersionId {
        ModelVersionId::new(self.model.name(), self.version)
    }

    pub fn memory_bytes(&self) -> u64 {
        self.model.model_spec.memory_bytes.unwrap_or(0)
    }
}

/// Capacity and endpoint of a connecting agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaConfig {
    pub inference_svc: String,
    pub inference_http_port: u16,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub memory_bytes: u64,
    #[serde(default)]
    pub available_memory_bytes: Option<u64>,
}

/// Handshake sent by an agent when it opens its control stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSubscribeRequest {
    pub server_name: String,
    pub replica_idx: u32,
    #[serde(default)]
    pub shared: bool,
    pub replica_config: ReplicaConfig,
    /// Models the agent already has registered (reconnect after a blip)
    #[serde(default)]
    pub loaded_models: Vec<ModelVersionDetails>,
}

impl AgentSubscribeRequest {
    pub fn server_key(&self) -> ServerKey {
        ServerKey::new(&self.server_name, self.replica_idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelOperation {
    LoadModel,
    UnloadModel,
}

/// Command from the scheduler to one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOperationMessage {
    pub operation: ModelOperation,
    pub model_version: ModelVersionDetails,
}

impl ModelOperationMessage {
    pub fn load(model: Model, version: u32) -> Self {
        Self {
            operation: ModelOperation::LoadModel,
            model_version: ModelVersionDetails { model, version },
        }
    }

    pub fn unload(model: Model, version: u32) -> Self {
        Self {
            operation: ModelOperation::UnloadModel,
            model_version: ModelVersionDetails { model, version },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelEventType {
    Loaded,
    LoadFailed,
    Unloaded,
    UnloadFailed,
}

/// Outcome of a command, reported by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelEventMessage {
    pub server_name: String,
    pub replica_idx: u32,
    pub model_name: String,
    pub model_version: u32,
    pub event: ModelEventType,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub available_memory_bytes: Option<u64>,
}

impl ModelEventMessage {
    pub fn server_key(&self) -> ServerKey {
        ServerKey::new(&self.server_name, self.replica_idx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScalingTrigger {
    ScaleUp,
    ScaleDown,
}

/// Request from an agent to change a model's replica count
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelScalingTriggerMessage {
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub replica_idx: u32,
    pub model_name: String,
    pub model_version: u32,
    pub trigger: ScalingTrigger,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_wire_format() {
        let msg = ModelOperationMessage::load(Model::new("iris"), 1);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["operation"], "LOAD_MODEL");
        assert_eq!(json["model_version"]["version"], 1);
        assert_eq!(json["model_version"]["model"]["meta"]["name"], "iris");
    }

    #[test]
    fn test_scaling_trigger_wire_format() {
        let msg: ModelScalingTriggerMessage = serde_json::from_str(
            r#"{"model_name":"iris","model_version":2,"trigger":"SCALE_DOWN"}"#,
        )
        .unwrap();
        assert_eq!(msg.trigger, ScalingTrigger::ScaleDown);
        assert_eq!(msg.replica_idx, 0);
    }
}
