//! Fixtures shared by the unit tests

use chrono::{DateTime, Utc};
use quay_types::{
    AgentSubscribeRequest, DeploymentSpec, Model, ModelReplicaState, ModelSnapshot, ModelState,
    ModelVersion, ReplicaConfig, ReplicaStatus,
};

pub(crate) fn subscribe_request(server: &str, idx: u32) -> AgentSubscribeRequest {
    AgentSubscribeRequest {
        server_name: server.to_string(),
        replica_idx: idx,
        shared: true,
        replica_config: ReplicaConfig {
            inference_svc: "127.0.0.1".into(),
            inference_http_port: 9999,
            capabilities: vec![],
            memory_bytes: 1_000,
            available_memory_bytes: None,
        },
        loaded_models: vec![],
    }
}

/// A version of `iris` placed on `server1` with the given replica states
pub(crate) fn iris_version(
    version: u32,
    deployment: DeploymentSpec,
    replicas: &[(u32, ModelReplicaState)],
    state: ModelState,
) -> ModelVersion {
    let model = Model::new("iris").with_deployment_spec(deployment);
    let replicas = replicas
        .iter()
        .map(|(idx, s)| (*idx, ReplicaStatus::new(*s)))
        .collect();
    ModelVersion::new(model, version, Some("server1".into()), replicas, false, state)
}

pub(crate) fn snapshot(versions: Vec<ModelVersion>) -> ModelSnapshot {
    let mut snapshot = ModelSnapshot::new("iris");
    snapshot.versions = versions;
    snapshot
}

/// A timestamp well outside any stabilization window
pub(crate) fn long_ago() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}
