//! In-memory model store
//!
//! Models and servers live behind one `RwLock` so that a replica
//! transition and the server bookkeeping it implies are applied together.
//! Per-model locks are handed out separately for callers that need to hold
//! a model across several store calls.

use crate::error::{StoreError, StoreResult};
use crate::event_hub::EventHub;
use crate::traits::{ModelLock, ModelStore, ReplicaStateUpdate};
use async_trait::async_trait;
use dashmap::DashMap;
use quay_types::{
    AgentSubscribeRequest, LoadModelRequest, ModelEventMsg, ModelReplicaState, ModelSnapshot,
    ModelState, ModelVersion, ServerEventMsg, ServerReplica, ServerSnapshot,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct StoreInner {
    models: HashMap<String, ModelSnapshot>,
    servers: HashMap<String, ServerSnapshot>,
}

/// In-memory store for a single scheduler process
#[derive(Debug)]
pub struct InMemoryModelStore {
    inner: RwLock<StoreInner>,
    model_locks: DashMap<String, Arc<Mutex<()>>>,
    event_hub: EventHub,
}

impl Default for InMemoryModelStore {
    fn default() -> Self {
        Self::new(EventHub::default())
    }
}

impl InMemoryModelStore {
    pub fn new(event_hub: EventHub) -> Self {
        Self {
            inner: RwLock::new(StoreInner::default()),
            model_locks: DashMap::new(),
            event_hub,
        }
    }

    /// Seed the store with a prepared snapshot
    pub async fn insert_snapshot(&self, snapshot: ModelSnapshot) {
        let mut inner = self.inner.write().await;
        inner.models.insert(snapshot.name.clone(), snapshot);
    }

    fn version_mut<'a>(
        models: &'a mut HashMap<String, ModelSnapshot>,
        name: &str,
        version: u32,
    ) -> StoreResult<&'a mut ModelVersion> {
        models
            .get_mut(name)
            .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))?
            .get_version_mut(version)
            .ok_or_else(|| StoreError::VersionNotFound {
                model: name.to_string(),
                version,
            })
    }

    fn model_event(&self, name: &str, version: u32, source: &str) {
        self.event_hub
            .publish_model(ModelEventMsg::new(name, version, source));
    }
}

#[async_trait]
impl ModelStore for InMemoryModelStore {
    async fn get_model(&self, name: &str) -> StoreResult<Option<ModelSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.models.get(name).cloned())
    }

    async fn get_models(&self) -> StoreResult<Vec<ModelSnapshot>> {
        let inner = self.inner.read().await;
        let mut models: Vec<_> = inner.models.values().cloned().collect();
        models.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(models)
    }

    async fn update_model(&self, request: LoadModelRequest) -> StoreResult<u32> {
        let model = request.model;
        let name = model.name().to_string();

        let mut inner = self.inner.write().await;
        let snapshot = inner
            .models
            .entry(name.clone())
            .or_insert_with(|| ModelSnapshot::new(&name));

        if !snapshot.deleted {
            if let Some(latest) = snapshot.latest_mut() {
                let current = latest.model();
                if current.meta == model.meta && current.model_spec == model.model_spec {
                    let version = latest.version();
                    if current.deployment_spec != model.deployment_spec {
                        debug!(
                            model = %name,
                            version,
                            replicas = model.deployment_spec.replicas,
                            "Updating deployment spec in place"
                        );
                        latest.set_deployment_spec(model.deployment_spec);
                        self.model_event(&name, version, "update_model");
                    }
                    return Ok(version);
                }
            }
        }

        let version = snapshot.next_version();
        snapshot.deleted = false;
        snapshot.versions.push(ModelVersion::pending(model, version));
        info!(model = %name, version, "Added model version");
        self.model_event(&name, version, "update_model");
        Ok(version)
    }

    async fn remove_model(&self, name: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let snapshot = inner
            .models
            .get_mut(name)
            .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))?;

        snapshot.deleted = true;
        for mv in snapshot.versions.iter_mut() {
            mv.set_deleted();
            for idx in mv.loaded_or_loading_replicas() {
                mv.set_replica_state(idx, ModelReplicaState::UnloadRequested, "model deleted");
            }
            mv.update_model_state();
        }

        let version = snapshot.latest().map(|mv| mv.version()).unwrap_or_default();
        info!(model = %name, "Model marked for deletion");
        self.model_event(name, version, "remove_model");
        Ok(())
    }

    async fn lock_model(&self, name: &str) -> ModelLock {
        let mutex = Arc::clone(
            self.model_locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        ModelLock::new(name, mutex.lock_owned().await)
    }

    async fn update_loaded_models(
        &self,
        name: &str,
        version: u32,
        server: &str,
        replica_idxs: &[u32],
    ) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mv = Self::version_mut(&mut inner.models, name, version)?;

        if let Some(placed) = mv.server().map(str::to_string) {
            if placed != server {
                if !mv.loaded_or_loading_replicas().is_empty() {
                    return Err(StoreError::Conflict(format!(
                        "{} still has live replicas on {}",
                        mv.id(),
                        placed
                    )));
                }
                mv.clear_replicas();
            }
        }
        mv.set_server(server);

        for idx in replica_idxs {
            if !mv.get_replica_state(*idx).is_loaded_or_loading() {
                mv.set_replica_state(*idx, ModelReplicaState::LoadRequested, "");
            }
        }
        for idx in mv.loaded_or_loading_replicas() {
            if !replica_idxs.contains(&idx) {
                mv.set_replica_state(
                    idx,
                    ModelReplicaState::UnloadRequested,
                    "replica no longer scheduled",
                );
            }
        }
        mv.update_model_state();

        debug!(model = %name, version, server, replicas = ?replica_idxs, "Updated placement");
        self.model_event(name, version, "update_loaded_models");
        Ok(())
    }

    async fn update_model_state(&self, update: ReplicaStateUpdate) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let StoreInner { models, servers } = &mut *inner;

        let name = update.model_name.as_str();
        let snapshot = models
            .get_mut(name)
            .ok_or_else(|| StoreError::ModelNotFound(name.to_string()))?;
        let latest_version = snapshot.latest().map(|mv| mv.version());
        let mv = snapshot
            .get_version_mut(update.version)
            .ok_or_else(|| StoreError::VersionNotFound {
                model: name.to_string(),
                version: update.version,
            })?;

        let server_name = update.server_key.server_name.as_str();
        let replica_idx = update.server_key.replica_idx;
        if let Some(placed) = mv.server() {
            if placed != server_name {
                return Err(StoreError::ServerMismatch {
                    model: name.to_string(),
                    version: update.version,
                    placed: placed.to_string(),
                    reported: server_name.to_string(),
                });
            }
        }

        // Check and set happen under the same write guard
        let current = mv.get_replica_state(replica_idx);
        if let Some(expected) = update.expected_state {
            if expected != current {
                return Err(StoreError::StaleStateUpdate {
                    model: name.to_string(),
                    version: update.version,
                    replica_idx,
                    expected,
                    actual: current,
                });
            }
        }
        if current == update.desired_state {
            return Ok(());
        }
        if !current.can_transition_to(update.desired_state) {
            return Err(StoreError::InvalidTransition {
                model: name.to_string(),
                version: update.version,
                replica_idx,
                from: current,
                to: update.desired_state,
            });
        }

        mv.set_replica_state(replica_idx, update.desired_state, update.reason.clone());
        mv.update_model_state();
        let version_id = mv.id();
        let became_available = mv.model_state().state == ModelState::Available;

        debug!(
            model = %name,
            version = update.version,
            server = %update.server_key,
            from = %current,
            to = %update.desired_state,
            "Replica state updated"
        );

        if let Some(replica) = servers
            .get_mut(server_name)
            .and_then(|s| s.replicas.get_mut(&replica_idx))
        {
            if let Some(bytes) = update.available_memory {
                replica.available_memory_bytes = bytes;
            }
            match update.desired_state {
                ModelReplicaState::Available => {
                    replica.loaded_models.insert(version_id);
                }
                ModelReplicaState::Unloaded | ModelReplicaState::LoadFailed => {
                    replica.loaded_models.remove(&version_id);
                }
                _ => {}
            }
        }

        // Drain and replace: once the newest version serves, older ones unload
        let mut drained = Vec::new();
        if became_available && latest_version == Some(update.version) {
            for older in snapshot
                .versions
                .iter_mut()
                .filter(|mv| mv.version() < update.version)
            {
                let idxs = older.loaded_or_loading_replicas();
                if idxs.is_empty() {
                    continue;
                }
                for idx in idxs {
                    older.set_replica_state(
                        idx,
                        ModelReplicaState::UnloadRequested,
                        format!("replaced by version {}", update.version),
                    );
                }
                older.update_model_state();
                drained.push(older.version());
            }
        }

        self.model_event(name, update.version, "update_model_state");
        for version in drained {
            info!(model = %name, version, "Draining superseded version");
            self.model_event(name, version, "update_model_state");
        }
        Ok(())
    }

    async fn failed_scheduling(&self, name: &str, version: u32, reason: &str) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let mv = Self::version_mut(&mut inner.models, name, version)?;
        mv.set_model_state(ModelState::ScheduleFailed, reason);
        info!(model = %name, version, reason, "Scheduling failed");
        self.model_event(name, version, "failed_scheduling");
        Ok(())
    }

    async fn get_servers(&self) -> StoreResult<Vec<ServerSnapshot>> {
        let inner = self.inner.read().await;
        let mut servers: Vec<_> = inner.servers.values().cloned().collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn get_server(&self, name: &str) -> StoreResult<Option<ServerSnapshot>> {
        let inner = self.inner.read().await;
        Ok(inner.servers.get(name).cloned())
    }

    async fn add_server_replica(&self, request: &AgentSubscribeRequest) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        let StoreInner { models, servers } = &mut *inner;

        let config = &request.replica_config;
        let loaded_memory: u64 = request.loaded_models.iter().map(|m| m.memory_bytes()).sum();
        let available = config
            .available_memory_bytes
            .unwrap_or_else(|| config.memory_bytes.saturating_sub(loaded_memory));

        let server = servers
            .entry(request.server_name.clone())
            .or_insert_with(|| ServerSnapshot::new(&request.server_name, request.shared));
        server.shared = request.shared;
        server.replicas.insert(
            request.replica_idx,
            ServerReplica {
                inference_svc: config.inference_svc.clone(),
                inference_http_port: config.inference_http_port,
                capabilities: config.capabilities.clone(),
                memory_bytes: config.memory_bytes,
                available_memory_bytes: available,
                loaded_models: request.loaded_models.iter().map(|m| m.id()).collect(),
            },
        );

        // Reconcile what the agent already holds with what the store expects
        for details in &request.loaded_models {
            let Some(mv) = models
                .get_mut(details.model.name())
                .and_then(|s| s.get_version_mut(details.version))
            else {
                continue;
            };
            if mv.server().is_some_and(|s| s != request.server_name) {
                continue;
            }
            let state = if mv.is_deleted() {
                ModelReplicaState::UnloadRequested
            } else {
                ModelReplicaState::Available
            };
            if mv.get_replica_state(request.replica_idx) == state {
                continue;
            }
            mv.set_server(&request.server_name);
            mv.set_replica_state(request.replica_idx, state, "restored from agent");
            mv.update_model_state();
            self.model_event(details.model.name(), details.version, "add_server_replica");
        }

        info!(
            server = %request.server_name,
            replica = request.replica_idx,
            memory = config.memory_bytes,
            available,
            "Server replica added"
        );
        self.event_hub.publish_server(ServerEventMsg {
            server_name: request.server_name.clone(),
            replica_idx: request.replica_idx,
            source: "add_server_replica".to_string(),
        });
        Ok(())
    }

    async fn remove_server_replica(
        &self,
        server_name: &str,
        replica_idx: u32,
    ) -> StoreResult<Vec<String>> {
        let mut inner = self.inner.write().await;
        let StoreInner { models, servers } = &mut *inner;

        let Some(server) = servers.get_mut(server_name) else {
            return Err(StoreError::ServerNotFound(server_name.to_string()));
        };
        server.replicas.remove(&replica_idx);
        if server.replicas.is_empty() {
            servers.remove(server_name);
        }

        let mut affected = Vec::new();
        for snapshot in models.values_mut() {
            let mut touched = Vec::new();
            for mv in snapshot.versions.iter_mut() {
                if mv.server() == Some(server_name) && mv.remove_replica(replica_idx).is_some() {
                    mv.update_model_state();
                    touched.push(mv.version());
                }
            }
            if !touched.is_empty() {
                for version in touched {
                    self.model_event(&snapshot.name, version, "remove_server_replica");
                }
                affected.push(snapshot.name.clone());
            }
        }
        affected.sort();

        info!(
            server = server_name,
            replica = replica_idx,
            models = affected.len(),
            "Server replica removed"
        );
        self.event_hub.publish_server(ServerEventMsg {
            server_name: server_name.to_string(),
            replica_idx,
            source: "remove_server_replica".to_string(),
        });
        Ok(affected)
    }

    fn event_hub(&self) -> &EventHub {
        &self.event_hub
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quay_types::{DeploymentSpec, Model, ModelSpec, ModelVersionDetails, ReplicaConfig, ServerKey};
    use std::time::Duration;

    fn request(name: &str, replicas: u32) -> LoadModelRequest {
        LoadModelRequest {
            model: Model::new(name).with_deployment_spec(DeploymentSpec::new(replicas)),
        }
    }

    fn subscribe(server: &str, idx: u32, loaded: Vec<ModelVersionDetails>) -> AgentSubscribeRequest {
        AgentSubscribeRequest {
            server_name: server.to_string(),
            replica_idx: idx,
            shared: true,
            replica_config: ReplicaConfig {
                inference_svc: "localhost".into(),
                inference_http_port: 9000,
                capabilities: vec!["sklearn".into()],
                memory_bytes: 1_000,
                available_memory_bytes: None,
            },
            loaded_models: loaded,
        }
    }

    async fn placed_store(name: &str) -> InMemoryModelStore {
        let store = InMemoryModelStore::default();
        store.update_model(request(name, 1)).await.unwrap();
        store
            .update_loaded_models(name, 1, "server1", &[0])
            .await
            .unwrap();
        store
    }

    async fn replica_state(store: &InMemoryModelStore, name: &str, version: u32, idx: u32) -> ModelReplicaState {
        store
            .get_model(name)
            .await
            .unwrap()
            .unwrap()
            .get_version(version)
            .unwrap()
            .get_replica_state(idx)
    }

    #[tokio::test]
    async fn test_update_model_versions() {
        let store = InMemoryModelStore::default();
        assert_eq!(store.update_model(request("iris", 1)).await.unwrap(), 1);

        // Deployment spec only: same version
        assert_eq!(store.update_model(request("iris", 3)).await.unwrap(), 1);
        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.versions.len(), 1);
        assert_eq!(snapshot.latest().unwrap().model().deployment_spec.replicas, 3);

        // Model spec change: new version
        let mut changed = request("iris", 3);
        changed.model.model_spec = ModelSpec {
            uri: "gs://models/iris-v2".into(),
            ..Default::default()
        };
        assert_eq!(store.update_model(changed).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_placement_marks_load_requested() {
        let store = placed_store("iris").await;
        assert_eq!(replica_state(&store, "iris", 1, 0).await, ModelReplicaState::LoadRequested);

        // Shrinking the placement asks the dropped replica to unload
        store
            .update_loaded_models("iris", 1, "server1", &[1])
            .await
            .unwrap();
        assert_eq!(replica_state(&store, "iris", 1, 0).await, ModelReplicaState::UnloadRequested);
        assert_eq!(replica_state(&store, "iris", 1, 1).await, ModelReplicaState::LoadRequested);
    }

    #[tokio::test]
    async fn test_update_model_state_compare_and_swap() {
        let store = placed_store("iris").await;
        let key = ServerKey::new("server1", 0);

        store
            .update_model_state(
                ReplicaStateUpdate::new("iris", 1, key.clone(), ModelReplicaState::Loading)
                    .expecting(ModelReplicaState::LoadRequested),
            )
            .await
            .unwrap();

        // A duplicate report still expecting LoadRequested is stale
        let err = store
            .update_model_state(
                ReplicaStateUpdate::new("iris", 1, key.clone(), ModelReplicaState::Loading)
                    .expecting(ModelReplicaState::LoadRequested),
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());
        assert_eq!(replica_state(&store, "iris", 1, 0).await, ModelReplicaState::Loading);
    }

    #[tokio::test]
    async fn test_update_model_state_rejects_skipping_in_progress() {
        let store = placed_store("iris").await;
        let err = store
            .update_model_state(ReplicaStateUpdate::new(
                "iris",
                1,
                ServerKey::new("server1", 0),
                ModelReplicaState::Available,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_model_state_wrong_server() {
        let store = placed_store("iris").await;
        let err = store
            .update_model_state(ReplicaStateUpdate::new(
                "iris",
                1,
                ServerKey::new("server2", 0),
                ModelReplicaState::Loading,
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ServerMismatch { .. }));
    }

    #[tokio::test]
    async fn test_new_version_available_drains_old() {
        let store = placed_store("iris").await;
        let key = ServerKey::new("server1", 0);
        for state in [ModelReplicaState::Loading, ModelReplicaState::Available] {
            store
                .update_model_state(ReplicaStateUpdate::new("iris", 1, key.clone(), state))
                .await
                .unwrap();
        }

        let mut v2 = request("iris", 1);
        v2.model.model_spec.uri = "gs://models/iris-v2".into();
        assert_eq!(store.update_model(v2).await.unwrap(), 2);
        store
            .update_loaded_models("iris", 2, "server1", &[0])
            .await
            .unwrap();
        for state in [ModelReplicaState::Loading, ModelReplicaState::Available] {
            store
                .update_model_state(ReplicaStateUpdate::new("iris", 2, key.clone(), state))
                .await
                .unwrap();
        }

        assert_eq!(replica_state(&store, "iris", 1, 0).await, ModelReplicaState::UnloadRequested);
        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.get_last_available_model().unwrap().version(), 2);
    }

    #[tokio::test]
    async fn test_remove_model_requests_unload() {
        let store = placed_store("iris").await;
        store.remove_model("iris").await.unwrap();

        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert!(snapshot.deleted);
        assert_eq!(
            snapshot.latest().unwrap().get_replica_state(0),
            ModelReplicaState::UnloadRequested
        );
        assert!(matches!(
            store.remove_model("missing").await,
            Err(StoreError::ModelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_server_replica_lifecycle() {
        let store = placed_store("iris").await;
        store.add_server_replica(&subscribe("server1", 0, vec![])).await.unwrap();

        let server = store.get_server("server1").await.unwrap().unwrap();
        assert_eq!(server.replicas[&0].available_memory_bytes, 1_000);

        let affected = store.remove_server_replica("server1", 0).await.unwrap();
        assert_eq!(affected, vec!["iris".to_string()]);
        assert!(store.get_server("server1").await.unwrap().is_none());
        assert_eq!(replica_state(&store, "iris", 1, 0).await, ModelReplicaState::Unknown);
    }

    #[tokio::test]
    async fn test_reconnect_restores_loaded_models() {
        let store = InMemoryModelStore::default();
        store.update_model(request("iris", 1)).await.unwrap();

        let details = ModelVersionDetails {
            model: Model::new("iris"),
            version: 1,
        };
        store
            .add_server_replica(&subscribe("server1", 2, vec![details]))
            .await
            .unwrap();

        assert_eq!(replica_state(&store, "iris", 1, 2).await, ModelReplicaState::Available);
        let server = store.get_server("server1").await.unwrap().unwrap();
        assert_eq!(server.replicas[&2].loaded_models.len(), 1);
    }

    #[tokio::test]
    async fn test_lock_model_is_exclusive() {
        let store = Arc::new(InMemoryModelStore::default());
        let guard = store.lock_model("iris").await;
        assert_eq!(guard.model(), "iris");

        let contender = {
            let store = store.clone();
            tokio::spawn(async move {
                let _lock = store.lock_model("iris").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // Other models are unaffected
        let _other = store.lock_model("mnist").await;

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_mutations_publish_events() {
        let store = InMemoryModelStore::default();
        let mut rx = store.event_hub().subscribe_models();
        store.update_model(request("iris", 1)).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.model_name, "iris");
        assert_eq!(event.source, "update_model");
    }
}
