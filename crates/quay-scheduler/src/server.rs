//! Agent-facing control plane
//!
//! [`AgentServer`] owns the link registry and drives every model toward its
//! desired state. `sync` only ever emits commands for replicas sitting in a
//! requested state; progress comes back asynchronously from the agents and
//! is applied through compare-and-swap store updates.

use crate::autoscaling::{create_scaling_pseudo_request, DEFAULT_STABILIZATION_WINDOW_SECS};
use crate::error::{SchedulerError, SchedulerResult};
use crate::placement::{place, CurrentPlacement};
use crate::registry::AgentRegistry;
use chrono::Utc;
use quay_store::{ModelLock, ModelStore, ReplicaStateUpdate, StoreError};
use quay_types::{
    AgentSubscribeRequest, LoadModelRequest, ModelEventMessage, ModelEventType,
    ModelOperationMessage, ModelReplicaState, ModelScalingTriggerMessage, ModelState, ServerKey,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast::error::RecvError, mpsc, watch};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Control plane tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentServerConfig {
    /// Full resync period
    #[serde(default = "default_resync_interval")]
    pub resync_interval_secs: u64,

    /// Quiet period after a model change before a scale trigger is honored
    #[serde(default = "default_stabilization")]
    pub scaling_stabilization_secs: i64,

    /// Keepalive period on agent command streams
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
}

fn default_resync_interval() -> u64 {
    30
}

fn default_stabilization() -> i64 {
    DEFAULT_STABILIZATION_WINDOW_SECS
}

fn default_heartbeat_interval() -> u64 {
    10
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            resync_interval_secs: default_resync_interval(),
            scaling_stabilization_secs: default_stabilization(),
            heartbeat_interval_secs: default_heartbeat_interval(),
        }
    }
}

impl AgentServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_interval_secs.max(1))
    }
}

/// Outcome of one `sync` pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Commands delivered and advanced to their in-progress state
    pub sent: usize,
    /// Replicas left requested because their agent is not connected
    pub skipped: usize,
}

/// Agent links, reconciliation and scaling for one scheduler process
pub struct AgentServer {
    store: Arc<dyn ModelStore>,
    agents: Arc<AgentRegistry>,
    config: AgentServerConfig,
}

impl AgentServer {
    pub fn new(
        store: Arc<dyn ModelStore>,
        agents: Arc<AgentRegistry>,
        config: AgentServerConfig,
    ) -> Self {
        Self {
            store,
            agents,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn ModelStore> {
        &self.store
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    pub fn config(&self) -> &AgentServerConfig {
        &self.config
    }

    /// Drive every replica of every version of `model_name` one step toward
    /// its requested state.
    ///
    /// Runs under the model lock. For each replica in `LoadRequested` or
    /// `UnloadRequested` the command is sent first and the replica is then
    /// advanced to `Loading`/`Unloading` with a compare-and-swap. Replicas
    /// whose agent has no live link are skipped and stay requested.
    #[instrument(skip(self, model_name), fields(model = %model_name))]
    pub async fn sync(&self, model_name: &str) -> SchedulerResult<SyncReport> {
        let lock = self.store.lock_model(model_name).await;
        self.sync_locked(&lock).await
    }

    async fn sync_locked(&self, lock: &ModelLock) -> SchedulerResult<SyncReport> {
        let model_name = lock.model();
        let mut report = SyncReport::default();

        let Some(snapshot) = self.store.get_model(model_name).await? else {
            debug!("Model no longer in store");
            return Ok(report);
        };

        for mv in &snapshot.versions {
            let Some(server) = mv.server() else {
                continue;
            };
            for (idx, status) in mv.replica_state() {
                let Some(next) = status.state.in_progress() else {
                    continue;
                };
                let key = ServerKey::new(server, *idx);
                let op = match status.state {
                    ModelReplicaState::LoadRequested => {
                        ModelOperationMessage::load(mv.model().clone(), mv.version())
                    }
                    _ => ModelOperationMessage::unload(mv.model().clone(), mv.version()),
                };

                if let Err(e) = self.agents.send(&key, op).await {
                    warn!(
                        server = %key,
                        version = mv.version(),
                        state = %status.state,
                        error = %e,
                        "Skipping replica without live agent link"
                    );
                    report.skipped += 1;
                    continue;
                }

                let update = ReplicaStateUpdate::new(model_name, mv.version(), key.clone(), next)
                    .expecting(status.state);
                match self.store.update_model_state(update).await {
                    Ok(()) => {
                        debug!(server = %key, version = mv.version(), to = %next, "Command sent");
                        report.sent += 1;
                    }
                    Err(e) if e.is_stale() => {
                        debug!(server = %key, version = mv.version(), error = %e, "Replica moved on during sync");
                    }
                    Err(e) => {
                        warn!(server = %key, version = mv.version(), error = %e, "Failed to advance replica");
                    }
                }
            }
        }

        if report.sent > 0 || report.skipped > 0 {
            info!(sent = report.sent, skipped = report.skipped, "Sync complete");
        }
        Ok(report)
    }

    /// Sync every model in the store
    pub async fn sync_all(&self) -> SchedulerResult<()> {
        for snapshot in self.store.get_models().await? {
            if let Err(e) = self.sync(&snapshot.name).await {
                warn!(model = %snapshot.name, error = %e, "Sync failed");
            }
        }
        Ok(())
    }

    /// Place the latest version of `model_name` on server replicas.
    ///
    /// Records a scheduling failure when no server can take it.
    #[instrument(skip(self, model_name), fields(model = %model_name))]
    pub async fn schedule(&self, model_name: &str) -> SchedulerResult<()> {
        let lock = self.store.lock_model(model_name).await;
        self.schedule_locked(&lock).await
    }

    async fn schedule_locked(&self, lock: &ModelLock) -> SchedulerResult<()> {
        let model_name = lock.model();
        let Some(snapshot) = self.store.get_model(model_name).await? else {
            return Err(SchedulerError::ModelNotFound(model_name.to_string()));
        };
        let Some(latest) = snapshot.latest() else {
            return Ok(());
        };
        if snapshot.deleted || latest.is_deleted() {
            return Ok(());
        }

        let servers = self.store.get_servers().await?;
        let live = latest.loaded_or_loading_replicas();
        let current = CurrentPlacement {
            server: latest.server(),
            replicas: &live,
        };

        match place(latest.model(), &servers, current) {
            Ok(None) => {
                debug!(version = latest.version(), "Nothing to place");
            }
            Ok(Some(decision)) => {
                if latest.server() == Some(decision.server.as_str()) && decision.replicas == live {
                    return Ok(());
                }
                info!(
                    version = latest.version(),
                    server = %decision.server,
                    replicas = ?decision.replicas,
                    "Placing model"
                );
                self.store
                    .update_loaded_models(
                        model_name,
                        latest.version(),
                        &decision.server,
                        &decision.replicas,
                    )
                    .await?;
            }
            Err(reason) => {
                let status = latest.model_state();
                if status.state == ModelState::ScheduleFailed && status.reason == reason {
                    return Ok(());
                }
                warn!(version = latest.version(), reason = %reason, "Failed to schedule model");
                self.store
                    .failed_scheduling(model_name, latest.version(), &reason)
                    .await?;
            }
        }
        Ok(())
    }

    /// Re-place every model, e.g. after the set of servers changed
    pub async fn reschedule_all(&self) -> SchedulerResult<()> {
        for snapshot in self.store.get_models().await? {
            if let Err(e) = self.schedule(&snapshot.name).await {
                warn!(model = %snapshot.name, error = %e, "Scheduling failed");
            }
        }
        Ok(())
    }

    /// Create or update a model and push it toward its new desired state.
    ///
    /// Returns the version that carries the request.
    #[instrument(skip(self, request), fields(model = %request.model.name()))]
    pub async fn apply_model(&self, request: LoadModelRequest) -> SchedulerResult<u32> {
        let lock = self.store.lock_model(request.model.name()).await;
        self.apply_model_locked(&lock, request).await
    }

    /// Update, place and sync in one hold of the model lock
    async fn apply_model_locked(
        &self,
        lock: &ModelLock,
        request: LoadModelRequest,
    ) -> SchedulerResult<u32> {
        let version = self.store.update_model(request).await?;
        self.schedule_locked(lock).await?;
        self.sync_locked(lock).await?;
        Ok(version)
    }

    /// Mark a model deleted and send unload commands for its replicas
    #[instrument(skip(self))]
    pub async fn remove_model(&self, name: &str) -> SchedulerResult<()> {
        let lock = self.store.lock_model(name).await;
        self.store.remove_model(name).await?;
        self.sync_locked(&lock).await?;
        Ok(())
    }

    /// Register a connecting agent. The returned receiver is its command
    /// stream.
    pub async fn subscribe(
        &self,
        request: AgentSubscribeRequest,
    ) -> SchedulerResult<(Uuid, mpsc::UnboundedReceiver<ModelOperationMessage>)> {
        let key = request.server_key();
        let (connection_id, rx) = self.agents.register(key.clone()).await;
        if let Err(e) = self.store.add_server_replica(&request).await {
            self.agents.remove(&key, connection_id).await;
            return Err(e.into());
        }
        info!(
            server = %key,
            connection = %connection_id,
            loaded = request.loaded_models.len(),
            "Agent subscribed"
        );
        Ok((connection_id, rx))
    }

    /// Forget a disconnected agent, returning the models that lost a replica.
    ///
    /// A superseded connection (the agent already reconnected) is ignored.
    pub async fn disconnect(
        &self,
        key: &ServerKey,
        connection_id: Uuid,
    ) -> SchedulerResult<Vec<String>> {
        if !self.agents.remove(key, connection_id).await {
            return Ok(Vec::new());
        }
        let affected = match self
            .store
            .remove_server_replica(&key.server_name, key.replica_idx)
            .await
        {
            Ok(affected) => affected,
            Err(StoreError::ServerNotFound(_)) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        info!(server = %key, connection = %connection_id, models = ?affected, "Agent disconnected");
        Ok(affected)
    }

    /// Apply an agent's report of a finished command.
    ///
    /// Returns `false` when the report was stale (the replica already moved
    /// past the state it refers to) and was ignored.
    #[instrument(skip(self, event), fields(model = %event.model_name, version = event.model_version, server = %event.server_key()))]
    pub async fn handle_agent_event(&self, event: &ModelEventMessage) -> SchedulerResult<bool> {
        let (expected, desired) = match event.event {
            ModelEventType::Loaded => (ModelReplicaState::Loading, ModelReplicaState::Available),
            ModelEventType::LoadFailed => (ModelReplicaState::Loading, ModelReplicaState::LoadFailed),
            ModelEventType::Unloaded => (ModelReplicaState::Unloading, ModelReplicaState::Unloaded),
            ModelEventType::UnloadFailed => {
                (ModelReplicaState::Unloading, ModelReplicaState::UnloadFailed)
            }
        };

        let _lock = self.store.lock_model(&event.model_name).await;
        let update = ReplicaStateUpdate::new(
            &event.model_name,
            event.model_version,
            event.server_key(),
            desired,
        )
        .expecting(expected)
        .with_available_memory(event.available_memory_bytes)
        .with_reason(event.message.clone());

        match self.store.update_model_state(update).await {
            Ok(()) => {
                debug!(to = %desired, "Agent event applied");
                Ok(true)
            }
            Err(e) if e.is_stale() => {
                debug!(error = %e, "Ignoring stale agent event");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rescale a model in response to an agent's trigger.
    ///
    /// The trigger must name the model's last available version. Validation
    /// failures are returned to the caller and the trigger is dropped. The
    /// model lock is held from validation through placement, so a queued
    /// trigger sees the result of the one before it.
    #[instrument(skip(self, trigger), fields(model = %trigger.model_name, version = trigger.model_version))]
    pub async fn handle_scaling_trigger(
        &self,
        trigger: &ModelScalingTriggerMessage,
    ) -> SchedulerResult<u32> {
        let lock = self.store.lock_model(&trigger.model_name).await;
        let snapshot = self
            .store
            .get_model(&trigger.model_name)
            .await?
            .ok_or_else(|| SchedulerError::ModelNotFound(trigger.model_name.clone()))?;
        let last_available = snapshot.get_last_available_model().ok_or_else(|| {
            SchedulerError::NoAvailableVersion {
                model: trigger.model_name.clone(),
            }
        })?;
        if last_available.version() != trigger.model_version {
            return Err(SchedulerError::NotLastAvailable {
                model: trigger.model_name.clone(),
                requested: trigger.model_version,
                available: last_available.version(),
            });
        }
        let request = create_scaling_pseudo_request(
            trigger,
            last_available,
            Utc::now(),
            chrono::Duration::seconds(self.config.scaling_stabilization_secs),
        )?;

        info!(
            model = %trigger.model_name,
            version = trigger.model_version,
            trigger = ?trigger.trigger,
            replicas = request.model.deployment_spec.replicas,
            "Applying scaling trigger"
        );
        self.apply_model_locked(&lock, request).await
    }

    /// React to store changes until `shutdown` flips to true.
    ///
    /// Model events sync the model, server events re-place every model, and
    /// a periodic tick does both for everything.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut model_events = self.store.event_hub().subscribe_models();
        let mut server_events = self.store.event_hub().subscribe_servers();
        let mut resync = tokio::time::interval(self.config.resync_interval());

        info!(
            resync_secs = self.config.resync_interval_secs,
            "Agent server event loop started"
        );

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                event = model_events.recv() => match event {
                    Ok(event) => {
                        if let Err(e) = self.sync(&event.model_name).await {
                            warn!(model = %event.model_name, error = %e, "Sync failed");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Model events lagged, resyncing all models");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                event = server_events.recv() => match event {
                    Ok(event) => {
                        debug!(server = %event.server_name, replica = event.replica_idx, source = %event.source, "Server changed");
                        if let Err(e) = self.reschedule_all().await {
                            warn!(error = %e, "Rescheduling failed");
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Server events lagged, resyncing all models");
                        self.resync().await;
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = resync.tick() => self.resync().await,
            }
        }

        info!("Agent server event loop stopped");
    }

    async fn resync(&self) {
        if let Err(e) = self.reschedule_all().await {
            warn!(error = %e, "Rescheduling failed");
        }
        if let Err(e) = self.sync_all().await {
            warn!(error = %e, "Resync failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{iris_version, long_ago, snapshot, subscribe_request};
    use quay_store::InMemoryModelStore;
    use quay_types::ModelReplicaState::*;
    use quay_types::{DeploymentSpec, Model, ModelOperation, ModelSpec, ScalingTrigger};

    fn setup(config: AgentServerConfig) -> (Arc<InMemoryModelStore>, AgentServer) {
        let store = Arc::new(InMemoryModelStore::default());
        let server = AgentServer::new(store.clone(), Arc::new(AgentRegistry::new()), config);
        (store, server)
    }

    async fn replica_state(store: &InMemoryModelStore, version: u32, idx: u32) -> ModelReplicaState {
        store
            .get_model("iris")
            .await
            .unwrap()
            .unwrap()
            .get_version(version)
            .unwrap()
            .get_replica_state(idx)
    }

    fn iris(replicas: u32, min: u32, max: u32) -> LoadModelRequest {
        LoadModelRequest {
            model: Model::new("iris")
                .with_model_spec(ModelSpec {
                    uri: "gs://models/iris".into(),
                    memory_bytes: Some(100),
                    ..Default::default()
                })
                .with_deployment_spec(DeploymentSpec::new(replicas).with_bounds(min, max)),
        }
    }

    fn event(idx: u32, version: u32, event: ModelEventType) -> ModelEventMessage {
        ModelEventMessage {
            server_name: "server1".into(),
            replica_idx: idx,
            model_name: "iris".into(),
            model_version: version,
            event,
            message: String::new(),
            available_memory_bytes: Some(900),
        }
    }

    #[tokio::test]
    async fn test_sync_advances_requested_replica() {
        let (store, server) = setup(AgentServerConfig::default());
        store
            .insert_snapshot(snapshot(vec![iris_version(
                1,
                DeploymentSpec::new(1),
                &[(0, LoadRequested)],
                ModelState::Progressing,
            )]))
            .await;
        let (_, mut rx) = server.agents().register(ServerKey::new("server1", 0)).await;

        let report = server.sync("iris").await.unwrap();
        assert_eq!(report, SyncReport { sent: 1, skipped: 0 });
        assert_eq!(replica_state(&store, 1, 0).await, Loading);

        let op = rx.recv().await.unwrap();
        assert_eq!(op.operation, ModelOperation::LoadModel);
        assert_eq!(op.model_version.version, 1);

        // Nothing left to send on a second pass
        assert_eq!(server.sync("iris").await.unwrap(), SyncReport::default());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_sync_handles_versions_independently() {
        let (store, server) = setup(AgentServerConfig::default());
        store
            .insert_snapshot(snapshot(vec![
                iris_version(1, DeploymentSpec::new(1), &[(0, UnloadRequested)], ModelState::Available),
                iris_version(2, DeploymentSpec::new(1), &[(1, LoadRequested)], ModelState::Progressing),
            ]))
            .await;
        let (_, mut rx0) = server.agents().register(ServerKey::new("server1", 0)).await;
        let (_, mut rx1) = server.agents().register(ServerKey::new("server1", 1)).await;

        let report = server.sync("iris").await.unwrap();
        assert_eq!(report.sent, 2);
        assert_eq!(replica_state(&store, 1, 0).await, Unloading);
        assert_eq!(replica_state(&store, 2, 1).await, Loading);

        assert_eq!(rx0.recv().await.unwrap().operation, ModelOperation::UnloadModel);
        assert_eq!(rx1.recv().await.unwrap().operation, ModelOperation::LoadModel);
    }

    #[tokio::test]
    async fn test_sync_skips_disconnected_agent() {
        let (store, server) = setup(AgentServerConfig::default());
        store
            .insert_snapshot(snapshot(vec![iris_version(
                1,
                DeploymentSpec::new(1),
                &[(0, LoadRequested)],
                ModelState::Progressing,
            )]))
            .await;

        let report = server.sync("iris").await.unwrap();
        assert_eq!(report, SyncReport { sent: 0, skipped: 1 });
        assert_eq!(replica_state(&store, 1, 0).await, LoadRequested);

        // Retried once the agent is back
        let (_, mut rx) = server.agents().register(ServerKey::new("server1", 0)).await;
        assert_eq!(server.sync("iris").await.unwrap().sent, 1);
        assert_eq!(replica_state(&store, 1, 0).await, Loading);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_sync_unknown_model_is_noop() {
        let (_, server) = setup(AgentServerConfig::default());
        assert_eq!(server.sync("missing").await.unwrap(), SyncReport::default());
    }

    #[tokio::test]
    async fn test_apply_model_places_and_loads() {
        let (store, server) = setup(AgentServerConfig::default());
        let (_, mut rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();

        let version = server.apply_model(iris(1, 0, 0)).await.unwrap();
        assert_eq!(version, 1);
        assert_eq!(replica_state(&store, 1, 0).await, Loading);

        let op = rx.recv().await.unwrap();
        assert_eq!(op.operation, ModelOperation::LoadModel);
        assert_eq!(op.model_version.model.model_spec.uri, "gs://models/iris");

        assert!(server.handle_agent_event(&event(0, 1, ModelEventType::Loaded)).await.unwrap());
        assert_eq!(replica_state(&store, 1, 0).await, Available);

        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.latest().unwrap().model_state().state, ModelState::Available);
        let servers = store.get_servers().await.unwrap();
        assert_eq!(servers[0].replicas[&0].available_memory_bytes, 900);
    }

    #[tokio::test]
    async fn test_stale_agent_event_ignored() {
        let (store, server) = setup(AgentServerConfig::default());
        let (_, _rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();
        server.apply_model(iris(1, 0, 0)).await.unwrap();

        assert!(server.handle_agent_event(&event(0, 1, ModelEventType::Loaded)).await.unwrap());
        // Duplicate report and a late failure both lose the race
        assert!(!server.handle_agent_event(&event(0, 1, ModelEventType::Loaded)).await.unwrap());
        assert!(!server.handle_agent_event(&event(0, 1, ModelEventType::LoadFailed)).await.unwrap());
        assert_eq!(replica_state(&store, 1, 0).await, Available);
    }

    #[tokio::test]
    async fn test_schedule_failure_recorded() {
        let (store, server) = setup(AgentServerConfig::default());
        let version = server.apply_model(iris(1, 0, 0)).await.unwrap();

        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        let mv = snapshot.get_version(version).unwrap();
        assert_eq!(mv.model_state().state, ModelState::ScheduleFailed);
        assert!(mv.server().is_none());

        // A server appearing lets the next pass place it
        let (_, mut rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();
        server.reschedule_all().await.unwrap();
        server.sync_all().await.unwrap();
        assert_eq!(replica_state(&store, 1, 0).await, Loading);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_zero_replica_model_is_not_placed() {
        let (store, server) = setup(AgentServerConfig::default());
        let (_, mut rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();

        server.apply_model(iris(0, 0, 0)).await.unwrap();

        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.latest().unwrap().server(), None);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remove_model_sends_unload() {
        let (store, server) = setup(AgentServerConfig::default());
        let (_, mut rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();
        server.apply_model(iris(1, 0, 0)).await.unwrap();
        server.handle_agent_event(&event(0, 1, ModelEventType::Loaded)).await.unwrap();
        rx.recv().await.unwrap();

        server.remove_model("iris").await.unwrap();
        assert_eq!(replica_state(&store, 1, 0).await, Unloading);
        assert_eq!(rx.recv().await.unwrap().operation, ModelOperation::UnloadModel);

        server.handle_agent_event(&event(0, 1, ModelEventType::Unloaded)).await.unwrap();
        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.latest().unwrap().model_state().state, ModelState::Terminated);
    }

    #[tokio::test]
    async fn test_disconnect_ignores_superseded_connection() {
        let (store, server) = setup(AgentServerConfig::default());
        let key = ServerKey::new("server1", 0);
        let (old, _old_rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();
        let (new, _new_rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();

        assert!(server.disconnect(&key, old).await.unwrap().is_empty());
        assert!(store.get_server("server1").await.unwrap().is_some());

        server.disconnect(&key, new).await.unwrap();
        assert!(store.get_server("server1").await.unwrap().is_none());
        assert!(!server.agents().contains(&key).await);
    }

    #[tokio::test]
    async fn test_scaling_trigger_rescales_last_available_version() {
        let config = AgentServerConfig {
            scaling_stabilization_secs: 0,
            ..Default::default()
        };
        let (store, server) = setup(config);
        let (_, mut rx0) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();
        let (_, mut rx1) = server.subscribe(subscribe_request("server1", 1)).await.unwrap();

        server.apply_model(iris(1, 1, 3)).await.unwrap();
        let placed = store.get_model("iris").await.unwrap().unwrap();
        let first_idx = placed.latest().unwrap().loaded_or_loading_replicas()[0];
        server
            .handle_agent_event(&event(first_idx, 1, ModelEventType::Loaded))
            .await
            .unwrap();

        let trigger = ModelScalingTriggerMessage {
            server_name: "server1".into(),
            replica_idx: first_idx,
            model_name: "iris".into(),
            model_version: 1,
            trigger: ScalingTrigger::ScaleUp,
        };
        let version = server.handle_scaling_trigger(&trigger).await.unwrap();
        // Deployment-only change updates the version in place
        assert_eq!(version, 1);

        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        let mv = snapshot.latest().unwrap();
        assert_eq!(mv.model().deployment_spec.replicas, 2);
        assert!(replica_state(&store, 1, 0).await.is_loaded_or_loading());
        assert!(replica_state(&store, 1, 1).await.is_loaded_or_loading());

        let mut loads = 0;
        while rx0.try_recv().is_ok() {
            loads += 1;
        }
        while rx1.try_recv().is_ok() {
            loads += 1;
        }
        assert_eq!(loads, 2);
    }

    #[tokio::test]
    async fn test_scaling_trigger_validation() {
        let (store, server) = setup(AgentServerConfig::default());
        let (_, _rx) = server.subscribe(subscribe_request("server1", 0)).await.unwrap();

        let mut trigger = ModelScalingTriggerMessage {
            server_name: "server1".into(),
            replica_idx: 0,
            model_name: "iris".into(),
            model_version: 1,
            trigger: ScalingTrigger::ScaleUp,
        };
        assert!(matches!(
            server.handle_scaling_trigger(&trigger).await,
            Err(SchedulerError::ModelNotFound(_))
        ));

        server.apply_model(iris(1, 1, 3)).await.unwrap();
        assert!(matches!(
            server.handle_scaling_trigger(&trigger).await,
            Err(SchedulerError::NoAvailableVersion { .. })
        ));

        server.handle_agent_event(&event(0, 1, ModelEventType::Loaded)).await.unwrap();
        // Just became available, inside the default window
        assert!(matches!(
            server.handle_scaling_trigger(&trigger).await,
            Err(SchedulerError::ModelNotStable { .. })
        ));

        trigger.model_version = 7;
        assert!(matches!(
            server.handle_scaling_trigger(&trigger).await,
            Err(SchedulerError::NotLastAvailable { available: 1, .. })
        ));
        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.latest().unwrap().model().deployment_spec.replicas, 1);
    }

    #[tokio::test]
    async fn test_queued_scaling_triggers_apply_one_at_a_time() {
        let (store, server) = setup(AgentServerConfig::default());
        let server = Arc::new(server);
        let mut agent_streams = Vec::new();
        for idx in 0..3 {
            let (_, rx) = server.subscribe(subscribe_request("server1", idx)).await.unwrap();
            agent_streams.push(rx);
        }

        let mut stable = iris_version(
            1,
            DeploymentSpec::new(3).with_bounds(1, 5),
            &[(0, Available), (1, Available), (2, Available)],
            ModelState::Available,
        );
        stable.update_model_state();
        stable.model_state_mut().timestamp = long_ago();
        store.insert_snapshot(snapshot(vec![stable])).await;

        let trigger = ModelScalingTriggerMessage {
            server_name: "server1".into(),
            replica_idx: 0,
            model_name: "iris".into(),
            model_version: 1,
            trigger: ScalingTrigger::ScaleDown,
        };

        // Both triggers queue up behind a held lock
        let lock = store.lock_model("iris").await;
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let server = server.clone();
                let trigger = trigger.clone();
                tokio::spawn(async move { server.handle_scaling_trigger(&trigger).await })
            })
            .collect();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        drop(lock);

        let mut applied = 0;
        let mut unstable = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 1);
                    applied += 1;
                }
                Err(SchedulerError::ModelNotStable { .. }) => unstable += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!((applied, unstable), (1, 1));

        let snapshot = store.get_model("iris").await.unwrap().unwrap();
        assert_eq!(snapshot.latest().unwrap().model().deployment_spec.replicas, 2);
    }

    #[tokio::test]
    async fn test_event_loop_syncs_and_stops() {
        let (store, server) = setup(AgentServerConfig::default());
        let server = Arc::new(server);
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(server.clone().run(rx));
        tokio::task::yield_now().await;

        store
            .insert_snapshot(snapshot(vec![iris_version(
                1,
                DeploymentSpec::new(1),
                &[(0, LoadRequested)],
                ModelState::Progressing,
            )]))
            .await;
        let (_, mut agent_rx) = server.agents().register(ServerKey::new("server1", 0)).await;
        store.event_hub().publish_model(quay_types::ModelEventMsg::new("iris", 1, "test"));

        let op = tokio::time::timeout(Duration::from_secs(5), agent_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(op.operation, ModelOperation::LoadModel);

        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
