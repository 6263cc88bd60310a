//! Store trait definitions

use crate::error::StoreResult;
use crate::event_hub::EventHub;
use async_trait::async_trait;
use quay_types::{
    AgentSubscribeRequest, LoadModelRequest, ModelReplicaState, ModelSnapshot, ServerKey,
    ServerSnapshot,
};
use tokio::sync::OwnedMutexGuard;

/// Exclusive hold on one model for a read-modify-write sequence.
///
/// Dropping the lock releases it.
#[derive(Debug)]
pub struct ModelLock {
    model: String,
    _guard: OwnedMutexGuard<()>,
}

impl ModelLock {
    pub fn new(model: impl Into<String>, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            model: model.into(),
            _guard: guard,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

/// A replica state transition reported by an agent or issued by the
/// scheduler.
///
/// With `expected_state` set the update is a compare-and-swap: it is only
/// applied if the stored state still equals the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaStateUpdate {
    pub model_name: String,
    pub version: u32,
    pub server_key: ServerKey,
    pub available_memory: Option<u64>,
    pub expected_state: Option<ModelReplicaState>,
    pub desired_state: ModelReplicaState,
    pub reason: String,
}

impl ReplicaStateUpdate {
    pub fn new(
        model_name: impl Into<String>,
        version: u32,
        server_key: ServerKey,
        desired_state: ModelReplicaState,
    ) -> Self {
        Self {
            model_name: model_name.into(),
            version,
            server_key,
            available_memory: None,
            expected_state: None,
            desired_state,
            reason: String::new(),
        }
    }

    pub fn expecting(mut self, state: ModelReplicaState) -> Self {
        self.expected_state = Some(state);
        self
    }

    pub fn with_available_memory(mut self, bytes: Option<u64>) -> Self {
        self.available_memory = bytes;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }
}

/// Everything the scheduler needs from the central store
#[async_trait]
pub trait ModelStore: Send + Sync {
    /// Get a model and all its versions
    async fn get_model(&self, name: &str) -> StoreResult<Option<ModelSnapshot>>;

    /// List all models
    async fn get_models(&self) -> StoreResult<Vec<ModelSnapshot>>;

    /// Create or update a model, returning the version that carries it
    async fn update_model(&self, request: LoadModelRequest) -> StoreResult<u32>;

    /// Mark a model deleted and request unload of all its replicas
    async fn remove_model(&self, name: &str) -> StoreResult<()>;

    /// Serialise read-modify-write sequences on one model
    async fn lock_model(&self, name: &str) -> ModelLock;

    /// Record a placement decision for a version
    async fn update_loaded_models(
        &self,
        name: &str,
        version: u32,
        server: &str,
        replica_idxs: &[u32],
    ) -> StoreResult<()>;

    /// Transition one replica, atomically checking its expected state
    async fn update_model_state(&self, update: ReplicaStateUpdate) -> StoreResult<()>;

    /// Record that no server could host a version
    async fn failed_scheduling(&self, name: &str, version: u32, reason: &str) -> StoreResult<()>;

    /// List all servers
    async fn get_servers(&self) -> StoreResult<Vec<ServerSnapshot>>;

    /// Get a server by name
    async fn get_server(&self, name: &str) -> StoreResult<Option<ServerSnapshot>>;

    /// Register a connecting agent
    async fn add_server_replica(&self, request: &AgentSubscribeRequest) -> StoreResult<()>;

    /// Forget a disconnected agent, returning the models that lost a replica
    async fn remove_server_replica(
        &self,
        server_name: &str,
        replica_idx: u32,
    ) -> StoreResult<Vec<String>>;

    /// Change notifications for this store
    fn event_hub(&self) -> &EventHub;
}
