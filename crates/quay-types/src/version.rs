//! Model versions and snapshots
//!
//! A [`ModelSnapshot`] is the store's view of one model: every version ever
//! submitted, newest last. Each [`ModelVersion`] tracks the state of its
//! replicas on the server it has been placed on.

use crate::model::{DeploymentSpec, Model};
use crate::replica::{ModelReplicaState, ReplicaStatus};
use crate::ids::ModelVersionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Version-level progress summary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ModelState {
    #[default]
    Unknown,
    Progressing,
    Available,
    Failed,
    ScheduleFailed,
    Terminating,
    Terminated,
    TerminateFailed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "ModelStateUnknown",
            Self::Progressing => "ModelProgressing",
            Self::Available => "ModelAvailable",
            Self::Failed => "ModelFailed",
            Self::ScheduleFailed => "ScheduleFailed",
            Self::Terminating => "ModelTerminating",
            Self::Terminated => "ModelTerminated",
            Self::TerminateFailed => "ModelTerminateFailed",
        };
        f.write_str(s)
    }
}

/// Version-level status with the time it last changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelStatus {
    pub state: ModelState,
    #[serde(default)]
    pub reason: String,
    pub available_replicas: u32,
    pub unavailable_replicas: u32,
    pub timestamp: DateTime<Utc>,
}

impl ModelStatus {
    pub fn new(state: ModelState) -> Self {
        Self {
            state,
            reason: String::new(),
            available_replicas: 0,
            unavailable_replicas: 0,
            timestamp: Utc::now(),
        }
    }
}

/// One versioned model and the state of its replicas
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVersion {
    model: Model,
    version: u32,
    server: Option<String>,
    replicas: BTreeMap<u32, ReplicaStatus>,
    deleted: bool,
    state: ModelStatus,
}

impl ModelVersion {
    pub fn new(
        model: Model,
        version: u32,
        server: Option<String>,
        replicas: BTreeMap<u32, ReplicaStatus>,
        deleted: bool,
        state: ModelState,
    ) -> Self {
        Self {
            model,
            version,
            server,
            replicas,
            deleted,
            state: ModelStatus::new(state),
        }
    }

    /// A freshly submitted, not yet placed version
    pub fn pending(model: Model, version: u32) -> Self {
        Self::new(model, version, None, BTreeMap::new(), false, ModelState::Unknown)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn id(&self) -> ModelVersionId {
        ModelVersionId::new(self.model.name(), self.version)
    }

    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    pub fn set_server(&mut self, server: impl Into<String>) {
        self.server = Some(server.into());
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn set_deleted(&mut self) {
        self.deleted = true;
    }

    pub fn replica_state(&self) -> &BTreeMap<u32, ReplicaStatus> {
        &self.replicas
    }

    /// State of one replica, `Unknown` if the version has no such replica
    pub fn get_replica_state(&self, replica_idx: u32) -> ModelReplicaState {
        self.replicas
            .get(&replica_idx)
            .map(|s| s.state)
            .unwrap_or_default()
    }

    pub fn set_replica_state(
        &mut self,
        replica_idx: u32,
        state: ModelReplicaState,
        reason: impl Into<String>,
    ) {
        self.replicas
            .insert(replica_idx, ReplicaStatus::with_reason(state, reason));
    }

    pub fn remove_replica(&mut self, replica_idx: u32) -> Option<ReplicaStatus> {
        self.replicas.remove(&replica_idx)
    }

    pub fn clear_replicas(&mut self) {
        self.replicas.clear();
    }

    /// Replica indexes that hold, or are about to hold, the model
    pub fn loaded_or_loading_replicas(&self) -> Vec<u32> {
        self.replicas
            .iter()
            .filter(|(_, s)| s.state.is_loaded_or_loading())
            .map(|(idx, _)| *idx)
            .collect()
    }

    pub fn model_state(&self) -> &ModelStatus {
        &self.state
    }

    pub fn model_state_mut(&mut self) -> &mut ModelStatus {
        &mut self.state
    }

    pub fn set_model_state(&mut self, state: ModelState, reason: impl Into<String>) {
        self.state.state = state;
        self.state.reason = reason.into();
        self.state.timestamp = Utc::now();
    }

    /// Replace the deployment spec in place.
    ///
    /// Counts as a change for the stabilization window even when the
    /// summarized state stays the same.
    pub fn set_deployment_spec(&mut self, deployment_spec: DeploymentSpec) {
        self.model.deployment_spec = deployment_spec;
        self.update_model_state();
        self.state.timestamp = Utc::now();
    }

    /// Recompute the version-level status from the replica states.
    ///
    /// The timestamp only moves when the summary actually changes.
    pub fn update_model_state(&mut self) {
        let mut available = 0u32;
        let mut unavailable = 0u32;
        let mut failed_reason: Option<&str> = None;
        let mut unload_failed_reason: Option<&str> = None;
        let mut live = 0u32;

        for status in self.replicas.values() {
            match status.state {
                ModelReplicaState::Available => available += 1,
                ModelReplicaState::LoadFailed => {
                    unavailable += 1;
                    failed_reason.get_or_insert(status.reason.as_str());
                }
                ModelReplicaState::UnloadFailed => {
                    unload_failed_reason.get_or_insert(status.reason.as_str());
                }
                ModelReplicaState::LoadRequested | ModelReplicaState::Loading => unavailable += 1,
                _ => {}
            }
            if !matches!(
                status.state,
                ModelReplicaState::Unloaded | ModelReplicaState::Unknown | ModelReplicaState::LoadFailed
            ) {
                live += 1;
            }
        }
        let superseded = !self.replicas.is_empty()
            && self
                .replicas
                .values()
                .all(|s| s.state.is_unloading_or_unloaded());

        let (state, reason) = if self.deleted || superseded {
            if let Some(reason) = unload_failed_reason {
                (ModelState::TerminateFailed, reason.to_string())
            } else if live == 0 {
                (ModelState::Terminated, String::new())
            } else {
                (ModelState::Terminating, String::new())
            }
        } else if let Some(reason) = failed_reason {
            (ModelState::Failed, reason.to_string())
        } else if self.state.state == ModelState::ScheduleFailed && self.replicas.is_empty() {
            (ModelState::ScheduleFailed, self.state.reason.clone())
        } else if available > 0 && available >= self.model.deployment_spec.replicas {
            (ModelState::Available, String::new())
        } else if self.replicas.is_empty() && self.state.state == ModelState::Unknown {
            (ModelState::Unknown, String::new())
        } else {
            (ModelState::Progressing, String::new())
        };

        let changed = self.state.state != state
            || self.state.available_replicas != available
            || self.state.unavailable_replicas != unavailable
            || self.state.reason != reason;
        if changed {
            self.state = ModelStatus {
                state,
                reason,
                available_replicas: available,
                unavailable_replicas: unavailable,
                timestamp: Utc::now(),
            };
        }
    }
}

/// A model name plus its versions, newest appended last
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub name: String,
    pub versions: Vec<ModelVersion>,
    #[serde(default)]
    pub deleted: bool,
}

impl ModelSnapshot {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            versions: Vec::new(),
            deleted: false,
        }
    }

    pub fn latest(&self) -> Option<&ModelVersion> {
        self.versions.last()
    }

    pub fn latest_mut(&mut self) -> Option<&mut ModelVersion> {
        self.versions.last_mut()
    }

    pub fn get_version(&self, version: u32) -> Option<&ModelVersion> {
        self.versions.iter().find(|mv| mv.version() == version)
    }

    pub fn get_version_mut(&mut self, version: u32) -> Option<&mut ModelVersion> {
        self.versions.iter_mut().find(|mv| mv.version() == version)
    }

    /// Newest version whose version-level state is `Available`
    pub fn get_last_available_model(&self) -> Option<&ModelVersion> {
        self.versions
            .iter()
            .rev()
            .find(|mv| mv.model_state().state == ModelState::Available)
    }

    pub fn next_version(&self) -> u32 {
        self.latest().map(|mv| mv.version() + 1).unwrap_or(1)
    }
}
