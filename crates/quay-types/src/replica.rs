//! Replica lifecycle states
//!
//! A replica follows one of two strict axes:
//!
//! ```text
//! LoadRequested   -> Loading   -> Available | LoadFailed
//! UnloadRequested -> Unloading -> Unloaded  | UnloadFailed
//! ```
//!
//! The in-progress step is never skipped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// State of one model version replica on one server replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ModelReplicaState {
    #[default]
    Unknown,
    LoadRequested,
    Loading,
    Available,
    LoadFailed,
    UnloadRequested,
    Unloading,
    Unloaded,
    UnloadFailed,
}

impl ModelReplicaState {
    /// The in-progress state a requested state advances to
    pub fn in_progress(&self) -> Option<Self> {
        match self {
            Self::LoadRequested => Some(Self::Loading),
            Self::UnloadRequested => Some(Self::Unloading),
            _ => None,
        }
    }

    /// Replica holds (or is about to hold) the model in memory
    pub fn is_loaded_or_loading(&self) -> bool {
        matches!(self, Self::LoadRequested | Self::Loading | Self::Available)
    }

    /// Replica is on its way out or already gone
    pub fn is_unloading_or_unloaded(&self) -> bool {
        matches!(
            self,
            Self::UnloadRequested | Self::Unloading | Self::Unloaded | Self::UnloadFailed
        )
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Requested states may be issued from anywhere (a new desired state
    /// always wins), but terminal states are only reachable from their
    /// in-progress state.
    pub fn can_transition_to(&self, next: Self) -> bool {
        match next {
            Self::Unknown => false,
            Self::LoadRequested | Self::UnloadRequested => true,
            Self::Loading => *self == Self::LoadRequested,
            Self::Unloading => *self == Self::UnloadRequested,
            Self::Available | Self::LoadFailed => *self == Self::Loading,
            Self::Unloaded | Self::UnloadFailed => *self == Self::Unloading,
        }
    }
}

impl fmt::Display for ModelReplicaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "Unknown",
            Self::LoadRequested => "LoadRequested",
            Self::Loading => "Loading",
            Self::Available => "Available",
            Self::LoadFailed => "LoadFailed",
            Self::UnloadRequested => "UnloadRequested",
            Self::Unloading => "Unloading",
            Self::Unloaded => "Unloaded",
            Self::UnloadFailed => "UnloadFailed",
        };
        f.write_str(s)
    }
}

/// Status of one (model version, replica index) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaStatus {
    pub state: ModelReplicaState,
    #[serde(default)]
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

impl ReplicaStatus {
    pub fn new(state: ModelReplicaState) -> Self {
        Self {
            state,
            reason: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_reason(state: ModelReplicaState, reason: impl Into<String>) -> Self {
        Self {
            state,
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }
}
