//! quay Types - Core types for model placement and replica lifecycle
//!
//! quay keeps a fleet of inference servers in step with a central store of
//! desired model state. This crate holds the data model shared by the
//! scheduler (control plane) and the per-server agents.
//!
//! ## Key Concepts
//!
//! - **ModelVersion**: one versioned model with a per-replica status map
//! - **ModelSnapshot**: a model name plus its ordered versions
//! - **ModelReplicaState**: lifecycle of one replica on one server
//! - **ServerKey**: identity of one agent instance (server name + replica)
//! - **Messages**: the control channel between agents and the scheduler

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod events;
pub mod ids;
pub mod messages;
pub mod model;
pub mod replica;
pub mod server;
pub mod version;

pub use events::{ModelEventMsg, ServerEventMsg};
pub use ids::{ModelVersionId, ServerKey};
pub use messages::{
    AgentSubscribeRequest, ModelEventMessage, ModelEventType, ModelOperation,
    ModelOperationMessage, ModelScalingTriggerMessage, ModelVersionDetails, ReplicaConfig,
    ScalingTrigger,
};
pub use model::{DeploymentSpec, LoadModelRequest, Model, ModelMeta, ModelSpec};
pub use replica::{ModelReplicaState, ReplicaStatus};
pub use server::{ServerReplica, ServerSnapshot};
pub use version::{ModelSnapshot, ModelState, ModelStatus, ModelVersion};
