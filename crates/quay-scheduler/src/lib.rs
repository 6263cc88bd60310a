//! quay Scheduler - control plane for model placement and replica lifecycle
//!
//! The scheduler keeps every connected agent converging on the desired state
//! held in the model store:
//! - [`AgentRegistry`] tracks the live command stream of each server replica
//! - [`AgentServer::sync`] sends load/unload commands for requested replicas
//! - [`place`] picks server replicas for new or rescaled versions
//! - [`autoscaling`] turns agent scale triggers into ordinary model updates
//! - [`api`] exposes all of it over HTTP

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod api;
pub mod autoscaling;
pub mod error;
pub mod placement;
pub mod registry;
pub mod server;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{create_router, AppState};
pub use autoscaling::{
    calculate_desired_num_replicas, create_scaling_pseudo_request,
    DEFAULT_STABILIZATION_WINDOW_SECS,
};
pub use error::{ApiError, ApiResult, SchedulerError, SchedulerResult};
pub use placement::{place, CurrentPlacement, PlacementDecision};
pub use registry::{AgentRegistry, AgentSubscriber};
pub use server::{AgentServer, AgentServerConfig, SyncReport};
