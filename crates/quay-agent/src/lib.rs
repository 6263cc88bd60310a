//! quay Agent - per-server model cache, reverse proxy and scheduler link
//!
//! One agent runs next to each inference server replica. It:
//! - keeps a bounded set of model versions resident ([`CacheManager`]),
//!   evicting the least recently used to make room
//! - fronts the server with a [`ReverseProxy`] that routes by the internal
//!   model header and loads models on demand
//! - applies load/unload commands from the scheduler and reports the
//!   outcome ([`AgentLink`])

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod link;
pub mod proxy;
pub mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendClient, V2Client};
pub use cache::{CacheLease, CacheManager, ResidentModel};
pub use config::{AgentConfig, ProxyConfig};
pub use error::{
    AgentError, AgentResult, BackendError, BackendResult, CacheError, CacheResult,
};
pub use link::AgentLink;
pub use proxy::{rewrite_path, ProxyError, ReverseProxy, INTERNAL_MODEL_HEADER};
pub use registry::{ModelRegistry, RegisteredModel};
