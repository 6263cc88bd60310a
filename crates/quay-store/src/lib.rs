//! quay Store - desired and observed model state
//!
//! The scheduler depends only on the [`ModelStore`] trait. The in-memory
//! implementation is suitable for a single scheduler process; a persistent
//! backend can be substituted without touching reconciliation logic.
//!
//! Every mutation publishes a notification on the store's [`EventHub`], which
//! is what drives the scheduler's reconciliation passes.

#![deny(unsafe_code)]
#![cfg_attr(feature = "strict-docs", warn(missing_docs))]
#![cfg_attr(not(feature = "strict-docs"), allow(missing_docs))]

pub mod error;
pub mod event_hub;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use event_hub::EventHub;
pub use memory::InMemoryModelStore;
pub use traits::{ModelLock, ModelStore, ReplicaStateUpdate};
