//! API request handlers

mod agents;
mod health;
mod models;

pub use agents::*;
pub use health::*;
pub use models::*;
