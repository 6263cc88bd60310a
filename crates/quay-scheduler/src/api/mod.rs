//! HTTP control surface for agents and operators

mod handlers;
mod router;
mod state;

pub use router::create_router;
pub use state::AppState;
