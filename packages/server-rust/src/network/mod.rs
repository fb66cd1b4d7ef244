//! Network surfaces: the broker session listener and the health endpoints.

pub mod health;
pub mod listener;

pub use health::AppState;
pub use listener::SessionListener;
