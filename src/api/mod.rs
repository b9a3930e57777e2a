//! HTTP and WebSocket surface.

pub mod routes;
pub mod ws;

pub use routes::{ApiError, AppState, router};
