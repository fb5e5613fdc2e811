//! Forkcast API Library
//!
//! HTTP surface of the realtime core: the WebSocket upgrade route, the
//! server-push stream and polling fallbacks, stats and health checks.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
