//! API routes

pub mod health;
pub mod realtime;

use axum::{
    http::{HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{state::AppState, websocket::ws_handler};

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers(Any);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(origins)
}

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness));

    // Fallback transports (auth handled in handlers: bearer header or ?token=)
    let realtime_routes = Router::new()
        .route("/realtime/stream", get(realtime::stream))
        .route("/realtime/poll", post(realtime::register_poll))
        .route(
            "/realtime/poll/:user_id/:client_id",
            get(realtime::poll).delete(realtime::unregister_poll),
        )
        .route("/realtime/stats", get(realtime::stats));

    // Primary transport (auth via ?token= or an `authenticate` message)
    let websocket_routes = Router::new().route("/ws", get(ws_handler));

    Router::new()
        .merge(health_routes)
        .merge(realtime_routes)
        .merge(websocket_routes)
        .layer(cors_layer(&state.config.cors_origins))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
