//! Shared application state

use std::sync::Arc;

use forkcast_realtime::RealtimeHub;

use crate::auth::JwtVerifier;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub verifier: Arc<JwtVerifier>,
    pub hub: RealtimeHub,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let verifier = Arc::new(JwtVerifier::new(&config.jwt_secret, config.jwt_leeway_secs));
        let hub = RealtimeHub::new(config.realtime.clone(), verifier.clone());

        Self {
            config: Arc::new(config),
            verifier,
            hub,
        }
    }
}
