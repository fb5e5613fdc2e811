//! Composition root for the realtime core
//!
//! Builds every component once, leaf services first, and hands each its
//! collaborators at construction time.

use std::sync::Arc;

use serde::Serialize;

use crate::config::RealtimeConfig;
use crate::connection::{ConnectionTable, DisconnectReason, EventSender};
use crate::dispatcher::EventDispatcher;
use crate::fallback::{FallbackSettings, FallbackTransportManager};
use crate::gateway::{AuthVerifier, ConnectionGateway, Session};
use crate::heartbeat::HeartbeatMonitor;
use crate::reconnection::{BackoffPolicy, ReconnectionCoordinator, ReconnectionStats};
use crate::room::{RoomRegistry, RoomStats};
use crate::scheduler::{Scheduler, TimerHandle};

/// Live state of the realtime core
#[derive(Clone)]
pub struct RealtimeHub {
    config: Arc<RealtimeConfig>,
    scheduler: Scheduler,
    rooms: RoomRegistry,
    connections: ConnectionTable,
    heartbeat: HeartbeatMonitor,
    fallback: FallbackTransportManager,
    dispatcher: EventDispatcher,
    reconnection: ReconnectionCoordinator,
    gateway: ConnectionGateway,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStats {
    pub primary: usize,
    pub sse: usize,
    pub polling: usize,
    pub unique_users: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RealtimeStats {
    pub connections: ConnectionStats,
    pub rooms: RoomStats,
    pub reconnection: ReconnectionStats,
}

/// Periodic sweeps started by [`RealtimeHub::start_background_tasks`]
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<TimerHandle>,
}

impl BackgroundTasks {
    pub fn stop(&self) {
        for handle in &self.handles {
            handle.cancel();
        }
    }
}

impl RealtimeHub {
    pub fn new(config: RealtimeConfig, verifier: Arc<dyn AuthVerifier>) -> Self {
        let scheduler = Scheduler::new();
        let rooms = RoomRegistry::new(config.max_users_per_room, config.inactive_room_timeout);
        let connections = ConnectionTable::new();
        let heartbeat = HeartbeatMonitor::new(
            scheduler.clone(),
            config.heartbeat_interval,
            config.heartbeat_timeout,
        );
        let fallback = FallbackTransportManager::new(
            rooms.clone(),
            scheduler.clone(),
            FallbackSettings::from(&config),
        );
        let dispatcher = EventDispatcher::new(rooms.clone(), connections.clone(), fallback.clone());
        let reconnection = ReconnectionCoordinator::new(
            BackoffPolicy::from(&config),
            config.reconnection_retention,
            scheduler.clone(),
            connections.clone(),
            dispatcher.clone(),
        );
        let gateway = ConnectionGateway::new(
            verifier,
            rooms.clone(),
            connections.clone(),
            heartbeat.clone(),
            dispatcher.clone(),
            reconnection.clone(),
        );

        Self {
            config: Arc::new(config),
            scheduler,
            rooms,
            connections,
            heartbeat,
            fallback,
            dispatcher,
            reconnection,
            gateway,
        }
    }

    /// Start idle-room, fallback and reconnection-record sweeps
    pub fn start_background_tasks(&self) -> BackgroundTasks {
        let rooms = self.rooms.clone();
        let room_sweep = self.scheduler.every(self.config.room_sweep_interval, move || {
            let rooms = rooms.clone();
            async move {
                rooms.sweep().await;
            }
        });

        let fallback = self.fallback.clone();
        let fallback_sweep = self
            .scheduler
            .every(self.config.fallback_sweep_interval, move || {
                let fallback = fallback.clone();
                async move {
                    fallback.sweep().await;
                }
            });

        let reconnection = self.reconnection.clone();
        let reconnection_gc = self
            .scheduler
            .every(self.config.reconnection_sweep_interval, move || {
                let reconnection = reconnection.clone();
                async move {
                    reconnection.gc().await;
                }
            });

        tracing::info!(
            room_sweep_ms = self.config.room_sweep_interval.as_millis() as u64,
            fallback_sweep_ms = self.config.fallback_sweep_interval.as_millis() as u64,
            "Realtime background tasks started"
        );

        BackgroundTasks {
            handles: vec![room_sweep, fallback_sweep, reconnection_gc],
        }
    }

    /// New protocol session for a freshly opened primary socket
    pub fn session(&self, sender: EventSender) -> Session {
        Session::new(self.gateway.clone(), sender)
    }

    pub async fn stats(&self) -> RealtimeStats {
        let mut users = self.connections.users().await;
        users.extend(self.fallback.users());

        RealtimeStats {
            connections: ConnectionStats {
                primary: self.connections.count().await,
                sse: self.fallback.stream_count(),
                polling: self.fallback.polling_count(),
                unique_users: users.len(),
            },
            rooms: self.rooms.stats().await,
            reconnection: self.reconnection.stats().await,
        }
    }

    /// Close every connection and cancel every timer
    pub async fn shutdown(&self) {
        let connections = self.connections.all().await;
        let count = connections.len();
        for conn in connections {
            self.gateway
                .disconnect(&conn, DisconnectReason::ServerShutdown)
                .await;
        }
        self.fallback.shutdown().await;
        self.scheduler.shutdown();

        tracing::info!(
            connections = count,
            monitored = self.heartbeat.monitored_count(),
            "Realtime hub shut down"
        );
    }

    pub fn config(&self) -> &RealtimeConfig {
        &self.config
    }

    pub fn rooms(&self) -> &RoomRegistry {
        &self.rooms
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn dispatcher(&self) -> &EventDispatcher {
        &self.dispatcher
    }

    pub fn fallback(&self) -> &FallbackTransportManager {
        &self.fallback
    }

    pub fn reconnection(&self) -> &ReconnectionCoordinator {
        &self.reconnection
    }

    pub fn gateway(&self) -> &ConnectionGateway {
        &self.gateway
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ClientCommand;
    use async_trait::async_trait;
    use forkcast_shared::{Identity, RealtimeResult, Role};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tokio::time;

    struct AnyoneVerifier;

    #[async_trait]
    impl AuthVerifier for AnyoneVerifier {
        async fn verify(&self, credential: &str) -> RealtimeResult<Identity> {
            Ok(Identity::new(credential, Role::Customer))
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn hub() -> RealtimeHub {
        RealtimeHub::new(RealtimeConfig::default(), Arc::new(AnyoneVerifier))
    }

    #[tokio::test]
    async fn test_stats_count_every_transport() {
        let hub = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = hub.session(tx);
        session
            .handle(ClientCommand::Authenticate {
                token: Some("u1".to_string()),
            })
            .await;

        let _stream = hub
            .fallback()
            .register_stream(Identity::new("u2", Role::Customer), None)
            .await
            .unwrap();
        hub.fallback()
            .register_polling(&Identity::new("u1", Role::Customer), "tab", None, vec![])
            .await
            .unwrap();

        let stats = hub.stats().await;
        assert_eq!(
            stats.connections,
            ConnectionStats {
                primary: 1,
                sse: 1,
                polling: 1,
                unique_users: 2
            }
        );
        assert_eq!(stats.rooms.total, 3);

        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json["connections"]["uniqueUsers"], 2);
        assert_eq!(json["reconnection"]["pending"], 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_without_reconnection() {
        let hub = hub();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = hub.session(tx);
        session
            .handle(ClientCommand::Authenticate {
                token: Some("u1".to_string()),
            })
            .await;
        let conn = Arc::clone(session.connection().unwrap());

        hub.shutdown().await;

        assert_eq!(conn.close_reason(), Some(DisconnectReason::ServerShutdown));
        let stats = hub.stats().await;
        assert_eq!(stats.connections.primary, 0);
        assert_eq!(stats.reconnection.pending, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_room_sweep() {
        let hub = hub();
        hub.rooms()
            .create_entity_rooms(crate::room::EntityKind::Order, "7")
            .await;
        let tasks = hub.start_background_tasks();
        settle().await;

        // Rooms are reclaimed on the first sweep after the inactivity timeout
        let timeout = hub.config().inactive_room_timeout;
        let sweep = hub.config().room_sweep_interval;
        time::advance(timeout).await;
        settle().await;
        assert!(hub.rooms().room_exists("order_7").await);

        time::advance(sweep).await;
        settle().await;
        assert!(!hub.rooms().room_exists("order_7").await);

        tasks.stop();
        time::advance(Duration::from_secs(1)).await;
    }
}
