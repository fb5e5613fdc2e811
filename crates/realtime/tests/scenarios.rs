//! End-to-end scenarios driven through the hub with a paused clock

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forkcast_realtime::reconnection::ReconnectionStats;
use forkcast_realtime::{
    AuthVerifier, ClientCommand, DisconnectReason, DomainEvent, EntityId, EventEnvelope,
    EventReceiver, Flow, RealtimeConfig, RealtimeHub, ReconnectionState, Session,
};
use forkcast_shared::{Identity, RealtimeError, RealtimeResult, Role, UserId};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time;

/// Accepts `<role>:<user>` tokens
struct StaticVerifier;

#[async_trait]
impl AuthVerifier for StaticVerifier {
    async fn verify(&self, credential: &str) -> RealtimeResult<Identity> {
        let (role, user) = credential
            .split_once(':')
            .ok_or_else(|| RealtimeError::Authentication("malformed token".to_string()))?;
        let role = role
            .parse::<Role>()
            .map_err(|e| RealtimeError::Authentication(e.to_string()))?;
        Ok(Identity::new(user, role))
    }
}

struct Client {
    session: Session,
    rx: EventReceiver,
}

impl Client {
    fn drain(&mut self) -> Vec<Arc<EventEnvelope>> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn event_types(&mut self) -> Vec<String> {
        self.drain().into_iter().map(|e| e.event_type.clone()).collect()
    }

    async fn send(&mut self, text: &str) -> Flow {
        self.session.handle_text(text).await
    }
}

fn hub_with(config: RealtimeConfig) -> RealtimeHub {
    RealtimeHub::new(config, Arc::new(StaticVerifier))
}

fn exact_config() -> RealtimeConfig {
    RealtimeConfig {
        reconnect_jitter_ratio: 0.0,
        ..RealtimeConfig::default()
    }
}

async fn connect(hub: &RealtimeHub, token: &str) -> Client {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut session = hub.session(tx);
    let flow = session
        .handle(ClientCommand::Authenticate {
            token: Some(token.to_string()),
        })
        .await;
    assert_eq!(flow, Flow::Continue);
    let mut client = Client { session, rx };
    assert_eq!(client.event_types()[0], "authentication_success");
    client
}

async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

async fn advance_ms(ms: u64) {
    time::advance(Duration::from_millis(ms)).await;
    settle().await;
}

#[tokio::test]
async fn order_update_reaches_room_members_only() {
    let hub = hub_with(RealtimeConfig::default());
    let mut alice = connect(&hub, "customer:alice").await;
    let mut bob = connect(&hub, "customer:bob").await;
    let mut carol = connect(&hub, "customer:carol").await;

    for client in [&mut alice, &mut bob] {
        client
            .send(r#"{"event":"subscribe_to_order","data":{"orderId":"42"}}"#)
            .await;
        assert_eq!(client.event_types(), vec!["subscription_success"]);
    }

    let report = hub
        .dispatcher()
        .emit("order_42", "order_status_updated", json!({ "status": "on_the_way" }))
        .await;
    assert_eq!(report.primary, 2);
    assert_eq!(report.failed, 0);

    for client in [&mut alice, &mut bob] {
        let events = client.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "order_status_updated");
        assert_eq!(events[0].data["status"], "on_the_way");
    }
    assert!(carol.drain().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_before_first_attempt_reports_success() {
    let hub = hub_with(RealtimeConfig::default());
    let user = UserId::new("u1");
    let mut first = connect(&hub, "customer:u1").await;
    settle().await;

    first.session.close(DisconnectReason::ClientClosed).await;
    assert!(matches!(
        hub.reconnection().state(&user).await,
        ReconnectionState::Reconnecting { attempt: 0, .. }
    ));

    advance_ms(900).await;
    let mut second = connect(&hub, "customer:u1").await;
    settle().await;
    // authentication_success was consumed by connect(); the next event is the success notice
    let events = second.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, "reconnection_success");
    assert_eq!(events[0].data["attempts"], 0);

    // The first attempt would have fired by now (1000ms + at most 10% jitter)
    advance_ms(300).await;
    assert!(second.drain().is_empty());
    assert_eq!(hub.reconnection().state(&user).await, ReconnectionState::Connected);
    assert_eq!(hub.reconnection().stats().await, ReconnectionStats::default());
}

#[tokio::test(start_paused = true)]
async fn first_attempt_fires_within_jitter_window() {
    let hub = hub_with(RealtimeConfig::default());
    let user = UserId::new("u1");
    let mut client = connect(&hub, "customer:u1").await;
    settle().await;

    client.session.close(DisconnectReason::ClientClosed).await;
    advance_ms(999).await;
    assert!(matches!(
        hub.reconnection().state(&user).await,
        ReconnectionState::Reconnecting { attempt: 0, .. }
    ));

    advance_ms(102).await;
    assert!(matches!(
        hub.reconnection().state(&user).await,
        ReconnectionState::Reconnecting { attempt: 1, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn exhausted_attempts_become_failed_record() {
    let hub = hub_with(exact_config());
    let user = UserId::new("u1");
    let identity = Identity::new("u1", Role::Customer);

    let mut client = connect(&hub, "customer:u1").await;
    // A polling client keeps receiving the identity's notifications
    hub.fallback()
        .register_polling(&identity, "tab", Some(1000), vec![])
        .await
        .unwrap();
    settle().await;
    client.session.close(DisconnectReason::ClientClosed).await;

    for (index, delay) in [1000u64, 2000, 4000, 8000].into_iter().enumerate() {
        advance_ms(delay - 1).await;
        assert!(matches!(
            hub.reconnection().state(&user).await,
            ReconnectionState::Reconnecting { attempt, .. } if attempt == index as u32
        ));
        advance_ms(1).await;
    }
    advance_ms(16_000).await;

    let failed = hub.reconnection().failed_record(&user).await.unwrap();
    assert_eq!(failed.attempts_used, 5);
    assert!(matches!(
        hub.reconnection().state(&user).await,
        ReconnectionState::Failed(_)
    ));

    let batch = hub.fallback().poll(&user, "tab").unwrap();
    let notices: Vec<(String, serde_json::Value)> = batch
        .events
        .into_iter()
        .filter(|e| e.event_type.starts_with("reconnection_"))
        .map(|e| (e.event_type, e.data))
        .collect();
    assert_eq!(notices.len(), 5);
    let next_delays: Vec<u64> = notices[..4]
        .iter()
        .map(|(_, data)| data["nextDelayMs"].as_u64().unwrap())
        .collect();
    assert_eq!(next_delays, vec![2000, 4000, 8000, 16000]);
    assert_eq!(notices[4].0, "reconnection_failed");
    assert_eq!(notices[4].1["attemptsUsed"], 5);

    // No sixth attempt
    advance_ms(60_000).await;
    assert_eq!(hub.reconnection().stats().await.pending, 0);
}

#[tokio::test(start_paused = true)]
async fn empty_room_is_reclaimed_after_timeout() {
    let hub = hub_with(RealtimeConfig::default());
    let timeout = hub.config().inactive_room_timeout;
    let mut client = connect(&hub, "customer:u1").await;

    client
        .send(r#"{"event":"join_room","data":{"roomName":"order_7"}}"#)
        .await;
    client
        .send(r#"{"event":"leave_room","data":{"roomName":"order_7"}}"#)
        .await;
    assert_eq!(client.event_types(), vec!["room_joined", "room_left"]);

    time::advance(timeout - Duration::from_millis(1)).await;
    hub.rooms().sweep().await;
    assert!(hub.rooms().room_exists("order_7").await);

    time::advance(Duration::from_millis(2)).await;
    assert_eq!(hub.rooms().sweep().await, vec!["order_7"]);
    assert!(!hub.rooms().room_exists("order_7").await);

    // Occupied rooms are never reclaimed
    assert!(hub.rooms().room_exists("user_u1").await);
}

#[tokio::test]
async fn polling_client_receives_same_payload_as_primary() {
    let hub = hub_with(RealtimeConfig::default());
    let mut primary = connect(&hub, "customer:alice").await;
    primary
        .send(r#"{"event":"subscribe_to_order","data":{"orderId":"42"}}"#)
        .await;
    primary.drain();

    let bob = Identity::new("bob", Role::Customer);
    hub.fallback()
        .register_polling(&bob, "tab-1", Some(2000), vec![EntityId::new("42")])
        .await
        .unwrap();

    let report = hub
        .dispatcher()
        .publish(DomainEvent::OrderStatusChanged {
            order_id: EntityId::new("42"),
            customer_id: UserId::new("alice"),
            restaurant_id: None,
            status: "delivered".to_string(),
            details: json!({ "eta": 0 }),
        })
        .await;
    assert_eq!(report.fallback, 1);

    let direct: Vec<_> = primary
        .drain()
        .into_iter()
        .filter(|e| e.room.as_deref() == Some("order_42"))
        .collect();
    assert_eq!(direct.len(), 1);

    let batch = hub.fallback().poll(&bob.user_id, "tab-1").unwrap();
    let polled: Vec<_> = batch
        .events
        .iter()
        .filter(|e| e.event_type == "order_status_updated")
        .collect();
    assert_eq!(polled.len(), 1);
    assert_eq!(polled[0].data, direct[0].data);
    assert_eq!(batch.next_poll_ms, 2000);
}

#[tokio::test(start_paused = true)]
async fn silent_connection_is_cleaned_up_exactly_once() {
    let config = RealtimeConfig::default();
    let interval = config.heartbeat_interval.as_millis() as u64;
    let timeout = config.heartbeat_timeout.as_millis() as u64;
    let hub = hub_with(config);
    let user = UserId::new("u1");

    let mut client = connect(&hub, "customer:u1").await;
    client
        .send(r#"{"event":"subscribe_to_order","data":{"orderId":"9"}}"#)
        .await;
    let conn = Arc::clone(client.session.connection().unwrap());
    settle().await;
    client.drain();

    advance_ms(interval).await;
    assert_eq!(client.event_types(), vec!["ping"]);

    advance_ms(timeout + 1).await;
    assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));
    assert!(hub.rooms().rooms_of(&user).await.is_empty());
    assert_eq!(hub.rooms().member_count("order_9").await, 0);
    assert_eq!(hub.stats().await.connections.primary, 0);

    // The client's own close arrives a moment later and finds nothing to do
    assert!(!hub.gateway().disconnect(&conn, DisconnectReason::ClientClosed).await);
    client.session.close(DisconnectReason::ClientClosed).await;
    assert_eq!(hub.reconnection().stats().await.pending, 1);
    assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));
}

#[tokio::test(start_paused = true)]
async fn pong_message_keeps_connection_alive() {
    let config = RealtimeConfig::default();
    let interval = config.heartbeat_interval.as_millis() as u64;
    let timeout = config.heartbeat_timeout.as_millis() as u64;
    let hub = hub_with(config);

    let mut client = connect(&hub, "customer:u1").await;
    settle().await;

    // Each probe cycle is one interval of quiet followed by the pong window
    let mut wait = interval;
    for _ in 0..3 {
        advance_ms(wait).await;
        assert_eq!(client.event_types(), vec!["ping"]);
        client
            .send(r#"{"event":"pong","data":{"timestamp":1}}"#)
            .await;

        advance_ms(timeout + 1).await;
        assert!(client.session.connection().is_some_and(|c| !c.is_closed()));
        wait = interval - 1;
    }
    assert_eq!(hub.stats().await.connections.primary, 1);
}
