//! Connection gateway
//!
//! Authenticates inbound primary connections through an injected
//! [`AuthVerifier`], binds the verified identity to a [`Connection`], joins
//! its default rooms and hands it to the heartbeat monitor. Inbound protocol
//! messages are processed by a per-socket [`Session`].

use std::sync::Arc;

use async_trait::async_trait;
use forkcast_shared::{Identity, RealtimeError, RealtimeResult, Role, TransportKind};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionTable, DisconnectReason, EventSender};
use crate::dispatcher::EventDispatcher;
use crate::events::{ClientCommand, DomainEvent, ServerEvent};
use crate::heartbeat::HeartbeatMonitor;
use crate::reconnection::ReconnectionCoordinator;
use crate::room::{
    authorize_join, default_rooms, entity_rooms, names, validate_room_name, EntityKind, RoomKind,
    RoomRegistry,
};

/// Verifies an opaque credential and yields the identity it was issued to
#[async_trait]
pub trait AuthVerifier: Send + Sync {
    async fn verify(&self, credential: &str) -> RealtimeResult<Identity>;
}

#[derive(Clone)]
pub struct ConnectionGateway {
    verifier: Arc<dyn AuthVerifier>,
    rooms: RoomRegistry,
    connections: ConnectionTable,
    heartbeat: HeartbeatMonitor,
    dispatcher: EventDispatcher,
    reconnection: ReconnectionCoordinator,
}

impl ConnectionGateway {
    pub fn new(
        verifier: Arc<dyn AuthVerifier>,
        rooms: RoomRegistry,
        connections: ConnectionTable,
        heartbeat: HeartbeatMonitor,
        dispatcher: EventDispatcher,
        reconnection: ReconnectionCoordinator,
    ) -> Self {
        Self {
            verifier,
            rooms,
            connections,
            heartbeat,
            dispatcher,
            reconnection,
        }
    }

    /// Verify a bearer credential without opening a connection
    pub async fn verify(&self, credential: Option<&str>) -> RealtimeResult<Identity> {
        let credential = credential
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| RealtimeError::Authentication("missing credential".to_string()))?;

        match self.verifier.verify(credential).await {
            Ok(identity) => Ok(identity),
            Err(RealtimeError::Authentication(reason)) => Err(RealtimeError::Authentication(reason)),
            Err(other) => Err(RealtimeError::Authentication(other.to_string())),
        }
    }

    /// Authenticate a new primary connection
    ///
    /// On success the connection is registered, has joined its default rooms,
    /// is being probed by the heartbeat monitor and has been sent
    /// `authentication_success`. Fails closed on a missing or invalid credential.
    pub async fn authenticate(
        &self,
        credential: Option<&str>,
        sender: EventSender,
    ) -> RealtimeResult<Arc<Connection>> {
        let identity = self.verify(credential).await.inspect_err(|e| {
            tracing::warn!(error = %e, "Connection authentication failed");
        })?;

        let conn = Arc::new(Connection::new(identity, TransportKind::Primary, sender));
        self.connections.insert(Arc::clone(&conn)).await;

        let subscriber = conn.subscriber();
        let mut rooms = Vec::new();
        for (room, kind) in default_rooms(&conn.identity) {
            self.rooms.join(&subscriber, &room, kind).await;
            rooms.push(room);
        }

        self.heartbeat.register(Arc::clone(&conn));
        self.watch_close(Arc::clone(&conn));

        let ack = ServerEvent::AuthenticationSuccess {
            user_id: conn.identity.user_id.clone(),
            role: conn.identity.role,
            connection_id: conn.id,
            rooms: rooms.clone(),
        };
        if let Err(e) = conn.send_event(&ack) {
            self.disconnect(&conn, DisconnectReason::TransportError).await;
            return Err(e);
        }

        tracing::info!(
            connection_id = %conn.id,
            user_id = %conn.identity.user_id,
            role = %conn.identity.role,
            rooms = rooms.len(),
            "Connection authenticated"
        );

        self.reconnection.on_connected(&conn.identity.user_id).await;
        Ok(conn)
    }

    /// Run the disconnect path once the connection is closed from anywhere
    fn watch_close(&self, conn: Arc<Connection>) {
        let gateway = self.clone();
        tokio::spawn(async move {
            conn.closed().await;
            let reason = conn.close_reason().unwrap_or(DisconnectReason::ClientClosed);
            gateway.disconnect(&conn, reason).await;
        });
    }

    /// Tear down a primary connection. Safe to call repeatedly; only the
    /// first call vacates rooms and feeds the reconnection coordinator.
    pub async fn disconnect(&self, conn: &Connection, reason: DisconnectReason) -> bool {
        conn.close(reason);
        if self.connections.remove(conn.id).await.is_none() {
            return false;
        }
        let reason = conn.close_reason().unwrap_or(reason);

        self.heartbeat.unregister(conn.id);
        let vacated = self.rooms.leave_all(&conn.identity.user_id, conn.id).await;

        tracing::info!(
            connection_id = %conn.id,
            user_id = %conn.identity.user_id,
            reason = %reason,
            rooms = vacated.len(),
            "Connection disconnected"
        );

        if reason != DisconnectReason::ServerShutdown {
            self.reconnection.on_disconnect(&conn.identity.user_id).await;
        }
        true
    }

    /// Apply one protocol command from an authenticated connection
    pub async fn handle(
        &self,
        conn: &Connection,
        command: ClientCommand,
    ) -> RealtimeResult<Option<ServerEvent>> {
        match command {
            ClientCommand::Authenticate { .. } => {
                Err(RealtimeError::validation("Connection is already authenticated"))
            }

            ClientCommand::JoinRoom {
                room_name,
                room_type,
            } => {
                let room_name = required(room_name, "roomName")?;
                validate_room_name(&room_name)?;
                authorize_join(&conn.identity, &room_name)?;
                let kind = match room_type.as_deref().filter(|t| !t.is_empty()) {
                    Some(t) => t.parse::<RoomKind>()?,
                    None => RoomKind::infer(&room_name),
                };

                let outcome = self.rooms.join(&conn.subscriber(), &room_name, kind).await;
                Ok(Some(ServerEvent::RoomJoined {
                    room_name,
                    room_type: outcome.kind.as_str().to_string(),
                    member_count: outcome.member_count,
                }))
            }

            ClientCommand::LeaveRoom { room_name } => {
                let room_name = required(room_name, "roomName")?;
                self.rooms
                    .leave(&conn.identity.user_id, conn.id, &room_name)
                    .await;
                Ok(Some(ServerEvent::RoomLeft { room_name }))
            }

            ClientCommand::SubscribeToOrder { order_id } => {
                let order_id = required(order_id, "orderId")?;
                order_id.validate("orderId")?;

                let subscriber = conn.subscriber();
                let rooms = self
                    .rooms
                    .create_entity_rooms(EntityKind::Order, &order_id)
                    .await;
                for room in &rooms {
                    self.rooms.join(&subscriber, room, RoomKind::infer(room)).await;
                }
                Ok(Some(ServerEvent::SubscriptionSuccess { order_id, rooms }))
            }

            ClientCommand::UnsubscribeFromOrder { order_id } => {
                let order_id = required(order_id, "orderId")?;
                order_id.validate("orderId")?;

                let mut rooms = Vec::new();
                for (room, _) in entity_rooms(EntityKind::Order, &order_id) {
                    self.rooms
                        .leave(&conn.identity.user_id, conn.id, &room)
                        .await;
                    rooms.push(room);
                }
                Ok(Some(ServerEvent::UnsubscriptionSuccess { order_id, rooms }))
            }

            ClientCommand::UpdateLocation {
                order_id,
                location,
                coordinates,
            } => {
                if !matches!(conn.identity.role, Role::DeliveryPerson | Role::Admin) {
                    return Err(RealtimeError::Forbidden(
                        "Only delivery persons can update locations".to_string(),
                    ));
                }
                let location = required(location, "location")?;
                if let Some(order_id) = &order_id {
                    order_id.validate("orderId")?;
                }

                self.dispatcher
                    .publish(DomainEvent::DeliveryLocationChanged {
                        order_id,
                        delivery_person_id: conn.identity.user_id.clone(),
                        location,
                        coordinates,
                    })
                    .await;
                Ok(None)
            }

            ClientCommand::SendMessage {
                order_id,
                message,
                kind,
            } => {
                let message = required(message.filter(|m| !m.trim().is_empty()), "message")?;
                let room = match &order_id {
                    Some(order_id) => {
                        order_id.validate("orderId")?;
                        names::order(order_id)
                    }
                    None => Role::Admin.broadcast_room().to_string(),
                };

                let payload = json!({
                    "orderId": order_id,
                    "message": message,
                    "type": kind.unwrap_or_else(|| "text".to_string()),
                    "senderId": conn.identity.user_id,
                    "senderRole": conn.identity.role,
                });
                self.dispatcher.emit(&room, "new_message", payload).await;
                Ok(None)
            }

            ClientCommand::Pong { .. } => {
                self.heartbeat.record_pong(conn.id);
                Ok(None)
            }
        }
    }

    /// Acknowledge a transport-level pong frame
    pub fn record_pong(&self, conn: &Connection) {
        self.heartbeat.record_pong(conn.id);
    }
}

fn required<T>(value: Option<T>, field: &str) -> RealtimeResult<T> {
    value.ok_or_else(|| RealtimeError::validation(format!("{field} is required")))
}

// =============================================================================
// Session
// =============================================================================

/// What the transport should do after a message was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

enum SessionState {
    Unauthenticated,
    Authenticated(Arc<Connection>),
    Closed,
}

/// Protocol state of one primary socket
///
/// Replies and errors are written into the socket's outbound channel, so the
/// transport only needs to pump that channel and feed inbound text here.
pub struct Session {
    gateway: ConnectionGateway,
    sender: EventSender,
    state: SessionState,
}

impl Session {
    pub fn new(gateway: ConnectionGateway, sender: EventSender) -> Self {
        Self {
            gateway,
            sender,
            state: SessionState::Unauthenticated,
        }
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        match &self.state {
            SessionState::Authenticated(conn) => Some(conn),
            _ => None,
        }
    }

    /// Token cancelled when the server closes this session's connection
    pub fn close_token(&self) -> Option<CancellationToken> {
        self.connection().map(|conn| conn.close_token())
    }

    /// Parse and apply one inbound text frame
    pub async fn handle_text(&mut self, text: &str) -> Flow {
        match serde_json::from_str::<ClientCommand>(text) {
            Ok(command) => self.handle(command).await,
            Err(e) => {
                tracing::debug!(error = %e, "Invalid client message");
                self.reply(&ServerEvent::error(&RealtimeError::validation(format!(
                    "Invalid message: {e}"
                ))));
                Flow::Continue
            }
        }
    }

    pub async fn handle(&mut self, command: ClientCommand) -> Flow {
        match &self.state {
            SessionState::Closed => Flow::Close,

            SessionState::Unauthenticated => match command {
                ClientCommand::Authenticate { token } => {
                    match self
                        .gateway
                        .authenticate(token.as_deref(), self.sender.clone())
                        .await
                    {
                        Ok(conn) => {
                            self.state = SessionState::Authenticated(conn);
                            Flow::Continue
                        }
                        Err(e) => {
                            self.reply(&ServerEvent::AuthenticationFailed {
                                message: e.client_message(),
                            });
                            self.state = SessionState::Closed;
                            Flow::Close
                        }
                    }
                }
                other => {
                    tracing::debug!(command = other.name(), "Command before authentication");
                    self.reply(&ServerEvent::error(&RealtimeError::Authentication(
                        "authenticate first".to_string(),
                    )));
                    Flow::Continue
                }
            },

            SessionState::Authenticated(conn) => {
                let conn = Arc::clone(conn);
                let name = command.name();
                match self.gateway.handle(&conn, command).await {
                    Ok(Some(reply)) => self.reply(&reply),
                    Ok(None) => {}
                    Err(e) => {
                        tracing::debug!(
                            connection_id = %conn.id,
                            command = name,
                            error = %e,
                            "Command rejected"
                        );
                        self.reply(&ServerEvent::error(&e));
                    }
                }
                if conn.is_closed() {
                    Flow::Close
                } else {
                    Flow::Continue
                }
            }
        }
    }

    /// Transport-level pong frame
    pub fn pong(&self) {
        if let Some(conn) = self.connection() {
            self.gateway.record_pong(conn);
        }
    }

    /// End the session; runs the disconnect path if it was authenticated
    pub async fn close(&mut self, reason: DisconnectReason) {
        if let SessionState::Authenticated(conn) =
            std::mem::replace(&mut self.state, SessionState::Closed)
        {
            self.gateway.disconnect(&conn, reason).await;
        }
    }

    fn reply(&self, event: &ServerEvent) {
        if self.sender.send(Arc::new(event.to_envelope())).is_err() {
            tracing::debug!(event_type = event.event_type(), "Reply dropped, socket gone");
        }
    }
}
