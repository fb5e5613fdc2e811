//! Wire protocol and domain event types
//!
//! Defines the client-to-server commands, the server-to-client event catalog
//! and the domain events handed to the dispatcher by order-processing code.
//! Both directions use `{"event": <name>, "data": {...}}` framing.

use forkcast_shared::{ConnectionId, RealtimeError, Role, TransportKind, UserId};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::fmt;
use time::OffsetDateTime;

/// Current wall-clock time in unix milliseconds, as carried by `ping`/`keep_alive`
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

// =============================================================================
// Identifiers
// =============================================================================

/// Domain entity identifier (order, restaurant, ...). Accepts JSON strings or numbers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct EntityId(pub String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Entity ids end up inside room names, so keep them to a safe alphabet
    pub fn validate(&self, field: &str) -> Result<(), RealtimeError> {
        let valid = !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(RealtimeError::validation(format!(
                "{field} must be 1-64 characters of letters, digits, '-' or '_'"
            )))
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl<'de> Deserialize<'de> for EntityId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(EntityId(s)),
            Value::Number(n) => Ok(EntityId(n.to_string())),
            other => Err(serde::de::Error::custom(format!(
                "expected string or number id, got {other}"
            ))),
        }
    }
}

// =============================================================================
// Client-to-Server Commands
// =============================================================================

/// Commands sent from client to server over the primary transport.
///
/// Required fields are optional at the type level so a missing field is
/// reported as a validation error instead of an unparseable frame.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ClientCommand {
    Authenticate {
        #[serde(default)]
        token: Option<String>,
    },

    JoinRoom {
        #[serde(default)]
        room_name: Option<String>,
        #[serde(default)]
        room_type: Option<String>,
    },

    LeaveRoom {
        #[serde(default)]
        room_name: Option<String>,
    },

    SubscribeToOrder {
        #[serde(default)]
        order_id: Option<EntityId>,
    },

    UnsubscribeFromOrder {
        #[serde(default)]
        order_id: Option<EntityId>,
    },

    UpdateLocation {
        #[serde(default)]
        order_id: Option<EntityId>,
        #[serde(default)]
        location: Option<Value>,
        #[serde(default)]
        coordinates: Option<Value>,
    },

    SendMessage {
        #[serde(default)]
        order_id: Option<EntityId>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default, rename = "type")]
        kind: Option<String>,
    },

    Pong {
        #[serde(default)]
        timestamp: Option<i64>,
    },
}

impl ClientCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ClientCommand::Authenticate { .. } => "authenticate",
            ClientCommand::JoinRoom { .. } => "join_room",
            ClientCommand::LeaveRoom { .. } => "leave_room",
            ClientCommand::SubscribeToOrder { .. } => "subscribe_to_order",
            ClientCommand::UnsubscribeFromOrder { .. } => "unsubscribe_from_order",
            ClientCommand::UpdateLocation { .. } => "update_location",
            ClientCommand::SendMessage { .. } => "send_message",
            ClientCommand::Pong { .. } => "pong",
        }
    }
}

// =============================================================================
// Server-to-Client Events
// =============================================================================

/// Protocol events generated by the realtime core itself
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    AuthenticationSuccess {
        user_id: UserId,
        role: Role,
        connection_id: ConnectionId,
        rooms: Vec<String>,
    },

    AuthenticationFailed { message: String },

    RoomJoined {
        room_name: String,
        room_type: String,
        member_count: usize,
    },

    RoomLeft { room_name: String },

    SubscriptionSuccess { order_id: EntityId, rooms: Vec<String> },

    UnsubscriptionSuccess { order_id: EntityId, rooms: Vec<String> },

    /// Heartbeat probe; the client answers with `pong`
    Ping { timestamp: i64 },

    /// First event written to a freshly opened fallback stream
    Connected {
        connection_id: ConnectionId,
        transport: TransportKind,
    },

    KeepAlive { timestamp: i64 },

    FallbackActivated {
        transport: TransportKind,
        connection_id: ConnectionId,
        #[serde(skip_serializing_if = "Option::is_none")]
        interval_ms: Option<u64>,
    },

    ReconnectionAttempt {
        attempt: u32,
        max_attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        next_delay_ms: Option<u64>,
    },

    ReconnectionSuccess { attempts: u32 },

    ReconnectionFailed { reason: String, attempts_used: u32 },

    Error { code: String, message: String },
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            ServerEvent::AuthenticationSuccess { .. } => "authentication_success",
            ServerEvent::AuthenticationFailed { .. } => "authentication_failed",
            ServerEvent::RoomJoined { .. } => "room_joined",
            ServerEvent::RoomLeft { .. } => "room_left",
            ServerEvent::SubscriptionSuccess { .. } => "subscription_success",
            ServerEvent::UnsubscriptionSuccess { .. } => "unsubscription_success",
            ServerEvent::Ping { .. } => "ping",
            ServerEvent::Connected { .. } => "connected",
            ServerEvent::KeepAlive { .. } => "keep_alive",
            ServerEvent::FallbackActivated { .. } => "fallback_activated",
            ServerEvent::ReconnectionAttempt { .. } => "reconnection_attempt",
            ServerEvent::ReconnectionSuccess { .. } => "reconnection_success",
            ServerEvent::ReconnectionFailed { .. } => "reconnection_failed",
            ServerEvent::Error { .. } => "error",
        }
    }

    pub fn error(err: &RealtimeError) -> Self {
        ServerEvent::Error {
            code: err.code().to_string(),
            message: err.client_message(),
        }
    }

    /// Wrap the event in the envelope written to every transport
    pub fn to_envelope(&self) -> EventEnvelope {
        let data = match serde_json::to_value(self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            Ok(_) => Value::Null,
            Err(e) => {
                tracing::error!(error = %e, event_type = self.event_type(), "Failed to serialize server event");
                Value::Null
            }
        };
        EventEnvelope::new(self.event_type(), data)
    }
}

/// A serialized event as delivered to a client on any transport
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventEnvelope {
    #[serde(rename = "event")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            room: None,
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn in_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// Domain Events
// =============================================================================

/// Events handed to the dispatcher by order-processing code
#[derive(Debug, Clone, PartialEq)]
pub enum DomainEvent {
    OrderCreated {
        order_id: EntityId,
        customer_id: UserId,
        restaurant_id: EntityId,
        details: Value,
    },

    OrderStatusChanged {
        order_id: EntityId,
        customer_id: UserId,
        restaurant_id: Option<EntityId>,
        status: String,
        details: Value,
    },

    DeliveryAssigned {
        order_id: EntityId,
        customer_id: UserId,
        delivery_person_id: UserId,
    },

    DeliveryLocationChanged {
        order_id: Option<EntityId>,
        delivery_person_id: UserId,
        location: Value,
        coordinates: Option<Value>,
    },

    PaymentCompleted {
        order_id: EntityId,
        customer_id: UserId,
        amount_cents: i64,
    },

    PaymentFailed {
        order_id: EntityId,
        customer_id: UserId,
        reason: String,
    },

    /// Operator notice; `role: None` reaches every role room
    SystemAnnouncement { role: Option<Role>, message: String },
}

/// One room-addressed emission derived from a domain event
#[derive(Debug, Clone, PartialEq)]
pub struct Emission {
    pub room: String,
    pub event_type: &'static str,
    pub data: Value,
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated { .. } => "order_created",
            DomainEvent::OrderStatusChanged { .. } => "order_status_updated",
            DomainEvent::DeliveryAssigned { .. } => "delivery_assigned",
            DomainEvent::DeliveryLocationChanged { .. } => "delivery_location_updated",
            DomainEvent::PaymentCompleted { .. } => "payment_completed",
            DomainEvent::PaymentFailed { .. } => "payment_failed",
            DomainEvent::SystemAnnouncement { .. } => "system_announcement",
        }
    }

    /// Resolve the deterministic rooms this event is delivered to
    pub fn emissions(&self) -> Vec<Emission> {
        use crate::room::names;

        let event_type = self.event_type();
        let emit = |room: String, data: &Value| Emission {
            room,
            event_type,
            data: data.clone(),
        };

        match self {
            DomainEvent::OrderCreated {
                order_id,
                customer_id,
                restaurant_id,
                details,
            } => {
                let data = json!({
                    "orderId": order_id,
                    "customerId": customer_id,
                    "restaurantId": restaurant_id,
                    "details": details,
                });
                vec![
                    emit(names::restaurant_orders(restaurant_id), &data),
                    emit(names::restaurant_kitchen(restaurant_id), &data),
                    emit(names::user(customer_id), &data),
                ]
            }

            DomainEvent::OrderStatusChanged {
                order_id,
                customer_id,
                restaurant_id,
                status,
                details,
            } => {
                let data = json!({
                    "orderId": order_id,
                    "status": status,
                    "details": details,
                });
                let mut out = vec![
                    emit(names::order(order_id), &data),
                    emit(names::user(customer_id), &data),
                ];
                if let Some(restaurant_id) = restaurant_id {
                    out.push(emit(names::restaurant_orders(restaurant_id), &data));
                }
                out
            }

            DomainEvent::DeliveryAssigned {
                order_id,
                customer_id,
                delivery_person_id,
            } => {
                let data = json!({
                    "orderId": order_id,
                    "deliveryPersonId": delivery_person_id,
                });
                vec![
                    emit(names::order(order_id), &data),
                    emit(names::user(customer_id), &data),
                    emit(names::delivery(delivery_person_id), &data),
                ]
            }

            DomainEvent::DeliveryLocationChanged {
                order_id,
                delivery_person_id,
                location,
                coordinates,
            } => {
                let data = json!({
                    "orderId": order_id,
                    "deliveryPersonId": delivery_person_id,
                    "location": location,
                    "coordinates": coordinates,
                });
                let mut out = vec![emit(names::delivery(delivery_person_id), &data)];
                if let Some(order_id) = order_id {
                    out.push(emit(names::order_tracking(order_id), &data));
                    out.push(emit(names::order(order_id), &data));
                }
                out
            }

            DomainEvent::PaymentCompleted {
                order_id,
                customer_id,
                amount_cents,
            } => {
                let data = json!({ "orderId": order_id, "amountCents": amount_cents });
                vec![
                    emit(names::order(order_id), &data),
                    emit(names::user(customer_id), &data),
                ]
            }

            DomainEvent::PaymentFailed {
                order_id,
                customer_id,
                reason,
            } => {
                let data = json!({ "orderId": order_id, "reason": reason });
                vec![
                    emit(names::order(order_id), &data),
                    emit(names::user(customer_id), &data),
                ]
            }

            DomainEvent::SystemAnnouncement { role, message } => {
                let data = json!({ "message": message });
                match role {
                    Some(role) => vec![emit(role.broadcast_room().to_string(), &data)],
                    None => Role::all()
                        .iter()
                        .map(|role| emit(role.broadcast_room().to_string(), &data))
                        .collect(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_command_deserialization() {
        let json = r#"{"event":"join_room","data":{"roomName":"order_42","roomType":"order"}}"#;
        let cmd: ClientCommand = serde_json::from_str(json).unwrap();
        assert_eq!(
            cmd,
            ClientCommand::JoinRoom {
                room_name: Some("order_42".to_string()),
                room_type: Some("order".to_string()),
            }
        );
    }

    #[test]
    fn test_numeric_order_id_and_message_type_field() {
        let json = r#"{"event":"send_message","data":{"orderId":42,"message":"hi","type":"chat"}}"#;
        let cmd: ClientCommand = serde_json::from_str(json).unwrap();
        match cmd {
            ClientCommand::SendMessage {
                order_id,
                message,
                kind,
            } => {
                assert_eq!(order_id, Some(EntityId::new("42")));
                assert_eq!(message.as_deref(), Some("hi"));
                assert_eq!(kind.as_deref(), Some("chat"));
            }
            other => panic!("Expected SendMessage, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_fields_still_parse() {
        let cmd: ClientCommand =
            serde_json::from_str(r#"{"event":"subscribe_to_order","data":{}}"#).unwrap();
        assert_eq!(cmd, ClientCommand::SubscribeToOrder { order_id: None });
    }

    #[test]
    fn test_server_event_envelope() {
        let event = ServerEvent::RoomLeft {
            room_name: "order_7".to_string(),
        };
        let envelope = event.to_envelope();
        assert_eq!(envelope.event_type, "room_left");
        assert_eq!(envelope.data, json!({ "roomName": "order_7" }));

        let wire = envelope.to_json().unwrap();
        assert!(wire.contains(r#""event":"room_left""#));

        let parsed: Value = serde_json::from_str(&wire).unwrap();
        let timestamp = parsed["timestamp"].as_str().unwrap();
        assert!(timestamp.contains('T') && timestamp.ends_with('Z'), "{timestamp}");
    }

    #[test]
    fn test_entity_id_validation() {
        assert!(EntityId::new("order-42_a").validate("orderId").is_ok());
        assert!(EntityId::new("").validate("orderId").is_err());
        assert!(EntityId::new("42 OR 1=1").validate("orderId").is_err());
    }

    #[test]
    fn test_order_status_routing() {
        let event = DomainEvent::OrderStatusChanged {
            order_id: EntityId::new("42"),
            customer_id: UserId::new("u1"),
            restaurant_id: Some(EntityId::new("9")),
            status: "preparing".to_string(),
            details: Value::Null,
        };
        let rooms: Vec<String> = event.emissions().into_iter().map(|e| e.room).collect();
        assert_eq!(rooms, vec!["order_42", "user_u1", "restaurant_9_orders"]);
    }

    #[test]
    fn test_announcement_without_role_reaches_every_role_room() {
        let event = DomainEvent::SystemAnnouncement {
            role: None,
            message: "maintenance at midnight".to_string(),
        };
        assert_eq!(event.emissions().len(), 4);
    }
}
