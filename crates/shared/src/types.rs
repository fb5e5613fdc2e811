//! Common types used across Forkcast

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
///
/// User ids are issued by the platform's identity service and are opaque to
/// the realtime core, so they are kept as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Connection ID wrapper (server-generated, one per transport session)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for ConnectionId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Roles
// =============================================================================

/// Platform role carried by a verified identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    RestaurantOwner,
    DeliveryPerson,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Customer => "customer",
            Role::RestaurantOwner => "restaurant_owner",
            Role::DeliveryPerson => "delivery_person",
            Role::Admin => "admin",
        }
    }

    /// Name of the static broadcast room every identity of this role joins
    pub fn broadcast_room(&self) -> &'static str {
        match self {
            Role::Customer => "customers",
            Role::RestaurantOwner => "restaurants",
            Role::DeliveryPerson => "delivery_persons",
            Role::Admin => "admin",
        }
    }

    pub fn all() -> [Role; 4] {
        [
            Role::Customer,
            Role::RestaurantOwner,
            Role::DeliveryPerson,
            Role::Admin,
        ]
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown role: {0}")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "customer" | "user" => Ok(Role::Customer),
            "restaurant_owner" | "restaurant" => Ok(Role::RestaurantOwner),
            "delivery_person" | "delivery" | "driver" => Ok(Role::DeliveryPerson),
            "admin" => Ok(Role::Admin),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

// =============================================================================
// Identity
// =============================================================================

/// A verified identity bound to a connection for its whole lifetime
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: UserId,
    pub role: Role,
    /// Additional claims issued alongside the identity (e.g. `restaurant_id`)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub issued_claims: Map<String, Value>,
}

impl Identity {
    pub fn new(user_id: impl Into<UserId>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            role,
            issued_claims: Map::new(),
        }
    }

    pub fn with_claim(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.issued_claims.insert(key.into(), value.into());
        self
    }

    /// Read a claim as a string, accepting numeric claims as well
    pub fn claim_str(&self, key: &str) -> Option<String> {
        match self.issued_claims.get(key)? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Restaurant owned by this identity, if any
    pub fn restaurant_id(&self) -> Option<String> {
        self.claim_str("restaurant_id")
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Transport a connection is currently delivered over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Persistent duplex connection (WebSocket)
    Primary,
    /// Server-push event stream
    Sse,
    /// Client-driven polling
    Polling,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Primary => "primary",
            TransportKind::Sse => "sse",
            TransportKind::Polling => "polling",
        }
    }

    pub fn is_fallback(&self) -> bool {
        !matches!(self, TransportKind::Primary)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
