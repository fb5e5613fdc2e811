//! Room registry for pub/sub
//!
//! Owns room lifecycle (lazy creation, membership, idle reclamation) and the
//! per-identity subscription index. A connection is a member of a room if and
//! only if that room appears in the index entry for the connection; both sides
//! are updated under the same write lock.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use forkcast_shared::{
    ConnectionId, Identity, RealtimeError, RealtimeResult, Role, TransportKind, UserId,
};
use serde::Serialize;
use tokio::sync::RwLock;
use tokio::time::Instant;

const MAX_ROOM_NAME_LEN: usize = 128;

// =============================================================================
// Naming
// =============================================================================

/// Deterministic room names shared by producers and consumers
pub mod names {
    use std::fmt::Display;

    pub fn user(id: impl Display) -> String {
        format!("user_{id}")
    }

    pub fn restaurant(id: impl Display) -> String {
        format!("restaurant_{id}")
    }

    pub fn restaurant_orders(id: impl Display) -> String {
        format!("restaurant_{id}_orders")
    }

    pub fn restaurant_kitchen(id: impl Display) -> String {
        format!("restaurant_{id}_kitchen")
    }

    pub fn delivery(id: impl Display) -> String {
        format!("delivery_{id}")
    }

    pub fn delivery_active(id: impl Display) -> String {
        format!("delivery_active_{id}")
    }

    pub fn order(id: impl Display) -> String {
        format!("order_{id}")
    }

    pub fn order_tracking(id: impl Display) -> String {
        format!("order_{id}_tracking")
    }
}

/// Kind of a room, mostly for stats and client acknowledgments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomKind {
    User,
    Restaurant,
    Delivery,
    Order,
    OrderTracking,
    RoleBroadcast,
    System,
}

impl RoomKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoomKind::User => "user",
            RoomKind::Restaurant => "restaurant",
            RoomKind::Delivery => "delivery",
            RoomKind::Order => "order",
            RoomKind::OrderTracking => "order_tracking",
            RoomKind::RoleBroadcast => "role_broadcast",
            RoomKind::System => "system",
        }
    }

    /// Derive the kind from a room name following the naming convention
    pub fn infer(name: &str) -> Self {
        if Role::all().iter().any(|r| r.broadcast_room() == name) {
            RoomKind::RoleBroadcast
        } else if name.starts_with("user_") {
            RoomKind::User
        } else if name.starts_with("restaurant_") {
            RoomKind::Restaurant
        } else if name.starts_with("delivery_") {
            RoomKind::Delivery
        } else if name.starts_with("order_") && name.ends_with("_tracking") {
            RoomKind::OrderTracking
        } else if name.starts_with("order_") {
            RoomKind::Order
        } else {
            RoomKind::System
        }
    }
}

impl fmt::Display for RoomKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RoomKind {
    type Err = RealtimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "user" => Ok(RoomKind::User),
            "restaurant" => Ok(RoomKind::Restaurant),
            "delivery" => Ok(RoomKind::Delivery),
            "order" => Ok(RoomKind::Order),
            "order_tracking" | "tracking" => Ok(RoomKind::OrderTracking),
            "role_broadcast" | "role" | "broadcast" => Ok(RoomKind::RoleBroadcast),
            "system" => Ok(RoomKind::System),
            other => Err(RealtimeError::validation(format!(
                "Unknown room type: {other}"
            ))),
        }
    }
}

/// Domain entities that own a fixed set of rooms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    User,
    Restaurant,
    Delivery,
    Order,
}

/// Rooms belonging to a domain entity, primary room first
pub fn entity_rooms(kind: EntityKind, id: impl fmt::Display) -> Vec<(String, RoomKind)> {
    match kind {
        EntityKind::User => vec![(names::user(&id), RoomKind::User)],
        EntityKind::Restaurant => vec![
            (names::restaurant(&id), RoomKind::Restaurant),
            (names::restaurant_orders(&id), RoomKind::Restaurant),
            (names::restaurant_kitchen(&id), RoomKind::Restaurant),
        ],
        EntityKind::Delivery => vec![
            (names::delivery(&id), RoomKind::Delivery),
            (names::delivery_active(&id), RoomKind::Delivery),
        ],
        EntityKind::Order => vec![
            (names::order(&id), RoomKind::Order),
            (names::order_tracking(&id), RoomKind::OrderTracking),
        ],
    }
}

/// Rooms every connection of this identity joins on authentication
pub fn default_rooms(identity: &Identity) -> Vec<(String, RoomKind)> {
    let mut rooms = vec![
        (names::user(&identity.user_id), RoomKind::User),
        (
            identity.role.broadcast_room().to_string(),
            RoomKind::RoleBroadcast,
        ),
    ];

    match identity.role {
        Role::RestaurantOwner => {
            if let Some(restaurant_id) = identity.restaurant_id() {
                rooms.extend(entity_rooms(EntityKind::Restaurant, restaurant_id));
            }
        }
        Role::DeliveryPerson => {
            rooms.push((names::delivery(&identity.user_id), RoomKind::Delivery));
        }
        Role::Customer | Role::Admin => {}
    }

    rooms
}

pub fn validate_room_name(name: &str) -> RealtimeResult<()> {
    if name.is_empty() || name.len() > MAX_ROOM_NAME_LEN {
        return Err(RealtimeError::validation(format!(
            "roomName must be 1-{MAX_ROOM_NAME_LEN} characters"
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(RealtimeError::validation(
            "roomName may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Check that `identity` may join `name` on its own request
pub fn authorize_join(identity: &Identity, name: &str) -> RealtimeResult<()> {
    if identity.is_admin() {
        return Ok(());
    }
    if name == Role::Admin.broadcast_room() {
        return Err(RealtimeError::Forbidden(
            "Only administrators may join the admin room".to_string(),
        ));
    }
    if let Some(owner) = name.strip_prefix("user_") {
        if owner != identity.user_id.as_str() {
            return Err(RealtimeError::Forbidden(format!(
                "Cannot join another user's room: {name}"
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Registry
// =============================================================================

/// A room member as seen by the dispatcher
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscriber {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub transport: TransportKind,
}

impl Subscriber {
    pub fn new(user_id: UserId, connection_id: ConnectionId, transport: TransportKind) -> Self {
        Self {
            user_id,
            connection_id,
            transport,
        }
    }
}

#[derive(Debug)]
struct Room {
    kind: RoomKind,
    members: HashMap<ConnectionId, Subscriber>,
    created_at: Instant,
    last_activity_at: Instant,
    empty_since: Option<Instant>,
}

impl Room {
    fn new(kind: RoomKind, now: Instant) -> Self {
        Self {
            kind,
            members: HashMap::new(),
            created_at: now,
            last_activity_at: now,
            empty_since: Some(now),
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    rooms: HashMap<String, Room>,
    /// user -> connection -> rooms joined by that connection
    subscriptions: HashMap<UserId, HashMap<ConnectionId, HashSet<String>>>,
}

/// Result of a join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    pub room: String,
    pub kind: RoomKind,
    pub created: bool,
    pub already_member: bool,
    pub member_count: usize,
    /// Room was at or above the soft member limit when this join landed
    pub over_capacity: bool,
}

/// Point-in-time view of a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub name: String,
    pub kind: RoomKind,
    pub member_count: usize,
    pub age: Duration,
    pub idle_for: Duration,
    pub empty_for: Option<Duration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoomStats {
    pub total: usize,
    pub empty: usize,
    pub members: usize,
}

/// In-memory room index shared by the gateway, dispatcher and fallback manager
#[derive(Debug, Clone)]
pub struct RoomRegistry {
    state: Arc<RwLock<RegistryState>>,
    max_users_per_room: usize,
    inactive_room_timeout: Duration,
}

impl RoomRegistry {
    pub fn new(max_users_per_room: usize, inactive_room_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(RegistryState::default())),
            max_users_per_room,
            inactive_room_timeout,
        }
    }

    /// Add a connection to a room, creating the room if needed. Idempotent.
    ///
    /// The member limit is soft: an overflowing join is logged and flagged
    /// but still applied.
    pub async fn join(&self, subscriber: &Subscriber, room: &str, kind: RoomKind) -> JoinOutcome {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let mut created = false;
        let entry = state.rooms.entry(room.to_string()).or_insert_with(|| {
            created = true;
            Room::new(kind, now)
        });

        let already_member = entry.members.contains_key(&subscriber.connection_id);
        let over_capacity = !already_member && entry.members.len() >= self.max_users_per_room;
        if over_capacity {
            let warning = RealtimeError::CapacityExceeded {
                room: room.to_string(),
                members: entry.members.len() + 1,
                limit: self.max_users_per_room,
            };
            tracing::warn!(
                room = %room,
                user_id = %subscriber.user_id,
                connection_id = %subscriber.connection_id,
                "{warning}"
            );
        }

        entry
            .members
            .insert(subscriber.connection_id, subscriber.clone());
        entry.last_activity_at = now;
        entry.empty_since = None;
        let member_count = entry.members.len();
        let kind = entry.kind;

        state
            .subscriptions
            .entry(subscriber.user_id.clone())
            .or_default()
            .entry(subscriber.connection_id)
            .or_default()
            .insert(room.to_string());

        if !already_member {
            tracing::debug!(
                room = %room,
                user_id = %subscriber.user_id,
                connection_id = %subscriber.connection_id,
                transport = %subscriber.transport,
                room_size = member_count,
                "Connection joined room"
            );
        }

        JoinOutcome {
            room: room.to_string(),
            kind,
            created,
            already_member,
            member_count,
            over_capacity,
        }
    }

    /// Remove a connection from a room. Returns whether it was a member.
    pub async fn leave(&self, user_id: &UserId, connection_id: ConnectionId, room: &str) -> bool {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let state = &mut *state;

        let removed = Self::detach(&mut state.rooms, connection_id, room, now);

        if let Some(connections) = state.subscriptions.get_mut(user_id) {
            if let Some(rooms) = connections.get_mut(&connection_id) {
                rooms.remove(room);
            }
        }

        if removed {
            tracing::debug!(
                room = %room,
                user_id = %user_id,
                connection_id = %connection_id,
                "Connection left room"
            );
        }
        removed
    }

    /// Remove a connection from every room it joined and drop its index
    /// entry. Returns the rooms vacated; a second call returns nothing.
    pub async fn leave_all(&self, user_id: &UserId, connection_id: ConnectionId) -> Vec<String> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let state = &mut *state;

        let Some(connections) = state.subscriptions.get_mut(user_id) else {
            return Vec::new();
        };
        let joined = connections.remove(&connection_id).unwrap_or_default();
        if connections.is_empty() {
            state.subscriptions.remove(user_id);
        }

        let mut vacated: Vec<String> = joined
            .into_iter()
            .filter(|room| Self::detach(&mut state.rooms, connection_id, room, now))
            .collect();
        vacated.sort();

        if !vacated.is_empty() {
            tracing::debug!(
                user_id = %user_id,
                connection_id = %connection_id,
                room_count = vacated.len(),
                "Removed connection from all rooms"
            );
        }
        vacated
    }

    fn detach(
        rooms: &mut HashMap<String, Room>,
        connection_id: ConnectionId,
        room: &str,
        now: Instant,
    ) -> bool {
        let Some(entry) = rooms.get_mut(room) else {
            return false;
        };
        if entry.members.remove(&connection_id).is_none() {
            return false;
        }
        entry.last_activity_at = now;
        if entry.members.is_empty() {
            entry.empty_since = Some(now);
        }
        true
    }

    /// Make sure the rooms of a domain entity exist. Returns their names.
    pub async fn create_entity_rooms(&self, kind: EntityKind, id: impl fmt::Display) -> Vec<String> {
        let now = Instant::now();
        let rooms = entity_rooms(kind, id);
        let mut state = self.state.write().await;

        rooms
            .into_iter()
            .map(|(name, kind)| {
                state
                    .rooms
                    .entry(name.clone())
                    .or_insert_with(|| Room::new(kind, now));
                name
            })
            .collect()
    }

    /// Delete rooms that have been empty for longer than the inactivity timeout
    pub async fn sweep(&self) -> Vec<String> {
        self.sweep_at(Instant::now()).await
    }

    pub async fn sweep_at(&self, now: Instant) -> Vec<String> {
        let timeout = self.inactive_room_timeout;
        let mut state = self.state.write().await;

        let mut removed = Vec::new();
        state.rooms.retain(|name, room| {
            let expired = room.members.is_empty()
                && room
                    .empty_since
                    .is_some_and(|since| now.saturating_duration_since(since) > timeout);
            if expired {
                removed.push(name.clone());
            }
            !expired
        });

        if !removed.is_empty() {
            tracing::debug!(
                removed = removed.len(),
                remaining = state.rooms.len(),
                "Swept inactive rooms"
            );
        }
        removed
    }

    /// Members of a room at this moment; marks the room as active
    pub async fn members_for_delivery(&self, room: &str) -> Option<Vec<Subscriber>> {
        let mut state = self.state.write().await;
        let entry = state.rooms.get_mut(room)?;
        entry.last_activity_at = Instant::now();
        Some(entry.members.values().cloned().collect())
    }

    pub async fn members(&self, room: &str) -> Vec<Subscriber> {
        let state = self.state.read().await;
        state
            .rooms
            .get(room)
            .map(|r| r.members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, room: &str, connection_id: ConnectionId) -> bool {
        let state = self.state.read().await;
        state
            .rooms
            .get(room)
            .is_some_and(|r| r.members.contains_key(&connection_id))
    }

    /// Union of the rooms joined by any connection of this identity
    pub async fn rooms_of(&self, user_id: &UserId) -> Vec<String> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state
            .subscriptions
            .get(user_id)
            .map(|conns| conns.values().flatten().cloned().collect::<HashSet<_>>())
            .unwrap_or_default()
            .into_iter()
            .collect();
        rooms.sort();
        rooms
    }

    pub async fn connection_rooms(&self, user_id: &UserId, connection_id: ConnectionId) -> Vec<String> {
        let state = self.state.read().await;
        let mut rooms: Vec<String> = state
            .subscriptions
            .get(user_id)
            .and_then(|conns| conns.get(&connection_id))
            .map(|rooms| rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Connections of this identity currently present in the index
    pub async fn connections_of(&self, user_id: &UserId) -> Vec<ConnectionId> {
        let state = self.state.read().await;
        state
            .subscriptions
            .get(user_id)
            .map(|conns| conns.keys().copied().collect())
            .unwrap_or_default()
    }

    pub async fn room_info(&self, room: &str) -> Option<RoomInfo> {
        let now = Instant::now();
        let state = self.state.read().await;
        state.rooms.get(room).map(|r| RoomInfo {
            name: room.to_string(),
            kind: r.kind,
            member_count: r.members.len(),
            age: now.saturating_duration_since(r.created_at),
            idle_for: now.saturating_duration_since(r.last_activity_at),
            empty_for: r.empty_since.map(|t| now.saturating_duration_since(t)),
        })
    }

    pub async fn member_count(&self, room: &str) -> usize {
        let state = self.state.read().await;
        state.rooms.get(room).map(|r| r.members.len()).unwrap_or(0)
    }

    pub async fn room_exists(&self, room: &str) -> bool {
        self.state.read().await.rooms.contains_key(room)
    }

    pub async fn stats(&self) -> RoomStats {
        let state = self.state.read().await;
        state
            .rooms
            .values()
            .fold(RoomStats::default(), |mut stats, room| {
                stats.total += 1;
                stats.members += room.members.len();
                if room.members.is_empty() {
                    stats.empty += 1;
                }
                stats
            })
    }
}
