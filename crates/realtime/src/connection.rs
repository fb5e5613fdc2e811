//! Connection management
//!
//! A [`Connection`] is one authenticated primary (WebSocket) session, tracked
//! in the [`ConnectionTable`]. Server-push streams and polling clients are
//! not connections; the fallback manager tracks them as room subscribers.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, OnceLock};

use forkcast_shared::{ConnectionId, Identity, RealtimeError, RealtimeResult, TransportKind, UserId};
use time::OffsetDateTime;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::events::{EventEnvelope, ServerEvent};
use crate::room::Subscriber;

/// Outbound half of a primary connection
pub type EventSender = mpsc::UnboundedSender<Arc<EventEnvelope>>;
pub type EventReceiver = mpsc::UnboundedReceiver<Arc<EventEnvelope>>;

/// Why a connection was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    ClientClosed,
    HeartbeatTimeout,
    TransportError,
    AuthenticationFailed,
    ServerShutdown,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::ClientClosed => "client_closed",
            DisconnectReason::HeartbeatTimeout => "heartbeat_timeout",
            DisconnectReason::TransportError => "transport_error",
            DisconnectReason::AuthenticationFailed => "authentication_failed",
            DisconnectReason::ServerShutdown => "server_shutdown",
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Represents an authenticated connection
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    /// Verified identity, fixed for the connection's lifetime
    pub identity: Identity,
    pub transport: TransportKind,
    pub connected_at: OffsetDateTime,
    sender: EventSender,
    last_heartbeat_ms: AtomicI64,
    close_token: CancellationToken,
    close_reason: OnceLock<DisconnectReason>,
}

impl Connection {
    pub fn new(identity: Identity, transport: TransportKind, sender: EventSender) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: ConnectionId::new(),
            identity,
            transport,
            connected_at: now,
            sender,
            last_heartbeat_ms: AtomicI64::new(unix_millis(now)),
            close_token: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    pub fn user_id(&self) -> &UserId {
        &self.identity.user_id
    }

    pub fn subscriber(&self) -> Subscriber {
        Subscriber::new(self.identity.user_id.clone(), self.id, self.transport)
    }

    /// Queue an envelope for this connection
    ///
    /// Fails once the receiving half is gone or the connection was closed.
    pub fn send(&self, envelope: Arc<EventEnvelope>) -> RealtimeResult<()> {
        if self.is_closed() {
            return Err(RealtimeError::Transport(format!(
                "connection {} is closed",
                self.id
            )));
        }
        self.sender.send(envelope).map_err(|_| {
            RealtimeError::Transport(format!("connection {} receiver dropped", self.id))
        })
    }

    pub fn send_event(&self, event: &ServerEvent) -> RealtimeResult<()> {
        self.send(Arc::new(event.to_envelope()))
    }

    /// Force the connection closed. Only the first call records a reason.
    pub fn close(&self, reason: DisconnectReason) -> bool {
        let first = self.close_reason.set(reason).is_ok();
        if first {
            tracing::debug!(
                connection_id = %self.id,
                user_id = %self.identity.user_id,
                reason = %reason,
                "Closing connection"
            );
        }
        self.close_token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.close_token.is_cancelled()
    }

    pub fn close_reason(&self) -> Option<DisconnectReason> {
        self.close_reason.get().copied()
    }

    /// Resolves once [`Connection::close`] has been called
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }

    pub fn close_token(&self) -> CancellationToken {
        self.close_token.clone()
    }

    pub fn touch_heartbeat(&self) {
        self.last_heartbeat_ms
            .store(unix_millis(OffsetDateTime::now_utc()), Ordering::Relaxed);
    }

    pub fn last_heartbeat_at(&self) -> OffsetDateTime {
        let ms = self.last_heartbeat_ms.load(Ordering::Relaxed);
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(ms) * 1_000_000)
            .unwrap_or(self.connected_at)
    }
}

fn unix_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Live primary connections indexed by id and by user
#[derive(Debug, Clone, Default)]
pub struct ConnectionTable {
    inner: Arc<RwLock<TableState>>,
}

#[derive(Debug, Default)]
struct TableState {
    by_id: HashMap<ConnectionId, Arc<Connection>>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, conn: Arc<Connection>) {
        let mut state = self.inner.write().await;
        state
            .by_user
            .entry(conn.identity.user_id.clone())
            .or_default()
            .insert(conn.id);
        state.by_id.insert(conn.id, Arc::clone(&conn));

        tracing::info!(
            connection_id = %conn.id,
            user_id = %conn.identity.user_id,
            role = %conn.identity.role,
            total_connections = state.by_id.len(),
            "Connection added"
        );
    }

    /// Remove a connection; returns it only on the first call
    pub async fn remove(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let mut state = self.inner.write().await;
        let conn = state.by_id.remove(&id)?;

        if let Some(ids) = state.by_user.get_mut(&conn.identity.user_id) {
            ids.remove(&id);
            if ids.is_empty() {
                state.by_user.remove(&conn.identity.user_id);
            }
        }

        tracing::info!(
            connection_id = %id,
            user_id = %conn.identity.user_id,
            remaining_connections = state.by_id.len(),
            "Connection removed"
        );
        Some(conn)
    }

    pub async fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.inner.read().await.by_id.get(&id).cloned()
    }

    pub async fn for_user(&self, user_id: &UserId) -> Vec<Arc<Connection>> {
        let state = self.inner.read().await;
        state
            .by_user
            .get(user_id)
            .map(|ids| ids.iter().filter_map(|id| state.by_id.get(id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Whether the identity has at least one open primary connection
    pub async fn has_live(&self, user_id: &UserId) -> bool {
        let state = self.inner.read().await;
        state.by_user.get(user_id).is_some_and(|ids| {
            ids.iter()
                .filter_map(|id| state.by_id.get(id))
                .any(|conn| !conn.is_closed())
        })
    }

    pub async fn count(&self) -> usize {
        self.inner.read().await.by_id.len()
    }

    pub async fn users(&self) -> HashSet<UserId> {
        self.inner.read().await.by_user.keys().cloned().collect()
    }

    pub async fn all(&self) -> Vec<Arc<Connection>> {
        self.inner.read().await.by_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkcast_shared::Role;

    fn connection(user: &str) -> (Arc<Connection>, EventReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Connection::new(Identity::new(user, Role::Customer), TransportKind::Primary, tx);
        (Arc::new(conn), rx)
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let (conn, mut rx) = connection("u1");

        conn.send_event(&ServerEvent::Ping { timestamp: 1 }).unwrap();
        assert_eq!(rx.try_recv().unwrap().event_type, "ping");

        assert!(conn.close(DisconnectReason::HeartbeatTimeout));
        assert!(!conn.close(DisconnectReason::ClientClosed));
        assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));
        conn.closed().await;

        assert!(matches!(
            conn.send_event(&ServerEvent::Ping { timestamp: 2 }),
            Err(RealtimeError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_send_fails_after_receiver_dropped() {
        let (conn, rx) = connection("u1");
        drop(rx);
        assert!(conn.send_event(&ServerEvent::Ping { timestamp: 1 }).is_err());
    }

    #[tokio::test]
    async fn test_table_indexes_by_user() {
        let table = ConnectionTable::new();
        let (a, _rx_a) = connection("u1");
        let (b, _rx_b) = connection("u1");
        let (c, _rx_c) = connection("u2");

        table.insert(Arc::clone(&a)).await;
        table.insert(Arc::clone(&b)).await;
        table.insert(Arc::clone(&c)).await;

        assert_eq!(table.count().await, 3);
        assert_eq!(table.users().await.len(), 2);
        assert_eq!(table.for_user(&UserId::new("u1")).await.len(), 2);

        assert!(table.remove(a.id).await.is_some());
        assert!(table.remove(a.id).await.is_none());
        assert!(table.has_live(&UserId::new("u1")).await);

        b.close(DisconnectReason::ClientClosed);
        assert!(!table.has_live(&UserId::new("u1")).await);

        table.remove(b.id).await;
        assert!(table.for_user(&UserId::new("u1")).await.is_empty());
    }
}
