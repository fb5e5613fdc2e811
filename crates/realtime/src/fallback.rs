//! Fallback transports
//!
//! Degraded-mode substitutes for the primary connection:
//!
//! - **Server-push streams**: a bounded channel per stream, drained by the HTTP
//!   layer into a `text/event-stream` response. A `connected` event is written
//!   first and a `keep_alive` every keep-alive interval.
//! - **Polling**: a bounded queue per `(user, clientId)` registration, drained
//!   by the retrieval endpoint.
//!
//! Fallback clients join the same rooms a primary connection would, as
//! subscribers of transport kind `sse` or `polling`, so the dispatcher reaches
//! them without producers knowing which transport is in use.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use forkcast_shared::{
    ConnectionId, Identity, RealtimeError, RealtimeResult, TransportKind, UserId,
};
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::Instant;

use crate::config::RealtimeConfig;
use crate::events::{now_millis, EntityId, EventEnvelope, ServerEvent};
use crate::room::{default_rooms, entity_rooms, EntityKind, RoomRegistry, Subscriber};
use crate::scheduler::{Scheduler, TimerHandle};

pub type StreamReceiver = mpsc::Receiver<Arc<EventEnvelope>>;

/// Timing and sizing for the fallback transports
#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub keepalive_interval: Duration,
    pub stream_idle_timeout: Duration,
    pub polling_idle_timeout: Duration,
    pub polling_queue_capacity: usize,
    pub stream_buffer: usize,
    pub min_polling_interval: Duration,
    pub max_polling_interval: Duration,
}

impl From<&RealtimeConfig> for FallbackSettings {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            keepalive_interval: config.stream_keepalive_interval,
            stream_idle_timeout: config.stream_idle_timeout,
            polling_idle_timeout: config.polling_idle_timeout,
            polling_queue_capacity: config.polling_queue_capacity,
            stream_buffer: config.stream_buffer,
            min_polling_interval: config.min_polling_interval,
            max_polling_interval: config.max_polling_interval,
        }
    }
}

/// Identifies a polling registration: one per (user, clientId)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PollingKey {
    pub user_id: UserId,
    pub client_id: String,
}

impl PollingKey {
    pub fn new(user_id: UserId, client_id: impl Into<String>) -> Self {
        Self {
            user_id,
            client_id: client_id.into(),
        }
    }
}

impl fmt::Display for PollingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user_id, self.client_id)
    }
}

struct StreamEntry {
    identity: Identity,
    sender: mpsc::Sender<Arc<EventEnvelope>>,
    last_ack: Instant,
    keepalive: TimerHandle,
}

struct PollingEntry {
    connection_id: ConnectionId,
    interval: Duration,
    registered_at: OffsetDateTime,
    last_poll: Instant,
    queue: VecDeque<Arc<EventEnvelope>>,
    dropped: u64,
}

/// A freshly opened stream; the receiver feeds the HTTP response body
#[derive(Debug)]
pub struct StreamSubscription {
    pub connection_id: ConnectionId,
    pub rooms: Vec<String>,
    pub receiver: StreamReceiver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollingTicket {
    pub polling_key: String,
    pub connection_id: ConnectionId,
    pub interval_ms: u64,
    pub rooms: Vec<String>,
}

/// Events drained by one poll
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollBatch {
    pub events: Vec<EventEnvelope>,
    pub next_poll_ms: u64,
    /// Events discarded since the previous poll because the queue was full
    pub dropped: u64,
}

/// Outcome of writing one event to a fallback client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackDelivery {
    Delivered,
    /// Stream buffer full or queue overflowed; the event (or an older one) was lost
    Dropped,
    /// No such client, or its transport is gone
    Gone,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackSweep {
    pub streams: usize,
    pub polls: usize,
}

#[derive(Clone)]
pub struct FallbackTransportManager {
    rooms: RoomRegistry,
    scheduler: Scheduler,
    settings: FallbackSettings,
    streams: Arc<DashMap<ConnectionId, StreamEntry>>,
    polls: Arc<DashMap<PollingKey, PollingEntry>>,
    poll_index: Arc<DashMap<ConnectionId, PollingKey>>,
}

impl FallbackTransportManager {
    pub fn new(rooms: RoomRegistry, scheduler: Scheduler, settings: FallbackSettings) -> Self {
        Self {
            rooms,
            scheduler,
            settings,
            streams: Arc::new(DashMap::new()),
            polls: Arc::new(DashMap::new()),
            poll_index: Arc::new(DashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Server-push streams
    // -------------------------------------------------------------------------

    /// Open a stream for `identity`, joining its default rooms plus the rooms
    /// of `order_id` when given
    pub async fn register_stream(
        &self,
        identity: Identity,
        order_id: Option<EntityId>,
    ) -> RealtimeResult<StreamSubscription> {
        if let Some(order_id) = &order_id {
            order_id.validate("orderId")?;
        }

        let (sender, receiver) = mpsc::channel(self.settings.stream_buffer);
        let connection_id = ConnectionId::new();
        let subscriber = Subscriber::new(identity.user_id.clone(), connection_id, TransportKind::Sse);
        let rooms = self
            .join_rooms(&subscriber, &identity, order_id.iter().cloned())
            .await;

        let connected = ServerEvent::Connected {
            connection_id,
            transport: TransportKind::Sse,
        };
        if sender.try_send(Arc::new(connected.to_envelope())).is_err() {
            self.rooms.leave_all(&identity.user_id, connection_id).await;
            return Err(RealtimeError::Transport(
                "stream closed before it was registered".to_string(),
            ));
        }

        let manager = self.clone();
        let keepalive = self
            .scheduler
            .every(self.settings.keepalive_interval, move || {
                let manager = manager.clone();
                async move { manager.keep_alive(connection_id).await }
            });

        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            rooms = rooms.len(),
            "Event stream registered"
        );

        self.streams.insert(
            connection_id,
            StreamEntry {
                identity,
                sender,
                last_ack: Instant::now(),
                keepalive,
            },
        );

        Ok(StreamSubscription {
            connection_id,
            rooms,
            receiver,
        })
    }

    /// Discard a stream and vacate its rooms. Returns false if already gone.
    pub async fn unregister_stream(&self, connection_id: ConnectionId) -> bool {
        let Some((_, entry)) = self.streams.remove(&connection_id) else {
            return false;
        };
        entry.keepalive.cancel();
        self.rooms
            .leave_all(&entry.identity.user_id, connection_id)
            .await;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %entry.identity.user_id,
            "Event stream closed"
        );
        true
    }

    async fn keep_alive(&self, connection_id: ConnectionId) {
        let envelope = Arc::new(
            ServerEvent::KeepAlive {
                timestamp: now_millis(),
            }
            .to_envelope(),
        );

        let outcome = match self.streams.get_mut(&connection_id) {
            Some(mut entry) => match entry.sender.try_send(envelope) {
                Ok(()) => {
                    entry.last_ack = Instant::now();
                    FallbackDelivery::Delivered
                }
                Err(TrySendError::Full(_)) => FallbackDelivery::Dropped,
                Err(TrySendError::Closed(_)) => FallbackDelivery::Gone,
            },
            None => return,
        };

        match outcome {
            FallbackDelivery::Gone => {
                self.unregister_stream(connection_id).await;
            }
            FallbackDelivery::Dropped => {
                tracing::debug!(connection_id = %connection_id, "Keep-alive skipped, stream buffer full");
            }
            FallbackDelivery::Delivered => {}
        }
    }

    // -------------------------------------------------------------------------
    // Polling
    // -------------------------------------------------------------------------

    /// Register (or refresh) a polling client
    ///
    /// The declared interval is clamped to the allowed range. Re-registering
    /// an existing `(user, clientId)` keeps its queue and connection id.
    pub async fn register_polling(
        &self,
        identity: &Identity,
        client_id: &str,
        interval_ms: Option<u64>,
        order_ids: Vec<EntityId>,
    ) -> RealtimeResult<PollingTicket> {
        validate_client_id(client_id)?;
        for order_id in &order_ids {
            order_id.validate("orderIds")?;
        }

        let interval = self.clamp_interval(interval_ms);
        let key = PollingKey::new(identity.user_id.clone(), client_id);
        let now = Instant::now();

        let (connection_id, fresh) = match self.polls.get_mut(&key) {
            Some(mut entry) => {
                entry.interval = interval;
                entry.last_poll = now;
                (entry.connection_id, false)
            }
            None => {
                let connection_id = ConnectionId::new();
                let mut queue = VecDeque::with_capacity(self.settings.polling_queue_capacity);
                queue.push_back(Arc::new(
                    ServerEvent::FallbackActivated {
                        transport: TransportKind::Polling,
                        connection_id,
                        interval_ms: Some(interval.as_millis() as u64),
                    }
                    .to_envelope(),
                ));
                self.polls.insert(
                    key.clone(),
                    PollingEntry {
                        connection_id,
                        interval,
                        registered_at: OffsetDateTime::now_utc(),
                        last_poll: now,
                        queue,
                        dropped: 0,
                    },
                );
                self.poll_index.insert(connection_id, key.clone());
                (connection_id, true)
            }
        };

        let subscriber =
            Subscriber::new(identity.user_id.clone(), connection_id, TransportKind::Polling);
        let rooms = self.join_rooms(&subscriber, identity, order_ids).await;

        tracing::info!(
            connection_id = %connection_id,
            user_id = %identity.user_id,
            polling_key = %key,
            interval_ms = interval.as_millis() as u64,
            fresh,
            "Polling client registered"
        );

        Ok(PollingTicket {
            polling_key: key.to_string(),
            connection_id,
            interval_ms: interval.as_millis() as u64,
            rooms,
        })
    }

    /// Remove a polling registration and vacate its rooms
    pub async fn unregister_polling(&self, user_id: &UserId, client_id: &str) -> bool {
        let key = PollingKey::new(user_id.clone(), client_id);
        let Some((_, entry)) = self.polls.remove(&key) else {
            return false;
        };
        self.poll_index.remove(&entry.connection_id);
        self.rooms.leave_all(user_id, entry.connection_id).await;

        tracing::info!(
            connection_id = %entry.connection_id,
            polling_key = %key,
            "Polling client removed"
        );
        true
    }

    /// Drain the pending queue of a polling client
    pub fn poll(&self, user_id: &UserId, client_id: &str) -> RealtimeResult<PollBatch> {
        let key = PollingKey::new(user_id.clone(), client_id);
        let mut entry = self
            .polls
            .get_mut(&key)
            .ok_or_else(|| RealtimeError::NotFound(format!("No polling registration for {key}")))?;

        entry.last_poll = Instant::now();
        let events = entry.queue.drain(..).map(Arc::unwrap_or_clone).collect();
        let dropped = std::mem::take(&mut entry.dropped);

        Ok(PollBatch {
            events,
            next_poll_ms: entry.interval.as_millis() as u64,
            dropped,
        })
    }

    fn clamp_interval(&self, interval_ms: Option<u64>) -> Duration {
        let requested = interval_ms
            .map(Duration::from_millis)
            .unwrap_or(self.settings.min_polling_interval * 5);
        requested.clamp(
            self.settings.min_polling_interval,
            self.settings.max_polling_interval,
        )
    }

    // -------------------------------------------------------------------------
    // Delivery
    // -------------------------------------------------------------------------

    /// Write an envelope to one fallback client
    pub async fn deliver(
        &self,
        subscriber: &Subscriber,
        envelope: &Arc<EventEnvelope>,
    ) -> FallbackDelivery {
        match subscriber.transport {
            TransportKind::Sse => self.deliver_stream(subscriber.connection_id, envelope).await,
            TransportKind::Polling => self.enqueue_poll(subscriber.connection_id, envelope),
            TransportKind::Primary => FallbackDelivery::Gone,
        }
    }

    async fn deliver_stream(
        &self,
        connection_id: ConnectionId,
        envelope: &Arc<EventEnvelope>,
    ) -> FallbackDelivery {
        let outcome = match self.streams.get(&connection_id) {
            Some(entry) => match entry.sender.try_send(Arc::clone(envelope)) {
                Ok(()) => FallbackDelivery::Delivered,
                Err(TrySendError::Full(_)) => FallbackDelivery::Dropped,
                Err(TrySendError::Closed(_)) => FallbackDelivery::Gone,
            },
            None => FallbackDelivery::Gone,
        };

        match outcome {
            FallbackDelivery::Gone => {
                if self.unregister_stream(connection_id).await {
                    tracing::warn!(connection_id = %connection_id, "Event stream write failed, stream discarded");
                }
            }
            FallbackDelivery::Dropped => {
                tracing::warn!(connection_id = %connection_id, "Event stream buffer full, event dropped");
            }
            FallbackDelivery::Delivered => {}
        }
        outcome
    }

    fn enqueue_poll(&self, connection_id: ConnectionId, envelope: &Arc<EventEnvelope>) -> FallbackDelivery {
        let Some(key) = self.poll_index.get(&connection_id).map(|k| k.clone()) else {
            return FallbackDelivery::Gone;
        };
        let Some(mut entry) = self.polls.get_mut(&key) else {
            return FallbackDelivery::Gone;
        };

        let mut outcome = FallbackDelivery::Delivered;
        while entry.queue.len() >= self.settings.polling_queue_capacity {
            entry.queue.pop_front();
            entry.dropped += 1;
            outcome = FallbackDelivery::Dropped;
        }
        entry.queue.push_back(Arc::clone(envelope));

        if outcome == FallbackDelivery::Dropped {
            tracing::debug!(polling_key = %key, "Polling queue full, dropped oldest event");
        }
        outcome
    }

    /// Push an envelope to every fallback client of one identity
    pub async fn push_to_identity(&self, user_id: &UserId, envelope: &Arc<EventEnvelope>) -> usize {
        let streams: Vec<ConnectionId> = self
            .streams
            .iter()
            .filter(|entry| entry.identity.user_id == *user_id)
            .map(|entry| *entry.key())
            .collect();
        let polls: Vec<ConnectionId> = self
            .polls
            .iter()
            .filter(|entry| entry.key().user_id == *user_id)
            .map(|entry| entry.connection_id)
            .collect();

        self.push_all(streams, polls, envelope).await
    }

    /// Push an envelope to every open fallback client
    pub async fn broadcast_push(&self, envelope: &Arc<EventEnvelope>) -> usize {
        let streams: Vec<ConnectionId> = self.streams.iter().map(|entry| *entry.key()).collect();
        let polls: Vec<ConnectionId> = self.polls.iter().map(|entry| entry.connection_id).collect();
        self.push_all(streams, polls, envelope).await
    }

    async fn push_all(
        &self,
        streams: Vec<ConnectionId>,
        polls: Vec<ConnectionId>,
        envelope: &Arc<EventEnvelope>,
    ) -> usize {
        let mut delivered = 0;
        for id in streams {
            if self.deliver_stream(id, envelope).await == FallbackDelivery::Delivered {
                delivered += 1;
            }
        }
        for id in polls {
            if self.enqueue_poll(id, envelope) != FallbackDelivery::Gone {
                delivered += 1;
            }
        }
        delivered
    }

    // -------------------------------------------------------------------------
    // Reclamation
    // -------------------------------------------------------------------------

    /// Drop streams without a keep-alive acknowledgment and polling clients
    /// that stopped polling
    pub async fn sweep(&self) -> FallbackSweep {
        let now = Instant::now();
        let stream_timeout = self.settings.stream_idle_timeout;
        let poll_timeout = self.settings.polling_idle_timeout;

        let stale_streams: Vec<ConnectionId> = self
            .streams
            .iter()
            .filter(|entry| {
                entry.sender.is_closed()
                    || now.saturating_duration_since(entry.last_ack) > stream_timeout
            })
            .map(|entry| *entry.key())
            .collect();
        let stale_polls: Vec<PollingKey> = self
            .polls
            .iter()
            .filter(|entry| now.saturating_duration_since(entry.last_poll) > poll_timeout)
            .map(|entry| entry.key().clone())
            .collect();

        let mut swept = FallbackSweep::default();
        for id in stale_streams {
            if self.unregister_stream(id).await {
                swept.streams += 1;
            }
        }
        for key in stale_polls {
            if self.unregister_polling(&key.user_id, &key.client_id).await {
                swept.polls += 1;
            }
        }

        if swept != FallbackSweep::default() {
            tracing::info!(
                streams = swept.streams,
                polls = swept.polls,
                "Reclaimed idle fallback clients"
            );
        }
        swept
    }

    /// Close every stream and forget every polling client
    pub async fn shutdown(&self) {
        let streams: Vec<ConnectionId> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in streams {
            self.unregister_stream(id).await;
        }
        let polls: Vec<PollingKey> = self.polls.iter().map(|entry| entry.key().clone()).collect();
        for key in polls {
            self.unregister_polling(&key.user_id, &key.client_id).await;
        }
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn polling_count(&self) -> usize {
        self.polls.len()
    }

    pub fn users(&self) -> HashSet<UserId> {
        self.streams
            .iter()
            .map(|entry| entry.identity.user_id.clone())
            .chain(self.polls.iter().map(|entry| entry.key().user_id.clone()))
            .collect()
    }

    pub fn has_fallback(&self, user_id: &UserId) -> bool {
        self.streams.iter().any(|e| e.identity.user_id == *user_id)
            || self.polls.iter().any(|e| e.key().user_id == *user_id)
    }

    /// When a polling client registered, if it is registered
    pub fn polling_registered_at(&self, user_id: &UserId, client_id: &str) -> Option<OffsetDateTime> {
        self.polls
            .get(&PollingKey::new(user_id.clone(), client_id))
            .map(|entry| entry.registered_at)
    }

    async fn join_rooms(
        &self,
        subscriber: &Subscriber,
        identity: &Identity,
        order_ids: impl IntoIterator<Item = EntityId>,
    ) -> Vec<String> {
        let mut targets = default_rooms(identity);
        for order_id in order_ids {
            targets.extend(entity_rooms(EntityKind::Order, order_id));
        }

        let mut joined = Vec::with_capacity(targets.len());
        for (room, kind) in targets {
            self.rooms.join(subscriber, &room, kind).await;
            joined.push(room);
        }
        joined
    }
}

fn validate_client_id(client_id: &str) -> RealtimeResult<()> {
    let valid = !client_id.is_empty()
        && client_id.len() <= 128
        && client_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(RealtimeError::validation(
            "clientId must be 1-128 characters of letters, digits, '-', '_' or '.'",
        ))
    }
}
