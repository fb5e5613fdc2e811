//! Event dispatcher
//!
//! Fans an event out to every member of a room over whichever transport the
//! member currently uses. Delivery is best-effort and at-most-once; the
//! returned [`DeliveryReport`] is informational only.

use std::collections::HashSet;
use std::sync::Arc;

use forkcast_shared::{ConnectionId, Role, TransportKind, UserId};
use serde::Serialize;
use serde_json::Value;

use crate::connection::{ConnectionTable, DisconnectReason};
use crate::events::{DomainEvent, EventEnvelope, ServerEvent};
use crate::fallback::{FallbackDelivery, FallbackTransportManager};
use crate::room::{EntityKind, RoomKind, RoomRegistry, Subscriber};

/// Per-emission delivery counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryReport {
    /// Written to a live primary connection
    pub primary: usize,
    /// Handed to a stream or polling queue
    pub fallback: usize,
    /// Member unreachable, write failed, or event dropped
    pub failed: usize,
}

impl DeliveryReport {
    pub fn delivered(&self) -> usize {
        self.primary + self.fallback
    }

    pub fn merge(&mut self, other: DeliveryReport) {
        self.primary += other.primary;
        self.fallback += other.fallback;
        self.failed += other.failed;
    }
}

#[derive(Clone)]
pub struct EventDispatcher {
    rooms: RoomRegistry,
    connections: ConnectionTable,
    fallback: FallbackTransportManager,
}

impl EventDispatcher {
    pub fn new(
        rooms: RoomRegistry,
        connections: ConnectionTable,
        fallback: FallbackTransportManager,
    ) -> Self {
        Self {
            rooms,
            connections,
            fallback,
        }
    }

    /// Emit an event to every current member of `room`
    pub async fn emit(&self, room: &str, event_type: &str, payload: Value) -> DeliveryReport {
        let envelope = Arc::new(EventEnvelope::new(event_type, payload).in_room(room));
        self.emit_envelope(room, &envelope).await
    }

    pub async fn emit_envelope(&self, room: &str, envelope: &Arc<EventEnvelope>) -> DeliveryReport {
        let Some(members) = self.rooms.members_for_delivery(room).await else {
            tracing::debug!(
                room = %room,
                event_type = %envelope.event_type,
                "No room found - no subscribers"
            );
            return DeliveryReport::default();
        };

        let report = self.deliver_all(members, envelope).await;
        tracing::debug!(
            room = %room,
            event_type = %envelope.event_type,
            primary = report.primary,
            fallback = report.fallback,
            failed = report.failed,
            "Emitted event to room"
        );
        report
    }

    /// Emit to the identity-scoped rooms (`user_{id}`) of one identity,
    /// reaching each of its connections once
    pub async fn emit_to_identity(
        &self,
        user_id: &UserId,
        event_type: &str,
        payload: Value,
    ) -> DeliveryReport {
        let envelope = Arc::new(EventEnvelope::new(event_type, payload));
        self.emit_envelope_to_identity(user_id, &envelope).await
    }

    async fn emit_envelope_to_identity(
        &self,
        user_id: &UserId,
        envelope: &Arc<EventEnvelope>,
    ) -> DeliveryReport {
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut members = Vec::new();

        for room in self.rooms.rooms_of(user_id).await {
            if RoomKind::infer(&room) != RoomKind::User {
                continue;
            }
            if let Some(room_members) = self.rooms.members_for_delivery(&room).await {
                members.extend(
                    room_members
                        .into_iter()
                        .filter(|m| seen.insert(m.connection_id)),
                );
            }
        }

        let report = self.deliver_all(members, envelope).await;
        tracing::debug!(
            user_id = %user_id,
            event_type = %envelope.event_type,
            primary = report.primary,
            fallback = report.fallback,
            failed = report.failed,
            "Emitted event to identity"
        );
        report
    }

    /// Send a protocol event to one identity (reconnection notices and the like)
    pub async fn notify(&self, user_id: &UserId, event: &ServerEvent) -> DeliveryReport {
        self.emit_envelope_to_identity(user_id, &Arc::new(event.to_envelope()))
            .await
    }

    /// Emit to the static broadcast room of a role
    pub async fn broadcast_role(&self, role: Role, event_type: &str, payload: Value) -> DeliveryReport {
        self.emit(role.broadcast_room(), event_type, payload).await
    }

    /// Route a domain event to its rooms
    pub async fn publish(&self, event: DomainEvent) -> DeliveryReport {
        if let DomainEvent::OrderCreated { order_id, .. } = &event {
            self.rooms
                .create_entity_rooms(EntityKind::Order, order_id)
                .await;
        }

        // A connection in several target rooms gets one copy, tagged with the
        // first room that reached it
        let mut seen: HashSet<ConnectionId> = HashSet::new();
        let mut report = DeliveryReport::default();
        for emission in event.emissions() {
            let Some(members) = self.rooms.members_for_delivery(&emission.room).await else {
                continue;
            };
            let members: Vec<Subscriber> = members
                .into_iter()
                .filter(|m| seen.insert(m.connection_id))
                .collect();
            if members.is_empty() {
                continue;
            }

            let envelope = Arc::new(
                EventEnvelope::new(emission.event_type, emission.data).in_room(&emission.room),
            );
            report.merge(self.deliver_all(members, &envelope).await);
        }

        tracing::info!(
            event_type = event.event_type(),
            primary = report.primary,
            fallback = report.fallback,
            failed = report.failed,
            "Published domain event"
        );
        report
    }

    async fn deliver_all(
        &self,
        members: Vec<Subscriber>,
        envelope: &Arc<EventEnvelope>,
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();

        for member in members {
            match member.transport {
                TransportKind::Primary => match self.connections.get(member.connection_id).await {
                    Some(conn) => match conn.send(Arc::clone(envelope)) {
                        Ok(()) => report.primary += 1,
                        Err(e) => {
                            report.failed += 1;
                            tracing::warn!(
                                connection_id = %member.connection_id,
                                user_id = %member.user_id,
                                error = %e,
                                "Failed to send event to connection"
                            );
                            conn.close(DisconnectReason::TransportError);
                        }
                    },
                    None => report.failed += 1,
                },
                TransportKind::Sse | TransportKind::Polling => {
                    match self.fallback.deliver(&member, envelope).await {
                        FallbackDelivery::Delivered => report.fallback += 1,
                        FallbackDelivery::Dropped | FallbackDelivery::Gone => report.failed += 1,
                    }
                }
            }
        }

        report
    }
}
