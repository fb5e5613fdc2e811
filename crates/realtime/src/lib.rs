//! Forkcast realtime core
//!
//! Room-scoped publish/subscribe for order, delivery and location updates:
//!
//! - [`room`]: room lifecycle and the per-identity subscription index
//! - [`gateway`]: authentication of primary connections and the protocol session
//! - [`heartbeat`]: ping/pong liveness of primary connections
//! - [`dispatcher`]: fan-out of events to room members on any transport
//! - [`fallback`]: server-push streams and polling for clients without a primary connection
//! - [`reconnection`]: backoff bookkeeping for identities that dropped off
//!
//! [`RealtimeHub`] wires them together.

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod events;
pub mod fallback;
pub mod gateway;
pub mod heartbeat;
pub mod hub;
pub mod reconnection;
pub mod room;
pub mod scheduler;

pub use config::RealtimeConfig;
pub use connection::{Connection, DisconnectReason, EventReceiver, EventSender};
pub use dispatcher::{DeliveryReport, EventDispatcher};
pub use events::{ClientCommand, DomainEvent, EntityId, EventEnvelope, ServerEvent};
pub use fallback::{FallbackTransportManager, PollBatch, PollingTicket, StreamSubscription};
pub use gateway::{AuthVerifier, ConnectionGateway, Flow, Session};
pub use hub::{RealtimeHub, RealtimeStats};
pub use reconnection::{BackoffPolicy, ReconnectionCoordinator, ReconnectionState};
pub use room::{RoomKind, RoomRegistry};
pub use scheduler::{Scheduler, TimerHandle};
