//! Heartbeat ping/pong liveness monitoring.
//!
//! Every registered primary connection gets its own probe loop: wait one
//! interval, send `ping`, and close the connection with
//! [`DisconnectReason::HeartbeatTimeout`] if no pong arrives within the
//! timeout. Closing goes through the same path as a client-initiated close.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use forkcast_shared::ConnectionId;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, DisconnectReason};
use crate::events::{now_millis, ServerEvent};
use crate::scheduler::{Scheduler, TimerHandle};

/// Outcome of a probe loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// No pong within the timeout; the connection was closed.
    TimedOut,
    /// Writing the ping failed; the connection was closed.
    SendFailed,
    /// The connection closed or the probe was unregistered.
    Cancelled,
}

struct Probe {
    connection: Arc<Connection>,
    awaiting_pong: Arc<AtomicBool>,
    timer: TimerHandle,
}

#[derive(Clone)]
pub struct HeartbeatMonitor {
    scheduler: Scheduler,
    interval: Duration,
    timeout: Duration,
    probes: Arc<DashMap<ConnectionId, Probe>>,
}

impl HeartbeatMonitor {
    pub fn new(scheduler: Scheduler, interval: Duration, timeout: Duration) -> Self {
        Self {
            scheduler,
            interval,
            timeout,
            probes: Arc::new(DashMap::new()),
        }
    }

    /// Start probing a connection. Re-registering replaces the old probe.
    pub fn register(&self, connection: Arc<Connection>) {
        let awaiting_pong = Arc::new(AtomicBool::new(false));
        let interval = self.interval;
        let timeout = self.timeout;
        let probes = Arc::clone(&self.probes);

        let conn = Arc::clone(&connection);
        let awaiting = Arc::clone(&awaiting_pong);
        let timer = self.scheduler.run(move |cancel| async move {
            let id = conn.id;
            let result = run_probe(&conn, &awaiting, interval, timeout, cancel).await;
            if result != HeartbeatResult::Cancelled {
                probes.remove(&id);
            }
        });

        let previous = self.probes.insert(
            connection.id,
            Probe {
                connection,
                awaiting_pong,
                timer,
            },
        );
        if let Some(previous) = previous {
            previous.timer.cancel();
        }
    }

    /// Record a pong; returns false for unknown connections
    pub fn record_pong(&self, id: ConnectionId) -> bool {
        match self.probes.get(&id) {
            Some(probe) => {
                probe.awaiting_pong.store(false, Ordering::SeqCst);
                probe.connection.touch_heartbeat();
                true
            }
            None => false,
        }
    }

    /// Stop probing; cancels the pending timer
    pub fn unregister(&self, id: ConnectionId) {
        if let Some((_, probe)) = self.probes.remove(&id) {
            probe.timer.cancel();
        }
    }

    pub fn is_monitored(&self, id: ConnectionId) -> bool {
        self.probes.contains_key(&id)
    }

    pub fn monitored_count(&self) -> usize {
        self.probes.len()
    }
}

async fn run_probe(
    conn: &Connection,
    awaiting_pong: &AtomicBool,
    interval: Duration,
    timeout: Duration,
    cancel: CancellationToken,
) -> HeartbeatResult {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = conn.closed() => return HeartbeatResult::Cancelled,
            () = time::sleep(interval) => {}
        }

        awaiting_pong.store(true, Ordering::SeqCst);
        let ping = ServerEvent::Ping {
            timestamp: now_millis(),
        };
        if let Err(e) = conn.send_event(&ping) {
            tracing::warn!(connection_id = %conn.id, error = %e, "Failed to send heartbeat ping");
            conn.close(DisconnectReason::TransportError);
            return HeartbeatResult::SendFailed;
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
            () = conn.closed() => return HeartbeatResult::Cancelled,
            () = time::sleep(timeout) => {}
        }

        if awaiting_pong.load(Ordering::SeqCst) {
            tracing::warn!(
                connection_id = %conn.id,
                user_id = %conn.identity.user_id,
                timeout_ms = timeout.as_millis() as u64,
                "Heartbeat timed out, closing connection"
            );
            conn.close(DisconnectReason::HeartbeatTimeout);
            return HeartbeatResult::TimedOut;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::EventReceiver;
    use forkcast_shared::{Identity, Role, TransportKind};
    use tokio::sync::mpsc;

    const INTERVAL: Duration = Duration::from_secs(30);
    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn setup() -> (HeartbeatMonitor, Arc<Connection>, EventReceiver) {
        let monitor = HeartbeatMonitor::new(Scheduler::new(), INTERVAL, TIMEOUT);
        let (tx, rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            Identity::new("u1", Role::Customer),
            TransportKind::Primary,
            tx,
        ));
        (monitor, conn, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_connection_is_closed_after_timeout() {
        let (monitor, conn, mut rx) = setup();
        monitor.register(Arc::clone(&conn));
        settle().await;

        time::advance(INTERVAL).await;
        settle().await;
        assert_eq!(rx.try_recv().unwrap().event_type, "ping");
        assert!(!conn.is_closed());

        time::advance(TIMEOUT - Duration::from_millis(1)).await;
        settle().await;
        assert!(!conn.is_closed());

        time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(conn.close_reason(), Some(DisconnectReason::HeartbeatTimeout));
        assert!(!monitor.is_monitored(conn.id));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_keeps_connection_open() {
        let (monitor, conn, mut rx) = setup();
        monitor.register(Arc::clone(&conn));
        settle().await;

        for _ in 0..3 {
            time::advance(INTERVAL).await;
            settle().await;
            assert!(rx.try_recv().is_ok());
            assert!(monitor.record_pong(conn.id));

            time::advance(TIMEOUT).await;
            settle().await;
            assert!(!conn.is_closed());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister_cancels_probe() {
        let (monitor, conn, mut rx) = setup();
        monitor.register(Arc::clone(&conn));
        settle().await;

        monitor.unregister(conn.id);
        assert!(!monitor.record_pong(conn.id));

        time::advance(INTERVAL * 2).await;
        settle().await;
        assert!(rx.try_recv().is_err());
        assert!(!conn.is_closed());
    }
}
