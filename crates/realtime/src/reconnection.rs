//! Reconnection bookkeeping
//!
//! Per-identity state machine driven by primary-transport drops:
//!
//! ```text
//! CONNECTED -> DISCONNECTED -> RECONNECTING(n) -> CONNECTED | FAILED
//! ```
//!
//! The coordinator never instructs a client to reconnect. It schedules
//! attempts that check whether the identity came back on its own, reports
//! progress as `reconnection_*` events, and records terminal failure.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use forkcast_shared::{RealtimeError, UserId};
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::RealtimeConfig;
use crate::connection::ConnectionTable;
use crate::dispatcher::EventDispatcher;
use crate::events::ServerEvent;
use crate::scheduler::{Scheduler, TimerHandle};

// =============================================================================
// Backoff
// =============================================================================

/// `delay(n) = min(initial * multiplier^n + jitter, max)`, with jitter uniform
/// in `[0, jitter_ratio * initial * multiplier^n]`
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max: Duration,
    pub max_attempts: u32,
    pub jitter_ratio: f64,
}

impl From<&RealtimeConfig> for BackoffPolicy {
    fn from(config: &RealtimeConfig) -> Self {
        Self {
            initial: config.initial_reconnect_delay,
            multiplier: config.backoff_multiplier,
            max: config.max_reconnect_delay,
            max_attempts: config.max_reconnect_attempts.max(1),
            jitter_ratio: config.reconnect_jitter_ratio,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from(&RealtimeConfig::default())
    }
}

impl BackoffPolicy {
    /// Delay for attempt `n` (0-indexed) without jitter
    pub fn base_delay(&self, n: u32) -> Duration {
        self.delay_with_jitter(n, 0.0)
    }

    /// Delay for attempt `n` with `fraction` (0..=1) of the maximum jitter
    pub fn delay_with_jitter(&self, n: u32, fraction: f64) -> Duration {
        let exponent = i32::try_from(n).unwrap_or(i32::MAX);
        let base = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        let jitter = base * self.jitter_ratio * fraction.clamp(0.0, 1.0);
        let capped = (base + jitter).min(self.max.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max)
    }

    /// Delay for attempt `n` with random jitter
    pub fn delay(&self, n: u32) -> Duration {
        let fraction: f64 = rand::thread_rng().gen_range(0.0..=1.0);
        self.delay_with_jitter(n, fraction)
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug)]
struct ReconnectionRecord {
    attempt_count: u32,
    started_at: Instant,
    last_attempt_at: Option<Instant>,
    timer: TimerHandle,
    /// Distinguishes this sequence from ones replaced by `force_reconnect`
    generation: u64,
}

/// Terminal outcome of a sequence that ran out of attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedConnectionRecord {
    pub user_id: UserId,
    pub reason: String,
    #[serde(with = "time::serde::rfc3339")]
    pub failed_at: OffsetDateTime,
    pub attempts_used: u32,
    #[serde(skip)]
    recorded_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ReconnectionState {
    Connected,
    #[serde(rename_all = "camelCase")]
    Reconnecting {
        attempt: u32,
        max_attempts: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        since_last_attempt_ms: Option<u64>,
    },
    Failed(FailedConnectionRecord),
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectionStats {
    pub pending: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct CoordinatorState {
    records: HashMap<UserId, ReconnectionRecord>,
    failed: HashMap<UserId, FailedConnectionRecord>,
}

enum AttemptOutcome {
    Recovered { attempts: u32 },
    Retrying { attempt: u32, next_delay: Duration },
    Exhausted { attempt: u32, reason: String },
}

// =============================================================================
// Coordinator
// =============================================================================

#[derive(Clone)]
pub struct ReconnectionCoordinator {
    policy: BackoffPolicy,
    retention: Duration,
    scheduler: Scheduler,
    connections: ConnectionTable,
    dispatcher: EventDispatcher,
    state: Arc<Mutex<CoordinatorState>>,
    generation: Arc<AtomicU64>,
}

impl ReconnectionCoordinator {
    pub fn new(
        policy: BackoffPolicy,
        retention: Duration,
        scheduler: Scheduler,
        connections: ConnectionTable,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            policy,
            retention,
            scheduler,
            connections,
            dispatcher,
            state: Arc::new(Mutex::new(CoordinatorState::default())),
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Start a sequence for an identity that just lost its last primary
    /// connection. Returns false if it is still connected elsewhere or a
    /// sequence is already running.
    pub async fn on_disconnect(&self, user_id: &UserId) -> bool {
        if self.connections.has_live(user_id).await {
            return false;
        }

        let mut state = self.state.lock().await;
        if state.records.contains_key(user_id) {
            return false;
        }
        state.failed.remove(user_id);

        let delay = self.start_sequence(&mut state, user_id);
        tracing::info!(
            user_id = %user_id,
            first_attempt_ms = delay.as_millis() as u64,
            "Reconnection sequence started"
        );
        true
    }

    /// Clear any sequence for an identity that authenticated again
    ///
    /// Returns the attempts consumed when a pending sequence was cleared.
    pub async fn on_connected(&self, user_id: &UserId) -> Option<u32> {
        let record = {
            let mut state = self.state.lock().await;
            state.failed.remove(user_id);
            state.records.remove(user_id)
        }?;
        record.timer.cancel();

        tracing::info!(
            user_id = %user_id,
            attempts = record.attempt_count,
            "Identity reconnected"
        );
        self.dispatcher
            .notify(
                user_id,
                &ServerEvent::ReconnectionSuccess {
                    attempts: record.attempt_count,
                },
            )
            .await;
        Some(record.attempt_count)
    }

    /// Replace any pending or failed sequence with a fresh one
    pub async fn force_reconnect(&self, user_id: &UserId) {
        let mut state = self.state.lock().await;
        if let Some(previous) = state.records.remove(user_id) {
            previous.timer.cancel();
        }
        state.failed.remove(user_id);

        self.start_sequence(&mut state, user_id);
        tracing::info!(user_id = %user_id, "Reconnection sequence reset");
    }

    /// Abort a pending sequence silently
    pub async fn cancel_reconnect(&self, user_id: &UserId) -> bool {
        let removed = self.state.lock().await.records.remove(user_id);
        match removed {
            Some(record) => {
                record.timer.cancel();
                tracing::info!(user_id = %user_id, "Reconnection sequence cancelled");
                true
            }
            None => false,
        }
    }

    pub async fn state(&self, user_id: &UserId) -> ReconnectionState {
        {
            let state = self.state.lock().await;
            if let Some(record) = state.records.get(user_id) {
                return ReconnectionState::Reconnecting {
                    attempt: record.attempt_count,
                    max_attempts: self.policy.max_attempts,
                    since_last_attempt_ms: record
                        .last_attempt_at
                        .map(|t| t.elapsed().as_millis() as u64),
                };
            }
            if let Some(failed) = state.failed.get(user_id) {
                return ReconnectionState::Failed(failed.clone());
            }
        }

        if self.connections.has_live(user_id).await {
            ReconnectionState::Connected
        } else {
            ReconnectionState::Unknown
        }
    }

    pub async fn failed_record(&self, user_id: &UserId) -> Option<FailedConnectionRecord> {
        self.state.lock().await.failed.get(user_id).cloned()
    }

    /// Drop records and failures older than the retention window
    pub async fn gc(&self) -> usize {
        let now = Instant::now();
        let retention = self.retention;
        let mut state = self.state.lock().await;

        let before = state.records.len() + state.failed.len();
        state.records.retain(|_, record| {
            let keep = now.saturating_duration_since(record.started_at) <= retention;
            if !keep {
                record.timer.cancel();
            }
            keep
        });
        state
            .failed
            .retain(|_, failed| now.saturating_duration_since(failed.recorded_at) <= retention);
        let removed = before - (state.records.len() + state.failed.len());

        if removed > 0 {
            tracing::debug!(removed, "Garbage-collected reconnection records");
        }
        removed
    }

    pub async fn stats(&self) -> ReconnectionStats {
        let state = self.state.lock().await;
        ReconnectionStats {
            pending: state.records.len(),
            failed: state.failed.len(),
        }
    }

    fn start_sequence(&self, state: &mut CoordinatorState, user_id: &UserId) -> Duration {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let delay = self.policy.delay(0);
        let timer = self.schedule_attempt(user_id.clone(), generation, delay);

        state.records.insert(
            user_id.clone(),
            ReconnectionRecord {
                attempt_count: 0,
                started_at: Instant::now(),
                last_attempt_at: None,
                timer,
                generation,
            },
        );
        delay
    }

    fn schedule_attempt(&self, user_id: UserId, generation: u64, delay: Duration) -> TimerHandle {
        let coordinator = self.clone();
        self.scheduler.schedule(delay, async move {
            coordinator.run_attempt(user_id, generation).await;
        })
    }

    async fn run_attempt(&self, user_id: UserId, generation: u64) {
        let live = self.connections.has_live(&user_id).await;
        let max_attempts = self.policy.max_attempts;

        let outcome = {
            let mut state = self.state.lock().await;
            let Some(record) = state.records.get_mut(&user_id) else {
                return;
            };
            if record.generation != generation {
                return;
            }

            if live {
                let attempts = record.attempt_count;
                state.records.remove(&user_id);
                AttemptOutcome::Recovered { attempts }
            } else {
                record.attempt_count = (record.attempt_count + 1).min(max_attempts);
                record.last_attempt_at = Some(Instant::now());
                let attempt = record.attempt_count;

                if attempt >= max_attempts {
                    state.records.remove(&user_id);
                    let reason = RealtimeError::ReconnectionExhausted {
                        user_id: user_id.clone(),
                        attempts: attempt,
                    }
                    .to_string();
                    state.failed.insert(
                        user_id.clone(),
                        FailedConnectionRecord {
                            user_id: user_id.clone(),
                            reason: reason.clone(),
                            failed_at: OffsetDateTime::now_utc(),
                            attempts_used: attempt,
                            recorded_at: Instant::now(),
                        },
                    );
                    AttemptOutcome::Exhausted { attempt, reason }
                } else {
                    let next_delay = self.policy.delay(attempt);
                    record.timer = self.schedule_attempt(user_id.clone(), generation, next_delay);
                    AttemptOutcome::Retrying {
                        attempt,
                        next_delay,
                    }
                }
            }
        };

        match outcome {
            AttemptOutcome::Recovered { attempts } => {
                tracing::info!(user_id = %user_id, attempts, "Identity reconnected before attempt");
                self.dispatcher
                    .notify(&user_id, &ServerEvent::ReconnectionSuccess { attempts })
                    .await;
            }
            AttemptOutcome::Retrying {
                attempt,
                next_delay,
            } => {
                tracing::info!(
                    user_id = %user_id,
                    attempt,
                    max_attempts,
                    next_delay_ms = next_delay.as_millis() as u64,
                    "Reconnection attempt"
                );
                self.dispatcher
                    .notify(
                        &user_id,
                        &ServerEvent::ReconnectionAttempt {
                            attempt,
                            max_attempts,
                            next_delay_ms: Some(next_delay.as_millis() as u64),
                        },
                    )
                    .await;
            }
            AttemptOutcome::Exhausted { attempt, reason } => {
                tracing::warn!(user_id = %user_id, attempts = attempt, "Reconnection attempts exhausted");
                self.dispatcher
                    .notify(
                        &user_id,
                        &ServerEvent::ReconnectionFailed {
                            reason,
                            attempts_used: attempt,
                        },
                    )
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, DisconnectReason};
    use crate::fallback::{FallbackSettings, FallbackTransportManager};
    use crate::room::RoomRegistry;
    use forkcast_shared::{Identity, Role, TransportKind};
    use tokio::sync::mpsc;
    use tokio::time;

    fn exact_policy() -> BackoffPolicy {
        BackoffPolicy {
            jitter_ratio: 0.0,
            ..BackoffPolicy::default()
        }
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn coordinator() -> (ReconnectionCoordinator, ConnectionTable) {
        let scheduler = Scheduler::new();
        let rooms = RoomRegistry::new(1000, Duration::from_secs(3600));
        let connections = ConnectionTable::new();
        let fallback = FallbackTransportManager::new(
            rooms.clone(),
            scheduler.clone(),
            FallbackSettings::from(&RealtimeConfig::default()),
        );
        let dispatcher = EventDispatcher::new(rooms, connections.clone(), fallback);
        let coordinator = ReconnectionCoordinator::new(
            exact_policy(),
            Duration::from_secs(3600),
            scheduler,
            connections.clone(),
            dispatcher,
        );
        (coordinator, connections)
    }

    #[test]
    fn test_backoff_doubles_until_cap() {
        let policy = exact_policy();
        let delays: Vec<u128> = (0..7).map(|n| policy.base_delay(n).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn test_jitter_stays_within_ten_percent_and_cap() {
        let policy = BackoffPolicy::default();
        for n in 0..10 {
            let base = policy.base_delay(n);
            let upper = policy.delay_with_jitter(n, 1.0);
            assert!(upper <= policy.max);
            assert!(upper.as_secs_f64() <= (base.as_secs_f64() * 1.1).min(30.0) + 1e-9);
            for _ in 0..20 {
                let d = policy.delay(n);
                assert!(d >= base && d <= upper, "attempt {n}: {d:?} outside [{base:?}, {upper:?}]");
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_are_capped_and_recorded_as_failed() {
        let (coordinator, _connections) = coordinator();
        let user = UserId::new("u1");

        assert!(coordinator.on_disconnect(&user).await);
        assert!(!coordinator.on_disconnect(&user).await);
        settle().await;

        for (attempt, delay) in [1000u64, 2000, 4000, 8000].into_iter().enumerate() {
            time::advance(Duration::from_millis(delay)).await;
            settle().await;
            match coordinator.state(&user).await {
                ReconnectionState::Reconnecting {
                    attempt: current,
                    max_attempts,
                    ..
                } => {
                    assert_eq!(current, attempt as u32 + 1);
                    assert_eq!(max_attempts, 5);
                }
                other => panic!("Expected Reconnecting, got {other:?}"),
            }
        }

        time::advance(Duration::from_millis(16_000)).await;
        settle().await;
        let failed = coordinator.failed_record(&user).await.unwrap();
        assert_eq!(failed.attempts_used, 5);
        assert_eq!(coordinator.stats().await, ReconnectionStats { pending: 0, failed: 1 });

        // Nothing further is scheduled
        time::advance(Duration::from_secs(120)).await;
        settle().await;
        assert_eq!(coordinator.failed_record(&user).await.unwrap().attempts_used, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_before_first_attempt_clears_record() {
        let (coordinator, connections) = coordinator();
        let user = UserId::new("u1");

        coordinator.on_disconnect(&user).await;
        settle().await;
        time::advance(Duration::from_millis(500)).await;

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            Identity::new("u1", Role::Customer),
            TransportKind::Primary,
            tx,
        ));
        connections.insert(Arc::clone(&conn)).await;

        assert_eq!(coordinator.on_connected(&user).await, Some(0));
        assert_eq!(coordinator.state(&user).await, ReconnectionState::Connected);

        time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(coordinator.stats().await, ReconnectionStats::default());

        conn.close(DisconnectReason::ClientClosed);
    }

    #[tokio::test]
    async fn test_live_connection_does_not_start_sequence() {
        let (coordinator, connections) = coordinator();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Arc::new(Connection::new(
            Identity::new("u1", Role::Customer),
            TransportKind::Primary,
            tx,
        ));
        connections.insert(conn).await;

        assert!(!coordinator.on_disconnect(&UserId::new("u1")).await);
        assert_eq!(coordinator.state(&UserId::new("u1")).await, ReconnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_and_cancel() {
        let (coordinator, _connections) = coordinator();
        let user = UserId::new("u1");

        coordinator.on_disconnect(&user).await;
        settle().await;
        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        time::advance(Duration::from_millis(2000)).await;
        settle().await;
        assert!(matches!(
            coordinator.state(&user).await,
            ReconnectionState::Reconnecting { attempt: 2, .. }
        ));

        coordinator.force_reconnect(&user).await;
        assert!(matches!(
            coordinator.state(&user).await,
            ReconnectionState::Reconnecting { attempt: 0, .. }
        ));
        settle().await;
        time::advance(Duration::from_millis(1000)).await;
        settle().await;
        assert!(matches!(
            coordinator.state(&user).await,
            ReconnectionState::Reconnecting { attempt: 1, .. }
        ));

        assert!(coordinator.cancel_reconnect(&user).await);
        assert!(!coordinator.cancel_reconnect(&user).await);
        time::advance(Duration::from_secs(60)).await;
        settle().await;
        assert_eq!(coordinator.state(&user).await, ReconnectionState::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_drops_old_failures() {
        let (coordinator, _connections) = coordinator();
        let user = UserId::new("u1");

        coordinator.on_disconnect(&user).await;
        settle().await;
        for delay in [1000u64, 2000, 4000, 8000, 16000] {
            time::advance(Duration::from_millis(delay)).await;
            settle().await;
        }
        assert!(coordinator.failed_record(&user).await.is_some());

        assert_eq!(coordinator.gc().await, 0);
        time::advance(Duration::from_secs(3601)).await;
        assert_eq!(coordinator.gc().await, 1);
        assert_eq!(coordinator.state(&user).await, ReconnectionState::Unknown);
    }
}
