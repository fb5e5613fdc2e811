//! Timer service
//!
//! Every delayed or periodic task in the realtime core (reconnection attempts,
//! heartbeat probes, stream keep-alives, idle sweeps) is spawned through a
//! [`Scheduler`]. Timers run on `tokio::time`, so tests drive them with a
//! paused clock (`#[tokio::test(start_paused = true)]` + `tokio::time::advance`).

use std::future::Future;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Spawns cancellable timers that all hang off one root token
#[derive(Debug, Clone, Default)]
pub struct Scheduler {
    root: CancellationToken,
}

/// Handle to a scheduled task. Dropping it does not cancel the task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    /// Cancel the task; safe to call more than once
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            root: CancellationToken::new(),
        }
    }

    /// Run `task` once after `delay` unless cancelled first
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();
        let deadline = Instant::now() + delay;

        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = time::sleep_until(deadline) => task.await,
            }
        });

        TimerHandle { token }
    }

    /// Run `tick` every `period`, first firing one period from now
    pub fn every<F, Fut>(&self, period: Duration, mut tick: F) -> TimerHandle
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        let cancel = token.clone();
        let start = Instant::now() + period;

        tokio::spawn(async move {
            let mut interval = time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
        });

        TimerHandle { token }
    }

    /// Spawn a long-running task that watches its own cancellation token
    pub fn run<F, Fut>(&self, task: F) -> TimerHandle
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.root.child_token();
        tokio::spawn(task(token.clone()));
        TimerHandle { token }
    }

    /// Cancel every timer spawned by this scheduler
    pub fn shutdown(&self) {
        self.root.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.root.is_cancelled()
    }
}
