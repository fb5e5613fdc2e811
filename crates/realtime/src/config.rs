//! Realtime core configuration

use std::env;
use std::time::Duration;

/// Tunables for every timer and limit in the realtime core
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    // Heartbeat
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,

    // Reconnection
    pub initial_reconnect_delay: Duration,
    pub backoff_multiplier: f64,
    pub max_reconnect_delay: Duration,
    pub max_reconnect_attempts: u32,
    /// Fraction of the base delay used as the upper bound of the random jitter
    pub reconnect_jitter_ratio: f64,
    pub reconnection_retention: Duration,
    pub reconnection_sweep_interval: Duration,

    // Rooms
    pub inactive_room_timeout: Duration,
    pub room_sweep_interval: Duration,
    pub max_users_per_room: usize,

    // Fallback transports
    pub stream_keepalive_interval: Duration,
    pub stream_idle_timeout: Duration,
    pub polling_idle_timeout: Duration,
    pub fallback_sweep_interval: Duration,
    pub polling_queue_capacity: usize,
    pub stream_buffer: usize,
    pub min_polling_interval: Duration,
    pub max_polling_interval: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(5),

            initial_reconnect_delay: Duration::from_millis(1000),
            backoff_multiplier: 2.0,
            max_reconnect_delay: Duration::from_millis(30_000),
            max_reconnect_attempts: 5,
            reconnect_jitter_ratio: 0.1,
            reconnection_retention: Duration::from_secs(60 * 60),
            reconnection_sweep_interval: Duration::from_secs(5 * 60),

            inactive_room_timeout: Duration::from_secs(60 * 60),
            room_sweep_interval: Duration::from_secs(5 * 60),
            max_users_per_room: 1000,

            stream_keepalive_interval: Duration::from_secs(30),
            stream_idle_timeout: Duration::from_secs(5 * 60),
            polling_idle_timeout: Duration::from_secs(10 * 60),
            fallback_sweep_interval: Duration::from_secs(60),
            polling_queue_capacity: 100,
            stream_buffer: 64,
            min_polling_interval: Duration::from_secs(1),
            max_polling_interval: Duration::from_secs(60),
        }
    }
}

impl RealtimeConfig {
    /// Load configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            heartbeat_interval: env_period("HEARTBEAT_INTERVAL_MS", defaults.heartbeat_interval),
            heartbeat_timeout: env_millis("HEARTBEAT_TIMEOUT_MS", defaults.heartbeat_timeout),

            initial_reconnect_delay: env_millis(
                "RECONNECT_INITIAL_DELAY_MS",
                defaults.initial_reconnect_delay,
            ),
            backoff_multiplier: env_parse(
                "RECONNECT_BACKOFF_MULTIPLIER",
                defaults.backoff_multiplier,
            ),
            max_reconnect_delay: env_millis("RECONNECT_MAX_DELAY_MS", defaults.max_reconnect_delay),
            max_reconnect_attempts: env_parse(
                "RECONNECT_MAX_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
            reconnect_jitter_ratio: env_parse("RECONNECT_JITTER_RATIO", defaults.reconnect_jitter_ratio)
                .clamp(0.0, 1.0),
            reconnection_retention: env_millis(
                "RECONNECT_RETENTION_MS",
                defaults.reconnection_retention,
            ),
            reconnection_sweep_interval: env_period(
                "RECONNECT_SWEEP_INTERVAL_MS",
                defaults.reconnection_sweep_interval,
            ),

            inactive_room_timeout: env_millis(
                "INACTIVE_ROOM_TIMEOUT_MS",
                defaults.inactive_room_timeout,
            ),
            room_sweep_interval: env_period("ROOM_SWEEP_INTERVAL_MS", defaults.room_sweep_interval),
            max_users_per_room: env_parse("MAX_USERS_PER_ROOM", defaults.max_users_per_room),

            stream_keepalive_interval: env_period(
                "STREAM_KEEPALIVE_MS",
                defaults.stream_keepalive_interval,
            ),
            stream_idle_timeout: env_millis("STREAM_IDLE_TIMEOUT_MS", defaults.stream_idle_timeout),
            polling_idle_timeout: env_millis(
                "POLLING_IDLE_TIMEOUT_MS",
                defaults.polling_idle_timeout,
            ),
            fallback_sweep_interval: env_period(
                "FALLBACK_SWEEP_INTERVAL_MS",
                defaults.fallback_sweep_interval,
            ),
            polling_queue_capacity: env_parse(
                "POLLING_QUEUE_CAPACITY",
                defaults.polling_queue_capacity,
            )
            .max(1),
            stream_buffer: env_parse("STREAM_BUFFER", defaults.stream_buffer).max(1),
            min_polling_interval: defaults.min_polling_interval,
            max_polling_interval: defaults.max_polling_interval,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

/// Like [`env_millis`] for timer periods, which must be non-zero
fn env_period(key: &str, default: Duration) -> Duration {
    env_millis(key, default).max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_match_documented_constants() {
        let config = RealtimeConfig::default();
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(5));
        assert_eq!(config.max_reconnect_attempts, 5);
        assert_eq!(config.max_reconnect_delay, Duration::from_secs(30));
        assert_eq!(config.inactive_room_timeout, Duration::from_secs(3600));
        assert_eq!(config.stream_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.polling_idle_timeout, Duration::from_secs(600));
    }

    #[test]
    #[serial]
    fn test_env_overrides_and_bad_values() {
        env::set_var("RECONNECT_MAX_ATTEMPTS", "7");
        env::set_var("HEARTBEAT_TIMEOUT_MS", "2500");
        env::set_var("MAX_USERS_PER_ROOM", "not-a-number");

        let config = RealtimeConfig::from_env();
        assert_eq!(config.max_reconnect_attempts, 7);
        assert_eq!(config.heartbeat_timeout, Duration::from_millis(2500));
        assert_eq!(config.max_users_per_room, 1000);

        env::remove_var("RECONNECT_MAX_ATTEMPTS");
        env::remove_var("HEARTBEAT_TIMEOUT_MS");
        env::remove_var("MAX_USERS_PER_ROOM");
    }

    #[test]
    #[serial]
    fn test_zero_periods_are_clamped() {
        env::set_var("HEARTBEAT_INTERVAL_MS", "0");
        env::set_var("ROOM_SWEEP_INTERVAL_MS", "0");
        env::set_var("STREAM_KEEPALIVE_MS", "0");
        env::set_var("HEARTBEAT_TIMEOUT_MS", "0");

        let config = RealtimeConfig::from_env();
        assert_eq!(config.heartbeat_interval, Duration::from_millis(1));
        assert_eq!(config.room_sweep_interval, Duration::from_millis(1));
        assert_eq!(config.stream_keepalive_interval, Duration::from_millis(1));
        assert_eq!(config.heartbeat_timeout, Duration::ZERO);

        env::remove_var("HEARTBEAT_INTERVAL_MS");
        env::remove_var("ROOM_SWEEP_INTERVAL_MS");
        env::remove_var("STREAM_KEEPALIVE_MS");
        env::remove_var("HEARTBEAT_TIMEOUT_MS");
    }
}
