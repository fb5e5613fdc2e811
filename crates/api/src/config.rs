//! Application configuration

use std::env;

use forkcast_realtime::RealtimeConfig;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub cors_origins: Vec<String>,

    // Authentication
    pub jwt_secret: String,
    pub jwt_leeway_secs: u64,

    // Realtime core
    pub realtime: RealtimeConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),
            cors_origins: env::var("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),

            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            jwt_leeway_secs: env::var("JWT_LEEWAY_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),

            realtime: RealtimeConfig::from_env(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const SECRET: &str = "test-jwt-secret-must-be-at-least-32-characters-long";

    fn cleanup_config() {
        for key in [
            "BIND_ADDRESS",
            "CORS_ORIGINS",
            "JWT_SECRET",
            "JWT_LEEWAY_SECS",
            "HEARTBEAT_INTERVAL_MS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_missing_secret_rejected() {
        cleanup_config();

        match Config::from_env() {
            Err(ConfigError::Missing("JWT_SECRET")) => {}
            other => panic!("Expected Missing error for JWT_SECRET, got: {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_short_secret_rejected() {
        cleanup_config();
        env::set_var("JWT_SECRET", "too-short");

        let result = Config::from_env();
        assert!(
            matches!(result, Err(ConfigError::WeakSecret(_))),
            "Short secret should return WeakSecret error"
        );

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_defaults_and_overrides() {
        cleanup_config();
        env::set_var("JWT_SECRET", SECRET);

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.jwt_leeway_secs, 60);
        assert!(config.cors_origins.is_empty());
        assert_eq!(config.realtime.heartbeat_interval.as_millis(), 30_000);

        env::set_var("BIND_ADDRESS", "127.0.0.1:8080");
        env::set_var("CORS_ORIGINS", "https://a.example, https://b.example,");
        env::set_var("JWT_LEEWAY_SECS", "not-a-number");
        env::set_var("HEARTBEAT_INTERVAL_MS", "1500");

        let config = Config::from_env().unwrap();
        assert_eq!(config.bind_address, "127.0.0.1:8080");
        assert_eq!(
            config.cors_origins,
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert_eq!(config.jwt_leeway_secs, 60);
        assert_eq!(config.realtime.heartbeat_interval.as_millis(), 1500);

        cleanup_config();
    }
}
