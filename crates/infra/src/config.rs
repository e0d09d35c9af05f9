//! Process configuration, read once from the environment at startup.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `DATABASE_URL` | unset: in-memory store |
//! | `DATABASE_MAX_CONNECTIONS` | `10` |
//! | `REDIS_URL` | unset: in-memory bus |
//! | `BUS_TOPIC` (or `PUBSUB_TOPIC`) | `cloudtasker.jobs` |
//! | `LISTEN_ADDR` (or `PORT`) | `0.0.0.0:8080` |
//! | `REQUEST_TIMEOUT_MS` | `5000` |
//! | `RELAY_BATCH_SIZE` | `100` |
//! | `RELAY_POLL_INTERVAL_MS` | `500` |
//! | `RELAY_PUBLISH_TIMEOUT_MS` | `2000` |
//! | `RELAY_STALE_AFTER_MS` | `60000` |
//! | `RELAY_RETRY_BACKOFF_MS` | `1000` |
//! | `RELAY_MAX_RETRY_BACKOFF_MS` | `60000` |
//! | `OUTBOX_RETENTION_SECS` | `86400` (`0` keeps delivered entries) |
//! | `RUN_EMBEDDED_WORKER` | `false` |

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::outbox::RelayConfig;

pub const DEFAULT_TOPIC: &str = "cloudtasker.jobs";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Immutable process configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub database_max_connections: u32,
    pub redis_url: Option<String>,
    pub bus_topic: String,
    pub listen_addr: String,
    pub request_timeout: Duration,
    pub relay: RelayConfig,
    pub run_embedded_worker: bool,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let listen_addr = match (get("LISTEN_ADDR"), get("PORT")) {
            (Some(addr), _) => addr,
            (None, Some(port)) => {
                let port: u16 = parse("PORT", port)?;
                format!("0.0.0.0:{port}")
            }
            (None, None) => DEFAULT_LISTEN_ADDR.to_string(),
        };

        let retention_secs: u64 = parse_or(&get, "OUTBOX_RETENTION_SECS", 86_400)?;
        let relay = RelayConfig::default()
            .with_batch_size(parse_or(&get, "RELAY_BATCH_SIZE", 100)?)
            .with_poll_interval(millis_or(&get, "RELAY_POLL_INTERVAL_MS", 500)?)
            .with_publish_timeout(millis_or(&get, "RELAY_PUBLISH_TIMEOUT_MS", 2_000)?)
            .with_stale_after(millis_or(&get, "RELAY_STALE_AFTER_MS", 60_000)?)
            .with_retry_backoff(
                millis_or(&get, "RELAY_RETRY_BACKOFF_MS", 1_000)?,
                millis_or(&get, "RELAY_MAX_RETRY_BACKOFF_MS", 60_000)?,
            )
            .with_retention((retention_secs > 0).then(|| Duration::from_secs(retention_secs)));

        Ok(Self {
            database_url: get("DATABASE_URL"),
            database_max_connections: parse_or(&get, "DATABASE_MAX_CONNECTIONS", 10)?,
            redis_url: get("REDIS_URL"),
            bus_topic: get("BUS_TOPIC")
                .or_else(|| get("PUBSUB_TOPIC"))
                .unwrap_or_else(|| DEFAULT_TOPIC.to_string()),
            listen_addr,
            request_timeout: millis_or(&get, "REQUEST_TIMEOUT_MS", 5_000)?,
            relay,
            run_embedded_worker: parse_bool(&get, "RUN_EMBEDDED_WORKER")?,
        })
    }
}

fn parse<T: FromStr>(key: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid { key, value })
}

fn parse_or<T, G>(get: &G, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(value) => parse(key, value),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &'static str, default_ms: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    parse_or(get, key, default_ms).map(Duration::from_millis)
}

fn parse_bool<G>(get: &G, key: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(true),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(false),
        Some(value) => Err(ConfigError::Invalid { key, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = config(&[]).unwrap();
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.bus_topic, DEFAULT_TOPIC);
        assert_eq!(cfg.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(cfg.request_timeout, Duration::from_secs(5));
        assert_eq!(cfg.relay.batch_size, 100);
        assert_eq!(cfg.relay.retention, Some(Duration::from_secs(86_400)));
        assert!(!cfg.run_embedded_worker);
    }

    #[test]
    fn port_and_topic_aliases() {
        let cfg = config(&[("PORT", "9090"), ("PUBSUB_TOPIC", "tasks")]).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:9090");
        assert_eq!(cfg.bus_topic, "tasks");
    }

    #[test]
    fn listen_addr_wins_over_port() {
        let cfg = config(&[("PORT", "9090"), ("LISTEN_ADDR", "127.0.0.1:7000")]).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:7000");
    }

    #[test]
    fn zero_retention_disables_purge() {
        let cfg = config(&[("OUTBOX_RETENTION_SECS", "0")]).unwrap();
        assert_eq!(cfg.relay.retention, None);
    }

    #[test]
    fn relay_settings_are_read() {
        let cfg = config(&[
            ("RELAY_BATCH_SIZE", "7"),
            ("RELAY_PUBLISH_TIMEOUT_MS", "250"),
            ("RELAY_RETRY_BACKOFF_MS", "20"),
            ("RUN_EMBEDDED_WORKER", "true"),
        ])
        .unwrap();
        assert_eq!(cfg.relay.batch_size, 7);
        assert_eq!(cfg.relay.publish_timeout, Duration::from_millis(250));
        assert_eq!(cfg.relay.retry_backoff, Duration::from_millis(20));
        assert_eq!(cfg.relay.max_retry_backoff, Duration::from_secs(60));
        assert!(cfg.run_embedded_worker);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = config(&[("REQUEST_TIMEOUT_MS", "soon")]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "REQUEST_TIMEOUT_MS",
                value: "soon".into(),
            }
        );
        assert!(config(&[("RUN_EMBEDDED_WORKER", "maybe")]).is_err());
    }
}
