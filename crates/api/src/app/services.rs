//! Store/bus selection and the state shared by all handlers.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;

use cloudtasker_events::{InMemoryMessageBus, MessageBus};
use cloudtasker_infra::{AppConfig, InMemoryStore, PostgresStore, Store, StoreError, TaskService};

/// Header a caller can use to bring its own deadline.
pub const REQUEST_TIMEOUT_HEADER: &str = "x-request-timeout-ms";

pub type SharedStore = Arc<dyn Store>;
pub type SharedBus = Arc<dyn MessageBus>;

/// State shared by all handlers.
pub struct AppServices {
    pub tasks: TaskService<SharedStore>,
    default_timeout: Duration,
}

impl AppServices {
    pub fn new(store: SharedStore, default_timeout: Duration) -> Self {
        Self {
            tasks: TaskService::new(store).with_default_timeout(default_timeout),
            default_timeout,
        }
    }

    /// Deadline for this request: the header when present and valid, otherwise
    /// the configured default.
    pub fn request_timeout(&self, headers: &HeaderMap) -> Option<Duration> {
        let requested = headers
            .get(REQUEST_TIMEOUT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis);
        Some(requested.unwrap_or(self.default_timeout))
    }
}

/// Postgres when `DATABASE_URL` is set, otherwise an in-memory store.
pub async fn connect_store(config: &AppConfig) -> Result<SharedStore, StoreError> {
    match &config.database_url {
        Some(url) => {
            let store = PostgresStore::connect(url, config.database_max_connections).await?;
            store.ensure_schema().await?;
            tracing::info!("using postgres store");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store (data is lost on exit)");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

/// Redis Streams when `REDIS_URL` is set and the `redis` feature is enabled,
/// otherwise an in-process bus.
pub fn connect_bus(config: &AppConfig) -> anyhow::Result<SharedBus> {
    #[cfg(feature = "redis")]
    if let Some(url) = &config.redis_url {
        let bus = cloudtasker_infra::event_bus::RedisStreamsBus::new(url, config.bus_topic.clone())?;
        tracing::info!(topic = %config.bus_topic, "using redis streams bus");
        return Ok(Arc::new(bus));
    }

    if config.redis_url.is_some() {
        tracing::warn!("REDIS_URL set but built without the `redis` feature; using in-memory bus");
    } else {
        tracing::warn!(topic = %config.bus_topic, "REDIS_URL not set; using in-memory bus");
    }
    Ok(Arc::new(InMemoryMessageBus::new()))
}
