//! Process configuration, read from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use relay_infra::checkpoint::FeedKey;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub app_name: String,
    /// The local bounded context.
    pub context_name: String,
    /// The external context the bridge tails.
    pub source_context: String,
    pub bind_addr: SocketAddr,
    pub bridge_batch_size: u32,
    pub bridge_poll_interval: Duration,
    pub saga_timeout_period: Duration,
    pub dispatch_debounce: Duration,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            app_name: "example-app".to_string(),
            context_name: "routemanagement".to_string(),
            source_context: "sale".to_string(),
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            bridge_batch_size: relay_infra::bridge::DEFAULT_BATCH_SIZE,
            bridge_poll_interval: relay_infra::bridge::DEFAULT_POLL_INTERVAL,
            saga_timeout_period: relay_infra::saga::DEFAULT_TIMEOUT_PERIOD,
            dispatch_debounce: relay_infra::dispatcher::DEFAULT_DEBOUNCE,
            redis_url: None,
            database_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. Unset or blank
    /// variables keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(v) = get("APP_NAME") {
            config.app_name = v;
        }
        if let Some(v) = get("CONTEXT_NAME") {
            config.context_name = v;
        }
        if let Some(v) = get("SOURCE_CONTEXT") {
            config.source_context = v;
        }
        if let Some(v) = get("BIND_ADDR") {
            config.bind_addr = parse("BIND_ADDR", &v)?;
        }
        if let Some(v) = get("BRIDGE_BATCH_SIZE") {
            let n: u32 = parse("BRIDGE_BATCH_SIZE", &v)?;
            if n == 0 {
                return Err(invalid("BRIDGE_BATCH_SIZE", &v, "must be positive"));
            }
            config.bridge_batch_size = n;
        }
        if let Some(v) = get("BRIDGE_POLL_INTERVAL_MS") {
            config.bridge_poll_interval = Duration::from_millis(parse("BRIDGE_POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("SAGA_TIMEOUT_PERIOD_SECS") {
            let secs: u64 = parse("SAGA_TIMEOUT_PERIOD_SECS", &v)?;
            if secs == 0 {
                return Err(invalid("SAGA_TIMEOUT_PERIOD_SECS", &v, "must be positive"));
            }
            config.saga_timeout_period = Duration::from_secs(secs);
        }
        if let Some(v) = get("DISPATCH_DEBOUNCE_MS") {
            config.dispatch_debounce = Duration::from_millis(parse("DISPATCH_DEBOUNCE_MS", &v)?);
        }
        config.redis_url = get("REDIS_URL");
        config.database_url = get("DATABASE_URL");

        Ok(config)
    }

    /// Checkpoint key for the bridge's source feed.
    pub fn feed_key(&self) -> FeedKey {
        FeedKey::new(&self.app_name, &self.context_name, &self.source_context)
    }

    pub fn with_dispatch_debounce(mut self, debounce: Duration) -> Self {
        self.dispatch_debounce = debounce;
        self
    }

    pub fn with_bridge_poll_interval(mut self, interval: Duration) -> Self {
        self.bridge_poll_interval = interval;
        self
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    value.parse().map_err(|e: T::Err| invalid(key, value, e.to_string()))
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}
