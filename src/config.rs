use std::{str::FromStr, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Process configuration, read from the environment (a `.env` file is honoured).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub bind_addr: String,

    pub group_service_url: String,
    pub user_service_url: String,
    pub notify_webhook_url: String,
    pub upstream_timeout: Duration,
    pub webhook_timeout: Duration,

    pub pipeline: PipelineConfig,
    pub ingress: IngressConfig,
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// How long a mate-list worker waits for its group to be created.
    pub dependency_wait: Duration,
    pub worker_queue: usize,
    pub max_attempts: u32,
    /// How long an event handed back by a busy worker stays hidden.
    pub requeue_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct IngressConfig {
    pub poll_interval: Duration,
    pub lease: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dependency_wait: Duration::from_secs(10),
            worker_queue: 64,
            max_attempts: 5,
            requeue_delay: Duration::from_secs(1),
        }
    }
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: var_or("DATABASE_URL", "sqlite://chatting.db?mode=rwc"),
            db_max_connections: parse_or("DB_MAX_CONNECTIONS", 16)?,
            bind_addr: var_or("BIND_ADDR", "0.0.0.0:8888"),

            group_service_url: var_or("GROUP_SERVICE_URL", "http://fit-group:8080/fit-group-service"),
            user_service_url: var_or("USER_SERVICE_URL", "http://auth-service:8080/auth-service"),
            notify_webhook_url: var_or("NOTIFY_WEBHOOK_URL", "http://auth-service:8080/chat/real-time-chat"),
            upstream_timeout: millis_or("UPSTREAM_TIMEOUT_MS", 10_000)?,
            webhook_timeout: millis_or("WEBHOOK_TIMEOUT_MS", 10_000)?,

            pipeline: PipelineConfig {
                dependency_wait: millis_or("DEPENDENCY_WAIT_MS", 10_000)?,
                worker_queue: parse_or("WORKER_QUEUE", 64)?,
                max_attempts: parse_or("EVENT_MAX_ATTEMPTS", 5)?,
                requeue_delay: millis_or("EVENT_REQUEUE_MS", 1_000)?,
            },
            ingress: IngressConfig {
                poll_interval: millis_or("EVENT_POLL_MS", 500)?,
                lease: millis_or("EVENT_LEASE_MS", 30_000)?,
            },
            outbound_buffer: parse_or("OUTBOUND_BUFFER", 64)?,
        })
    }
}

fn var_or(key: &'static str, default: &str) -> String {
    dotenv::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match dotenv::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value }),
        Err(_) => Ok(default),
    }
}

fn millis_or(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    parse_or(key, default).map(Duration::from_millis)
}
