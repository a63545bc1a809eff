//! Environment-driven startup configuration.
//!
//! A typed struct with a `Default` that reads `std::env::var`, so
//! `dotenvy::dotenv()` in `main` plus `Config::from_env()` is the whole
//! bootstrap.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub redis_url: Option<String>,
    pub max_connections_per_user: usize,
    pub max_total_connections: usize,
    pub ping_interval: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub presence_ttl: Duration,
    pub pubsub_queue_capacity: usize,
    pub strict_origin_check: bool,
    pub enable_metrics: bool,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_port: env_or("SERVER_PORT", 8080),
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgres://localhost/collab".to_string()),
            redis_url: std::env::var("REDIS_URL").ok(),
            max_connections_per_user: env_or("MAX_CONNECTIONS_PER_USER", 50),
            max_total_connections: env_or("MAX_TOTAL_CONNECTIONS", 1000),
            ping_interval: Duration::from_secs(env_or("PING_INTERVAL_SECS", 30)),
            read_timeout: Duration::from_secs(env_or("READ_TIMEOUT_SECS", 60)),
            write_timeout: Duration::from_secs(env_or("WRITE_TIMEOUT_SECS", 10)),
            presence_ttl: Duration::from_secs(env_or("PRESENCE_TTL_SECS", 300)),
            pubsub_queue_capacity: env_or("PUBSUB_QUEUE_CAPACITY", 100),
            strict_origin_check: env_or("STRICT_ORIGIN_CHECK", false),
            enable_metrics: matches!(
                std::env::var("ENABLE_METRICS").as_deref(),
                Ok("1") | Ok("true") | Ok("TRUE") | Ok("yes") | Ok("YES")
            ),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::default()
    }
}
