//! Daemon configuration.
//!
//! Loads configuration from environment variables with sensible defaults.

use crate::error::{DaemonError, DaemonResult};
use seckill_exec::{QueueConfig, QueueTopology};
use std::env;
use std::str::FromStr;
use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// API server configuration
    pub api: ApiConfig,

    /// Order processor pool configuration
    pub workers: WorkerConfig,

    /// Order queue delivery policy
    pub queue: QueueSettings,

    /// PostgreSQL connection string (used with the `postgres` feature)
    pub database_url: Option<String>,

    /// Emit JSON logs
    pub log_json: bool,

    /// Environment (test, development, production)
    pub environment: Environment,
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
}

/// Order processor pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of consumer tasks
    pub count: usize,
    /// Distributed lock lease
    pub lock_ttl_ms: u64,
    /// Idle poll interval
    pub poll_interval_ms: u64,
}

/// Order queue delivery policy and names.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Unsettled deliveries are redelivered after this window
    pub ack_timeout_ms: u64,
    /// Delay before an explicitly redelivered message is visible
    pub retry_delay_ms: u64,
    /// Deliveries allowed before dead-lettering
    pub max_deliveries: u32,
    /// Exchange, queue and routing key names
    pub topology: QueueTopology,
}

/// Environment type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    /// Test environment
    Test,
    /// Development environment
    Development,
    /// Production environment
    Production,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DaemonResult<Self> {
        // Load .env file if present (ignore errors)
        let _ = dotenvy::dotenv();

        let environment = Self::load_environment()?;
        let api = Self::load_api_config()?;
        let workers = Self::load_worker_config()?;
        let queue = Self::load_queue_settings()?;
        let database_url = env::var("DATABASE_URL").ok();
        let log_json = matches!(
            env::var("SECKILL_LOG_JSON").map(|v| v.trim().to_lowercase()).as_deref(),
            Ok("1") | Ok("true")
        );

        let config = Self { api, workers, queue, database_url, log_json, environment };
        config.validate()?;
        Ok(config)
    }

    /// Create test configuration.
    pub fn test() -> Self {
        Self {
            api: ApiConfig {
                host: "127.0.0.1".to_string(),
                port: 0, // Let OS assign port
            },
            workers: WorkerConfig { count: 2, lock_ttl_ms: 1_000, poll_interval_ms: 5 },
            queue: QueueSettings {
                ack_timeout_ms: 1_000,
                retry_delay_ms: 0,
                max_deliveries: 5,
                topology: QueueTopology::default(),
            },
            database_url: None,
            log_json: false,
            environment: Environment::Test,
        }
    }

    /// Queue policy for the queue adapters.
    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            topology: self.queue.topology.clone(),
            ack_timeout: Duration::from_millis(self.queue.ack_timeout_ms),
            retry_delay: Duration::from_millis(self.queue.retry_delay_ms),
            max_deliveries: self.queue.max_deliveries,
        }
    }

    /// Lock lease for the order processor.
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.workers.lock_ttl_ms)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> DaemonResult<()> {
        if self.workers.count == 0 {
            return Err(DaemonError::Config("SECKILL_WORKERS must be at least 1".to_string()));
        }
        if self.workers.lock_ttl_ms == 0 {
            return Err(DaemonError::Config("SECKILL_LOCK_TTL_MS must be positive".to_string()));
        }
        if self.workers.poll_interval_ms == 0 {
            return Err(DaemonError::Config(
                "SECKILL_POLL_INTERVAL_MS must be positive".to_string(),
            ));
        }
        if self.queue.ack_timeout_ms == 0 {
            return Err(DaemonError::Config(
                "SECKILL_ACK_TIMEOUT_MS must be positive".to_string(),
            ));
        }
        if self.queue.max_deliveries == 0 {
            return Err(DaemonError::Config(
                "SECKILL_MAX_DELIVERIES must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    fn load_environment() -> DaemonResult<Environment> {
        let env_str = env::var("SECKILL_ENV").unwrap_or_else(|_| "development".to_string());

        match env_str.to_lowercase().as_str() {
            "test" => Ok(Environment::Test),
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(DaemonError::Config(format!(
                "Invalid SECKILL_ENV: {}. Expected: test, development, production",
                other
            ))),
        }
    }

    fn load_api_config() -> DaemonResult<ApiConfig> {
        let host = env::var("SECKILL_API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = load_env("SECKILL_API_PORT", 8081u16)?;

        Ok(ApiConfig { host, port })
    }

    fn load_worker_config() -> DaemonResult<WorkerConfig> {
        Ok(WorkerConfig {
            count: load_env("SECKILL_WORKERS", 4usize)?,
            lock_ttl_ms: load_env("SECKILL_LOCK_TTL_MS", 30_000u64)?,
            poll_interval_ms: load_env("SECKILL_POLL_INTERVAL_MS", 50u64)?,
        })
    }

    fn load_queue_settings() -> DaemonResult<QueueSettings> {
        let defaults = QueueTopology::default();
        let name = |key: &str, default: String| env::var(key).unwrap_or(default);

        Ok(QueueSettings {
            ack_timeout_ms: load_env("SECKILL_ACK_TIMEOUT_MS", 30_000u64)?,
            retry_delay_ms: load_env("SECKILL_RETRY_DELAY_MS", 200u64)?,
            max_deliveries: load_env("SECKILL_MAX_DELIVERIES", 5u32)?,
            topology: QueueTopology {
                exchange: name("SECKILL_QUEUE_EXCHANGE", defaults.exchange),
                queue: name("SECKILL_QUEUE_NAME", defaults.queue),
                routing_key: name("SECKILL_QUEUE_ROUTING_KEY", defaults.routing_key),
                dead_letter_exchange: name("SECKILL_QUEUE_DLX", defaults.dead_letter_exchange),
                dead_letter_queue: name("SECKILL_QUEUE_DLQ", defaults.dead_letter_queue),
                dead_letter_routing_key: name(
                    "SECKILL_QUEUE_DL_ROUTING_KEY",
                    defaults.dead_letter_routing_key,
                ),
            },
        })
    }
}

fn load_env<T: FromStr>(key: &str, default: T) -> DaemonResult<T> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|_| DaemonError::Config(format!("Invalid {} value: {}", key, val))),
        Err(_) => Ok(default),
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig { host: "0.0.0.0".to_string(), port: 8081 },
            workers: WorkerConfig { count: 4, lock_ttl_ms: 30_000, poll_interval_ms: 50 },
            queue: QueueSettings {
                ack_timeout_ms: 30_000,
                retry_delay_ms: 200,
                max_deliveries: 5,
                topology: QueueTopology::default(),
            },
            database_url: None,
            log_json: false,
            environment: Environment::Development,
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Environment::Test => write!(f, "test"),
            Environment::Development => write!(f, "development"),
            Environment::Production => write!(f, "production"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
