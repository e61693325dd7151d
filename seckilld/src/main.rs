//! Seckill Daemon
//!
//! Flash-sale order pipeline: admission API plus order queue consumers.
//!
//! # Usage
//!
//! ```bash
//! # Start with in-memory backends
//! cargo run -p seckilld
//!
//! # Start against PostgreSQL
//! DATABASE_URL=postgres://... cargo run -p seckilld --features postgres
//!
//! # Database maintenance (postgres feature)
//! seckilld db migrate
//! seckilld db init --voucher-id 1 --stock 100 --hours 24
//! ```
//!
//! # Environment Variables
//!
//! - `SECKILL_ENV`: Environment (test, development, production)
//! - `SECKILL_API_HOST` / `SECKILL_API_PORT`: Bind address (default: 0.0.0.0:8081)
//! - `SECKILL_WORKERS`: Order consumer count (default: 4)
//! - `SECKILL_LOCK_TTL_MS`: Per-user lock lease (default: 30000)
//! - `SECKILL_ACK_TIMEOUT_MS`: Redelivery window for unsettled deliveries (default: 30000)
//! - `SECKILL_RETRY_DELAY_MS`: Delay before a redelivered message is visible (default: 200)
//! - `SECKILL_MAX_DELIVERIES`: Deliveries before dead-lettering (default: 5)
//! - `SECKILL_LOG_JSON`: Set to 1 for JSON logs
//! - `DATABASE_URL`: PostgreSQL connection (postgres feature)

use seckilld::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("seckilld=info".parse()?);
    if config.log_json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("db") {
        return run_db(args).await;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        "Seckill Daemon"
    );

    let daemon = build_daemon(config).await?;
    daemon.run().await?;

    Ok(())
}

#[cfg(feature = "postgres")]
async fn run_db(args: Vec<String>) -> anyhow::Result<()> {
    seckilld::db::run_db_command(args).await
}

#[cfg(not(feature = "postgres"))]
async fn run_db(_args: Vec<String>) -> anyhow::Result<()> {
    anyhow::bail!("db commands require the postgres feature")
}

#[cfg(feature = "postgres")]
async fn build_daemon(config: Config) -> anyhow::Result<Daemon> {
    match config.database_url.clone() {
        Some(url) => {
            let pool = sqlx::PgPool::connect(&url).await?;
            seckill_db::migrate(&pool).await?;
            info!("Using PostgreSQL backends");
            Ok(Daemon::new_postgres(config, pool)?)
        },
        None => {
            info!("DATABASE_URL not set, using in-memory backends");
            Ok(Daemon::new_memory(config)?)
        },
    }
}

#[cfg(not(feature = "postgres"))]
async fn build_daemon(config: Config) -> anyhow::Result<Daemon> {
    info!("Using in-memory backends");
    Ok(Daemon::new_memory(config)?)
}
