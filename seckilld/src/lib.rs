//! Seckill Daemon Library
//!
//! Runtime orchestrator for the flash-sale order pipeline.
//!
//! # Architecture
//!
//! ```text
//! HTTP → API Server → OrderPipeline::purchase → FastStore + OrderQueue
//!                                                    ↓
//!                     OrderWorker × N → OrderPipeline::poll_once → Store
//!                                                    ↓
//!                                   Event Bus, Metrics
//! ```
//!
//! # Components
//!
//! - **Daemon**: Main runtime orchestrator
//! - **Order Pipeline**: Admission, processing, and their reporting
//! - **Order Worker**: Queue consumer loop
//! - **Event Bus**: Pipeline observation
//! - **Metrics**: Prometheus counters and histograms
//! - **API**: HTTP endpoints
//! - **Config**: Environment-based configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use seckilld::{Config, Daemon};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config::from_env().expect("Failed to load config");
//!     let daemon = Daemon::new_memory(config).expect("Failed to build daemon");
//!     daemon.run().await.expect("Daemon error");
//! }
//! ```

#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod daemon;
#[cfg(feature = "postgres")]
pub mod db;
pub mod error;
pub mod event_bus;
pub mod metrics;
pub mod order_pipeline;
pub mod worker;

// Re-exports for convenience
pub use config::{ApiConfig, Config, Environment, QueueSettings, WorkerConfig};
pub use daemon::Daemon;
pub use error::{DaemonError, DaemonResult};
pub use event_bus::{EventBus, EventReceiver, PipelineEvent};
pub use metrics::Metrics;
pub use order_pipeline::{Backends, OrderPipeline};
pub use worker::OrderWorker;
