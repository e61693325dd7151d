//! Daemon: Main runtime orchestrator.
//!
//! The Daemon ties together all components:
//! - Order Pipeline (admission and processing)
//! - Order Workers (queue consumers)
//! - Event Bus (pipeline observation)
//! - API Server (HTTP endpoints)
//!
//! # Lifecycle
//!
//! 1. Load configuration
//! 2. Wire backends (memory, or PostgreSQL with the `postgres` feature)
//! 3. Start API server
//! 4. Spawn order workers
//! 5. Main event loop (log pipeline events)
//! 6. Graceful shutdown on SIGINT: stop HTTP, cancel workers, await them

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use seckill_exec::{MemoryFastStore, MemoryLockService, MemoryOrderQueue};
use seckill_store::MemoryStore;

use crate::api::{create_router, ApiState};
use crate::config::Config;
use crate::error::{DaemonError, DaemonResult};
use crate::event_bus::{EventBus, PipelineEvent};
use crate::metrics::Metrics;
use crate::order_pipeline::{Backends, OrderPipeline};
use crate::worker::OrderWorker;

// =============================================================================
// Daemon
// =============================================================================

/// The main seckill daemon.
pub struct Daemon {
    /// Configuration
    config: Config,
    /// Order pipeline shared by the API and workers
    pipeline: Arc<OrderPipeline>,
    /// Event bus
    event_bus: Arc<EventBus>,
}

impl Daemon {
    /// Create a daemon over the given backends.
    pub fn new(config: Config, backends: Backends) -> DaemonResult<Self> {
        config.validate()?;

        let event_bus = Arc::new(EventBus::new(1000));
        let pipeline = Arc::new(OrderPipeline::new(
            backends,
            config.lock_ttl(),
            event_bus.clone(),
            Metrics::new()?,
        ));

        Ok(Self { config, pipeline, event_bus })
    }

    /// Create a daemon with in-memory backends (for testing/development).
    pub fn new_memory(config: Config) -> DaemonResult<Self> {
        let backends = Backends {
            store: Arc::new(MemoryStore::new()),
            fast_store: Arc::new(MemoryFastStore::new()),
            locks: Arc::new(MemoryLockService::new()),
            queue: Arc::new(MemoryOrderQueue::new(config.queue_config())),
        };
        Self::new(config, backends)
    }

    /// Create a daemon with PostgreSQL backends.
    #[cfg(feature = "postgres")]
    pub fn new_postgres(config: Config, pool: sqlx::PgPool) -> DaemonResult<Self> {
        use seckill_exec::{PgFastStore, PgLockService, PgOrderQueue};
        use seckill_store::PgStore;

        let pool = Arc::new(pool);
        let backends = Backends {
            store: Arc::new(PgStore::new(pool.clone())),
            fast_store: Arc::new(PgFastStore::new(pool.clone())),
            locks: Arc::new(PgLockService::new(pool.clone())),
            queue: Arc::new(PgOrderQueue::new(pool, config.queue_config())),
        };
        Self::new(config, backends)
    }

    /// Order pipeline shared by the API and workers.
    pub fn pipeline(&self) -> Arc<OrderPipeline> {
        self.pipeline.clone()
    }

    /// Run the daemon.
    ///
    /// This method blocks until shutdown is requested (SIGINT).
    pub async fn run(self) -> DaemonResult<()> {
        let shutdown = CancellationToken::new();

        let signal = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received shutdown signal"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            signal.cancel();
        });

        self.run_until(shutdown).await
    }

    /// Run the daemon until `shutdown` is cancelled.
    pub async fn run_until(self, shutdown: CancellationToken) -> DaemonResult<()> {
        info!(
            version = env!("CARGO_PKG_VERSION"),
            environment = %self.config.environment,
            workers = self.config.workers.count,
            "Starting seckill daemon"
        );

        // 1. Start API server
        let (api_addr, server) = self.start_api_server(shutdown.clone()).await?;
        info!(%api_addr, "API server started");

        // 2. Spawn order workers
        let workers = self.spawn_workers(&shutdown);

        // 3. Subscribe to event bus
        let mut event_receiver = self.event_bus.subscribe();

        // 4. Main event loop
        info!("Entering main event loop");
        loop {
            tokio::select! {
                Some(event_result) = event_receiver.recv() => {
                    match event_result {
                        Ok(event) => self.handle_event(event),
                        Err(lag_msg) => {
                            warn!(%lag_msg, "Event receiver lagged");
                        }
                    }
                }

                _ = shutdown.cancelled() => {
                    break;
                }
            }
        }

        // 5. Graceful shutdown
        self.shutdown(server, workers).await
    }

    /// Start the API server. It stops accepting connections once `shutdown` is cancelled.
    async fn start_api_server(
        &self,
        shutdown: CancellationToken,
    ) -> DaemonResult<(SocketAddr, JoinHandle<()>)> {
        let state = Arc::new(ApiState { pipeline: self.pipeline.clone() });

        let router = create_router(state);
        let addr = format!("{}:{}", self.config.api.host, self.config.api.port);

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| DaemonError::Api(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| DaemonError::Api(format!("Failed to get local address: {}", e)))?;

        // Spawn the server task
        let handle = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(e) = serve.await {
                error!(error = %e, "API server error");
            }
        });

        Ok((local_addr, handle))
    }

    fn spawn_workers(&self, shutdown: &CancellationToken) -> Vec<JoinHandle<DaemonResult<()>>> {
        let poll_interval = Duration::from_millis(self.config.workers.poll_interval_ms);

        (0..self.config.workers.count)
            .map(|id| {
                let worker = OrderWorker::new(id, self.pipeline.clone(), poll_interval);
                tokio::spawn(worker.run(shutdown.clone()))
            })
            .collect()
    }

    fn handle_event(&self, event: PipelineEvent) {
        match event {
            PipelineEvent::OrderAdmitted { order_id, user_id, voucher_id, .. } => {
                debug!(order_id, user_id, voucher_id, "Order admitted");
            },
            PipelineEvent::OrderPersisted { order_id, outcome, .. } => {
                debug!(order_id, outcome = outcome.as_str(), "Order settled");
            },
            PipelineEvent::PublishFailed { order_id, confirm, .. } => {
                // Admitted in the fast store but never queued; needs reconciliation
                warn!(order_id, ?confirm, "Admitted order has no queued intent");
            },
            PipelineEvent::DeliveryRedelivered { delivery_tag, reason, .. } => {
                debug!(delivery_tag, %reason, "Delivery redelivered");
            },
            PipelineEvent::DeadLettered { correlation_id, reason, .. } => {
                warn!(%correlation_id, %reason, "Order intent needs operator attention");
            },
        }
    }

    /// Graceful shutdown.
    async fn shutdown(
        &self,
        server: JoinHandle<()>,
        workers: Vec<JoinHandle<DaemonResult<()>>>,
    ) -> DaemonResult<()> {
        info!("Initiating graceful shutdown");

        server
            .await
            .map_err(|e| DaemonError::Api(format!("API server task failed: {}", e)))?;

        let mut failed = 0;
        for handle in workers {
            match handle.await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => {
                    error!(error = %e, "Order worker exited with error");
                    failed += 1;
                },
                Err(e) => {
                    error!(error = %e, "Order worker task panicked");
                    failed += 1;
                },
            }
        }

        if failed > 0 {
            return Err(DaemonError::Worker(format!("{} order workers failed", failed)));
        }

        info!("Shutdown complete");
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================
