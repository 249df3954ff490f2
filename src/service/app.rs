//! Main application state and service coordination
//!
//! This module contains the production AppState that owns the store pool,
//! the request coordinator, the health server and the background
//! maintenance tasks.

use crate::config::{AppConfig, StoreBackend};
use crate::coordinator::RequestCoordinator;
use crate::metrics::health::HealthServerConfig;
use crate::metrics::{HealthServer, MetricsCollector, MetricsService};
use crate::service::health::{HealthCheck, HealthProbe};
use crate::store::{KeyValueStore, MemoryStore};
use crate::utils::{Clock, SystemClock};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Store connection error: {message}")]
    StoreConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

fn build_probe(
    config: &AppConfig,
    store: Arc<dyn KeyValueStore>,
    is_running: Arc<RwLock<bool>>,
    started_at: Instant,
) -> HealthProbe {
    HealthProbe {
        service_name: config.service.name.clone(),
        store,
        is_running,
        ignore_lists: config
            .ignore_lists
            .iter()
            .map(|list| list.name.clone())
            .collect(),
        acquire_timeout: config.store.acquire_timeout(),
        started_at,
    }
}

/// Main application state
pub struct AppState {
    /// Application configuration
    config: AppConfig,

    /// Shared state storage
    store: Arc<dyn KeyValueStore>,

    /// Request lifecycle operations
    coordinator: RequestCoordinator,

    /// Metrics service for monitoring and health checks
    metrics_service: Arc<MetricsService>,

    /// Background task handles
    background_tasks: Vec<JoinHandle<()>>,

    /// Stops the background tasks
    shutdown: CancellationToken,

    /// Service status
    is_running: Arc<RwLock<bool>>,

    started_at: Instant,
}

impl AppState {
    /// Initialize the application, connecting to the configured store
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing parlor-state service");
        info!(
            "Configuration: service={}, store={}, pool_size={}",
            config.service.name, config.store.backend, config.store.pool_size
        );

        let store = Self::initialize_store(&config).await?;
        Self::with_store(config, store)
    }

    /// Initialize the application over an existing store
    pub fn with_store(
        config: AppConfig,
        store: Arc<dyn KeyValueStore>,
    ) -> Result<Self, ServiceError> {
        let metrics_collector =
            Arc::new(
                MetricsCollector::new().map_err(|e| ServiceError::Initialization {
                    message: format!("Failed to create metrics collector: {}", e),
                })?,
            );

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let coordinator =
            RequestCoordinator::new(store.clone(), &config, clock, metrics_collector.clone());

        let is_running = Arc::new(RwLock::new(false));
        let started_at = Instant::now();
        let probe = build_probe(&config, store.clone(), is_running.clone(), started_at);

        info!(
            "Initializing metrics service on port {}",
            config.service.health_port
        );
        let health_config = HealthServerConfig {
            port: config.service.health_port,
            host: "0.0.0.0".to_string(),
        };
        let health_server = Arc::new(
            HealthServer::new(health_config, metrics_collector.clone()).with_probe(probe),
        );
        let metrics_service = Arc::new(MetricsService::new(metrics_collector, health_server));

        Ok(Self {
            config,
            store,
            coordinator,
            metrics_service,
            background_tasks: Vec::new(),
            shutdown: CancellationToken::new(),
            is_running,
            started_at,
        })
    }

    async fn initialize_store(config: &AppConfig) -> Result<Arc<dyn KeyValueStore>, ServiceError> {
        match config.store.backend {
            StoreBackend::Memory => {
                info!(
                    "Using in-process memory store with {} connections",
                    config.store.pool_size
                );
                Ok(Arc::new(MemoryStore::new(config.store.pool_size)))
            }
            #[cfg(feature = "redis-storage")]
            StoreBackend::Redis => {
                info!("Connecting to Redis state storage: {}", config.store.url);
                let store =
                    crate::store::RedisStore::connect(&config.store.url, config.store.pool_size)
                        .await
                        .map_err(|e| ServiceError::StoreConnection {
                            message: format!("Failed to connect to Redis: {}", e),
                        })?;
                Ok(Arc::new(store))
            }
            #[cfg(not(feature = "redis-storage"))]
            StoreBackend::Redis => Err(ServiceError::Configuration {
                message: "Redis backend requires the redis-storage feature".to_string(),
            }),
        }
    }

    /// Start the health server and background maintenance tasks
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting parlor-state service");

        *self.is_running.write().await = true;

        self.start_metrics_service().await?;
        self.start_background_tasks();

        info!("Parlor-state service started successfully");
        Ok(())
    }

    /// Perform graceful shutdown
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown of parlor-state service");

        *self.is_running.write().await = false;
        self.shutdown.cancel();

        info!("Stopping metrics service...");
        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop metrics service: {}", e);
        }

        self.stop_background_tasks().await;

        let status = self.store.status();
        info!(
            pool_size = status.size,
            connections_in_use = status.checked_out(),
            uptime_seconds = self.started_at.elapsed().as_secs(),
            "Parlor-state service shutdown completed"
        );

        Ok(())
    }

    /// Get service configuration
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Check if service is running
    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Request lifecycle operations
    pub fn coordinator(&self) -> &RequestCoordinator {
        &self.coordinator
    }

    /// Shared state storage
    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        self.store.clone()
    }

    /// Get metrics service
    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    /// Run the full health check once
    pub async fn health(&self) -> anyhow::Result<HealthCheck> {
        HealthCheck::check(&self.probe()).await
    }

    /// Probe over this service's store and status
    pub fn probe(&self) -> HealthProbe {
        build_probe(
            &self.config,
            self.store.clone(),
            self.is_running.clone(),
            self.started_at,
        )
    }

    async fn start_metrics_service(&mut self) -> Result<(), ServiceError> {
        info!("Starting metrics and health endpoints");

        let metrics_service = self.metrics_service.clone();
        let port = self.config.service.health_port;

        let metrics_handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("Metrics service failed: {}", e);
            } else {
                info!("Metrics service task completed");
            }
        });
        self.background_tasks.push(metrics_handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;

        info!("Metrics service started on port {}", port);
        Ok(())
    }

    fn start_background_tasks(&mut self) {
        let sweep_interval = self.config.sweep_interval();
        info!(
            "Starting ignore list sweep task ({}s interval)...",
            sweep_interval.as_secs()
        );
        let sweep_task = {
            let coordinator = self.coordinator.clone();
            let store = self.store.clone();
            let idle_timeout = self.config.store.idle_timeout();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(sweep_interval);
                info!("Sweep task started");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }

                    match coordinator.sweep().await {
                        Ok(removed) if removed > 0 => {
                            info!("Swept {} ignore list entries", removed)
                        }
                        Ok(_) => debug!("Sweep completed - nothing to remove"),
                        Err(e) => warn!("Ignore list sweep failed: {}", e),
                    }

                    let closed = store.prune_idle(idle_timeout).await;
                    if closed > 0 {
                        debug!("Closed {} idle store connections", closed);
                        coordinator.metrics().record_idle_closed(closed);
                    }
                }

                info!("Sweep task stopped");
            })
        };

        info!("Starting health metrics task (30s interval)...");
        let health_metrics_task = {
            let metrics_collector = self.metrics_service.collector();
            let probe = self.probe();
            let shutdown = self.shutdown.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(Duration::from_secs(30));
                info!("Health metrics task started");

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = interval.tick() => {}
                    }

                    let uptime_seconds = probe.started_at.elapsed().as_secs() as i64;
                    metrics_collector
                        .service()
                        .uptime_seconds
                        .set(uptime_seconds);
                    metrics_collector.update_pool_status(probe.store.status());

                    match HealthCheck::check(&probe).await {
                        Ok(health) => {
                            metrics_collector.update_health_status(health.status.as_gauge());
                            for check in &health.checks {
                                metrics_collector.update_component_health(
                                    &check.name,
                                    check.status.as_gauge() > 0,
                                );
                            }
                        }
                        Err(e) => warn!("Health metrics update failed: {}", e),
                    }

                    debug!(
                        "Updated service health metrics - uptime: {}s",
                        uptime_seconds
                    );
                }

                info!("Health metrics task stopped");
            })
        };

        self.background_tasks.push(sweep_task);
        self.background_tasks.push(health_metrics_task);
        info!("2 background maintenance tasks started successfully");
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        if task_count == 0 {
            info!("No background tasks to stop");
            return;
        }

        info!("Stopping {} background tasks...", task_count);
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout();

        for (i, mut task) in self.background_tasks.drain(..).enumerate() {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => debug!("Background task {}/{} stopped", i + 1, task_count),
                Ok(Err(e)) => warn!("Background task {}/{} failed: {}", i + 1, task_count, e),
                Err(_) => {
                    warn!(
                        "Background task {}/{} did not stop in time, aborting",
                        i + 1,
                        task_count
                    );
                    task.abort();
                }
            }
        }

        info!("All {} background tasks stopped", task_count);
    }
}
