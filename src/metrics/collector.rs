//! Metrics collection using Prometheus
//!
//! This module provides metrics collection for the parlor-state
//! coordination layer using Prometheus metrics.

use crate::error::StateError;
use crate::store::PoolStatus;
use anyhow::Result;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the state-coordination service
#[derive(Clone)]
pub struct MetricsCollector {
    /// Prometheus registry
    registry: Arc<Registry>,

    /// Service-level metrics
    service_metrics: ServiceMetrics,

    /// Request lifecycle metrics
    request_metrics: RequestMetrics,

    /// Ignore list metrics
    visibility_metrics: VisibilityMetrics,

    /// Store and pool metrics
    store_metrics: StoreMetrics,
}

/// Service-level metrics
#[derive(Clone)]
pub struct ServiceMetrics {
    /// Service uptime in seconds
    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    /// Component health status
    pub component_health: IntGaugeVec,
}

/// Request lifecycle metrics
#[derive(Clone)]
pub struct RequestMetrics {
    /// Coordinator operations by outcome
    pub operations_total: IntCounterVec,

    /// Coordinator operation durations
    pub operation_duration: HistogramVec,

    /// Finished assignment watches by outcome
    pub watch_outcomes_total: IntCounterVec,

    /// Watches currently waiting
    pub active_watches: IntGauge,
}

/// Ignore list metrics
#[derive(Clone)]
pub struct VisibilityMetrics {
    /// Exclusion marks written per list
    pub marks_total: IntCounterVec,

    /// Failed exclusion writes per list
    pub mark_failures_total: IntCounterVec,

    /// Entries reclaimed by sweeps
    pub swept_entries_total: IntCounter,
}

/// Store and pool metrics
#[derive(Clone)]
pub struct StoreMetrics {
    /// Store errors by error kind
    pub errors_total: IntCounterVec,

    /// Pool capacity
    pub pool_size: IntGauge,

    /// Connections currently checked out
    pub connections_in_use: IntGauge,

    /// Idle connections closed by pruning
    pub idle_closed_total: IntCounter,
}

impl MetricsCollector {
    /// Create a new metrics collector with default registry
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());
        Self::with_registry(registry)
    }

    /// Create a new metrics collector with custom registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let service_metrics = ServiceMetrics::new(&registry)?;
        let request_metrics = RequestMetrics::new(&registry)?;
        let visibility_metrics = VisibilityMetrics::new(&registry)?;
        let store_metrics = StoreMetrics::new(&registry)?;

        Ok(Self {
            registry,
            service_metrics,
            request_metrics,
            visibility_metrics,
            store_metrics,
        })
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Get service metrics
    pub fn service(&self) -> &ServiceMetrics {
        &self.service_metrics
    }

    /// Get request metrics
    pub fn requests(&self) -> &RequestMetrics {
        &self.request_metrics
    }

    /// Get visibility metrics
    pub fn visibility(&self) -> &VisibilityMetrics {
        &self.visibility_metrics
    }

    /// Get store metrics
    pub fn store(&self) -> &StoreMetrics {
        &self.store_metrics
    }

    /// Record a coordinator operation and, on failure, its error kind
    pub fn record_operation<T>(
        &self,
        operation: &str,
        result: &std::result::Result<T, StateError>,
        duration: Duration,
    ) {
        let status = match result {
            Ok(_) => "success",
            Err(e) => {
                self.record_error(e);
                "error"
            }
        };

        self.request_metrics
            .operations_total
            .with_label_values(&[operation, status])
            .inc();

        self.request_metrics
            .operation_duration
            .with_label_values(&[operation])
            .observe(duration.as_secs_f64());
    }

    /// Count an error by kind
    pub fn record_error(&self, error: &StateError) {
        self.store_metrics
            .errors_total
            .with_label_values(&[error_kind(error)])
            .inc();
    }

    /// Record a watch starting
    pub fn record_watch_started(&self) {
        self.request_metrics.active_watches.inc();
    }

    /// Record a watch finishing
    pub fn record_watch_finished<T>(&self, result: &std::result::Result<T, StateError>) {
        let outcome = match result {
            Ok(_) => "resolved",
            Err(StateError::TimedOut { .. }) => "timed_out",
            Err(StateError::Cancelled { .. }) => "cancelled",
            Err(_) => "error",
        };

        self.request_metrics.active_watches.dec();
        self.request_metrics
            .watch_outcomes_total
            .with_label_values(&[outcome])
            .inc();
    }

    /// Record exclusion marks written to a list
    pub fn record_marks(&self, list: &str, count: usize) {
        self.visibility_metrics
            .marks_total
            .with_label_values(&[list])
            .inc_by(count as u64);
    }

    /// Record a failed exclusion write
    pub fn record_mark_failure(&self, list: &str) {
        self.visibility_metrics
            .mark_failures_total
            .with_label_values(&[list])
            .inc();
    }

    /// Record entries reclaimed by a sweep
    pub fn record_sweep(&self, removed: usize) {
        self.visibility_metrics
            .swept_entries_total
            .inc_by(removed as u64);
    }

    /// Update pool gauges
    pub fn update_pool_status(&self, status: PoolStatus) {
        self.store_metrics.pool_size.set(status.size as i64);
        self.store_metrics
            .connections_in_use
            .set(status.checked_out() as i64);
    }

    /// Record idle connections closed by pruning
    pub fn record_idle_closed(&self, closed: usize) {
        self.store_metrics.idle_closed_total.inc_by(closed as u64);
    }

    /// Update health status
    pub fn update_health_status(&self, status: u8) {
        self.service_metrics.health_status.set(status as i64);
    }

    /// Update component health
    pub fn update_component_health(&self, component: &str, healthy: bool) {
        let status = if healthy { 1 } else { 0 };
        self.service_metrics
            .component_health
            .with_label_values(&[component])
            .set(status);
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

fn error_kind(error: &StateError) -> &'static str {
    match error {
        StateError::NotFound { .. } => "not_found",
        StateError::AlreadyExists { .. } => "already_exists",
        StateError::DuplicateRequest { .. } => "duplicate_request",
        StateError::Store { .. } => "store",
        StateError::PoolExhausted { .. } => "pool_exhausted",
        StateError::TimedOut { .. } => "timed_out",
        StateError::Cancelled { .. } => "cancelled",
        StateError::UnknownIgnoreList { .. } => "unknown_ignore_list",
        StateError::InvalidProperties { .. } => "invalid_properties",
        StateError::Configuration { .. } => "configuration",
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get the elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Stop the timer and return the duration
    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl ServiceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let uptime_seconds =
            IntGauge::new("parlor_state_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "parlor_state_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("parlor_state_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

impl RequestMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let operations_total = IntCounterVec::new(
            Opts::new(
                "parlor_state_operations_total",
                "Total coordinator operations",
            ),
            &["operation", "status"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "parlor_state_operation_duration_seconds",
                "Coordinator operation duration",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["operation"],
        )?;
        registry.register(Box::new(operation_duration.clone()))?;

        let watch_outcomes_total = IntCounterVec::new(
            Opts::new(
                "parlor_state_watch_outcomes_total",
                "Finished assignment watches",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(watch_outcomes_total.clone()))?;

        let active_watches = IntGauge::new(
            "parlor_state_active_watches",
            "Assignment watches currently waiting",
        )?;
        registry.register(Box::new(active_watches.clone()))?;

        Ok(Self {
            operations_total,
            operation_duration,
            watch_outcomes_total,
            active_watches,
        })
    }
}

impl VisibilityMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let marks_total = IntCounterVec::new(
            Opts::new(
                "parlor_state_ignore_list_marks_total",
                "Exclusion marks written",
            ),
            &["list"],
        )?;
        registry.register(Box::new(marks_total.clone()))?;

        let mark_failures_total = IntCounterVec::new(
            Opts::new(
                "parlor_state_ignore_list_mark_failures_total",
                "Exclusion writes that failed after retries",
            ),
            &["list"],
        )?;
        registry.register(Box::new(mark_failures_total.clone()))?;

        let swept_entries_total = IntCounter::new(
            "parlor_state_swept_entries_total",
            "Ignore list entries reclaimed by sweeps",
        )?;
        registry.register(Box::new(swept_entries_total.clone()))?;

        Ok(Self {
            marks_total,
            mark_failures_total,
            swept_entries_total,
        })
    }
}

impl StoreMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let errors_total = IntCounterVec::new(
            Opts::new("parlor_state_errors_total", "Errors by kind"),
            &["kind"],
        )?;
        registry.register(Box::new(errors_total.clone()))?;

        let pool_size = IntGauge::new("parlor_state_pool_size", "Store connection pool size")?;
        registry.register(Box::new(pool_size.clone()))?;

        let connections_in_use = IntGauge::new(
            "parlor_state_connections_in_use",
            "Store connections currently checked out",
        )?;
        registry.register(Box::new(connections_in_use.clone()))?;

        let idle_closed_total = IntCounter::new(
            "parlor_state_idle_connections_closed_total",
            "Idle store connections closed",
        )?;
        registry.register(Box::new(idle_closed_total.clone()))?;

        Ok(Self {
            errors_total,
            pool_size,
            connections_in_use,
            idle_closed_total,
        })
    }
}
