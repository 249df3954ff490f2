//! Health checks and monitoring
//!
//! This module provides health check functionality for the parlor-state
//! service, including readiness and liveness probes. Readiness performs a
//! real store round-trip.

use crate::keys;
use crate::store::{self, Command, KeyValueStore};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, error};

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value (0=unhealthy, 1=degraded, 2=healthy)
    pub fn as_gauge(&self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    fn worst(self, other: HealthStatus) -> HealthStatus {
        if self.as_gauge() <= other.as_gauge() {
            self
        } else {
            other
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// What the health checks look at
#[derive(Clone)]
pub struct HealthProbe {
    /// Service name reported in responses
    pub service_name: String,
    pub store: Arc<dyn KeyValueStore>,
    pub is_running: Arc<RwLock<bool>>,
    /// Configured ignore list names
    pub ignore_lists: Vec<String>,
    /// Upper bound on the readiness round-trip's pool wait
    pub acquire_timeout: Duration,
    pub started_at: Instant,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Overall service status
    pub status: HealthStatus,
    /// Service name
    pub service: String,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Detailed component checks
    pub checks: Vec<ComponentCheck>,
    /// Service statistics
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    /// Component name
    pub name: String,
    /// Component status
    pub status: HealthStatus,
    /// Optional error message if unhealthy
    pub message: Option<String>,
    /// Check duration in milliseconds
    pub duration_ms: u64,
}

/// Service statistics for health reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    /// Store pool capacity
    pub pool_size: usize,
    /// Connections currently checked out
    pub connections_in_use: usize,
    /// Configured ignore lists
    pub ignore_lists: Vec<String>,
    /// Seconds since the service started
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Perform a comprehensive health check of the service
    pub async fn check(probe: &HealthProbe) -> Result<Self> {
        let mut checks = Vec::new();
        let mut overall_status = HealthStatus::Healthy;

        let service_check = Self::check_service_running(probe).await;
        if service_check.status != HealthStatus::Healthy {
            overall_status = HealthStatus::Unhealthy;
        }
        checks.push(service_check);

        let store_check = Self::check_store(probe).await;
        overall_status = overall_status.worst(store_check.status);
        checks.push(store_check);

        let pool_check = Self::check_pool(probe);
        overall_status = overall_status.worst(pool_check.status);
        checks.push(pool_check);

        Ok(HealthCheck {
            status: overall_status,
            service: probe.service_name.clone(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats: Self::gather_service_stats(probe),
        })
    }

    /// Simple liveness check - just verify service is running
    pub async fn liveness_check(probe: &HealthProbe) -> Result<HealthStatus> {
        if *probe.is_running.read().await {
            Ok(HealthStatus::Healthy)
        } else {
            Ok(HealthStatus::Unhealthy)
        }
    }

    /// Readiness check - verify the store answers
    pub async fn readiness_check(probe: &HealthProbe) -> Result<HealthStatus> {
        if !*probe.is_running.read().await {
            return Ok(HealthStatus::Unhealthy);
        }

        let store_status = Self::check_store(probe).await.status;
        Ok(store_status.worst(Self::check_pool(probe).status))
    }

    /// Check if service is running
    async fn check_service_running(probe: &HealthProbe) -> ComponentCheck {
        let start = Instant::now();

        let (status, message) = if *probe.is_running.read().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Round-trip a read through the store
    async fn check_store(probe: &HealthProbe) -> ComponentCheck {
        let start = Instant::now();

        let result = store::run(
            probe.store.as_ref(),
            Some(probe.acquire_timeout),
            Command::ZCard {
                key: keys::ALL_REQUESTS_INDEX.to_string(),
            },
        )
        .await;

        let (status, message) = match result {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) if e.is_transient() => {
                error!("Store health check failed: {}", e);
                (HealthStatus::Unhealthy, Some(e.to_string()))
            }
            Err(e) => (HealthStatus::Degraded, Some(e.to_string())),
        };

        ComponentCheck {
            name: "store".to_string(),
            status,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Degraded while every pooled connection is checked out
    fn check_pool(probe: &HealthProbe) -> ComponentCheck {
        let start = Instant::now();
        let status = probe.store.status();

        let (health, message) = if status.size > 0 && status.available == 0 {
            debug!("Store pool fully checked out ({} connections)", status.size);
            (
                HealthStatus::Degraded,
                Some(format!("All {} connections in use", status.size)),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        ComponentCheck {
            name: "store_pool".to_string(),
            status: health,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Gather current service statistics
    fn gather_service_stats(probe: &HealthProbe) -> ServiceStats {
        let status = probe.store.status();
        ServiceStats {
            pool_size: status.size,
            connections_in_use: status.checked_out(),
            ignore_lists: probe.ignore_lists.clone(),
            uptime_seconds: probe.started_at.elapsed().as_secs(),
        }
    }
}

/// Convert health check to JSON string
impl HealthCheck {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}
