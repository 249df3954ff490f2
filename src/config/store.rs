//! State storage connection settings

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which store backend to connect to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Redis,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(StoreBackend::Memory),
            "redis" => Ok(StoreBackend::Redis),
            other => Err(format!("unknown store backend: {}", other)),
        }
    }
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Memory => write!(f, "memory"),
            StoreBackend::Redis => write!(f, "redis"),
        }
    }
}

/// Store connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// Store URL (ignored by the memory backend)
    pub url: String,
    /// Maximum connections checked out at once
    pub pool_size: usize,
    /// Pooled connections idle longer than this are closed
    pub idle_timeout_seconds: u64,
    /// Longest wait for a free connection
    pub acquire_timeout_ms: u64,
    /// Ids fetched per store round-trip when paging pool queries
    pub page_size: usize,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: "redis://localhost:6379".to_string(),
            pool_size: 16,
            idle_timeout_seconds: 300,
            acquire_timeout_ms: 2000,
            page_size: 1000,
        }
    }
}

impl StoreSettings {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}
