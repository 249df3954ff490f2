//! Main application configuration
//!
//! This module defines the primary configuration structures for the
//! parlor-state service, including file and environment variable loading
//! and validation.

use crate::config::ignore_list::{IgnoreListConfig, DEINDEXED_LIST, PROPOSED_LIST};
use crate::config::store::{StoreBackend, StoreSettings};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::Path;
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub service: ServiceSettings,
    pub store: StoreSettings,
    pub assignment: AssignmentSettings,
    pub visibility: VisibilitySettings,
    pub indexing: IndexingSettings,
    pub ignore_lists: Vec<IgnoreListConfig>,
}

/// Service-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSettings {
    /// Service name for logging and metrics
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Port for health check and metrics endpoint
    pub health_port: u16,
    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_seconds: u64,
    /// Interval between ignore list sweeps in seconds
    pub sweep_interval_seconds: u64,
}

/// Assignment watch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssignmentSettings {
    /// Default wait for an assignment before giving up
    pub default_timeout_seconds: u64,
    /// Player record field holding the connection string
    pub connstring_field: String,
    /// First poll delay
    pub initial_poll_ms: u64,
    /// Upper bound on the poll delay
    pub max_poll_ms: u64,
    /// Growth factor between polls
    pub backoff_multiplier: f64,
    /// Random spread applied to each delay, as a fraction of it
    pub jitter: f64,
}

/// Ignore list write settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisibilitySettings {
    /// Attempts for a hide (mark) before the error is surfaced
    pub mark_retry_attempts: u32,
    /// Delay before the first hide retry, doubled per attempt
    pub mark_retry_delay_ms: u64,
}

/// Attribute indexing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexingSettings {
    /// Dotted attribute paths eligible for indexing
    pub fields: Vec<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            service: ServiceSettings::default(),
            store: StoreSettings::default(),
            assignment: AssignmentSettings::default(),
            visibility: VisibilitySettings::default(),
            indexing: IndexingSettings::default(),
            ignore_lists: IgnoreListConfig::defaults(),
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            name: "parlor-state".to_string(),
            log_level: "info".to_string(),
            health_port: 8080,
            shutdown_timeout_seconds: 30,
            sweep_interval_seconds: 60,
        }
    }
}

impl Default for AssignmentSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 30,
            connstring_field: "connstring".to_string(),
            initial_poll_ms: 250,
            max_poll_ms: 5000,
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl Default for VisibilitySettings {
    fn default() -> Self {
        Self {
            mark_retry_attempts: 3,
            mark_retry_delay_ms: 100,
        }
    }
}

impl Default for IndexingSettings {
    fn default() -> Self {
        Self {
            fields: vec![
                "region".to_string(),
                "mode".to_string(),
                "role".to_string(),
                "map".to_string(),
                "mmr.rating".to_string(),
            ],
        }
    }
}

impl AssignmentSettings {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_seconds)
    }

    pub fn initial_poll(&self) -> Duration {
        Duration::from_millis(self.initial_poll_ms)
    }

    pub fn max_poll(&self) -> Duration {
        Duration::from_millis(self.max_poll_ms)
    }
}

impl VisibilitySettings {
    pub fn mark_retry_delay(&self) -> Duration {
        Duration::from_millis(self.mark_retry_delay_ms)
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("Invalid {} value: {}", name, raw)),
        Err(_) => Ok(None),
    }
}

impl AppConfig {
    /// Load configuration from environment variables with fallback to defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    /// Load configuration from a TOML file; environment variables still override it
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: AppConfig = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_env()?;
        validate_config(&config)?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<()> {
        // Service settings
        if let Ok(name) = env::var("SERVICE_NAME") {
            self.service.name = name;
        }
        if let Ok(log_level) = env::var("LOG_LEVEL") {
            self.service.log_level = log_level;
        }
        if let Some(port) = parse_env("HEALTH_PORT")? {
            self.service.health_port = port;
        }
        if let Some(timeout) = parse_env("SHUTDOWN_TIMEOUT_SECONDS")? {
            self.service.shutdown_timeout_seconds = timeout;
        }
        if let Some(interval) = parse_env("SWEEP_INTERVAL_SECONDS")? {
            self.service.sweep_interval_seconds = interval;
        }

        // Store settings
        if let Some(backend) = parse_env::<StoreBackend>("STORE_BACKEND")? {
            self.store.backend = backend;
        }
        if let Ok(url) = env::var("STORE_URL") {
            self.store.url = url;
        }
        if let Some(size) = parse_env("STORE_POOL_SIZE")? {
            self.store.pool_size = size;
        }
        if let Some(idle) = parse_env("STORE_IDLE_TIMEOUT_SECONDS")? {
            self.store.idle_timeout_seconds = idle;
        }
        if let Some(acquire) = parse_env("STORE_ACQUIRE_TIMEOUT_MS")? {
            self.store.acquire_timeout_ms = acquire;
        }
        if let Some(page) = parse_env("STORE_PAGE_SIZE")? {
            self.store.page_size = page;
        }

        // Assignment settings
        if let Some(timeout) = parse_env("ASSIGNMENT_TIMEOUT_SECONDS")? {
            self.assignment.default_timeout_seconds = timeout;
        }
        if let Some(initial) = parse_env("ASSIGNMENT_INITIAL_POLL_MS")? {
            self.assignment.initial_poll_ms = initial;
        }
        if let Some(max) = parse_env("ASSIGNMENT_MAX_POLL_MS")? {
            self.assignment.max_poll_ms = max;
        }

        // Indexing settings
        if let Ok(fields) = env::var("INDEX_FIELDS") {
            self.indexing.fields = fields
                .split(',')
                .map(str::trim)
                .filter(|field| !field.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(())
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.service.shutdown_timeout_seconds)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.service.sweep_interval_seconds)
    }
}

/// Validate configuration values
pub fn validate_config(config: &AppConfig) -> Result<()> {
    // Validate log level
    match config.service.log_level.to_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => {}
        _ => return Err(anyhow!("Invalid log level: {}", config.service.log_level)),
    }

    if config.service.health_port == 0 {
        return Err(anyhow!("Health port cannot be 0"));
    }
    if config.service.shutdown_timeout_seconds == 0 {
        return Err(anyhow!("Shutdown timeout must be greater than 0"));
    }
    if config.service.sweep_interval_seconds == 0 {
        return Err(anyhow!("Sweep interval must be greater than 0"));
    }

    // Validate store settings
    if config.store.pool_size == 0 {
        return Err(anyhow!("Store pool size must be greater than 0"));
    }
    if config.store.page_size == 0 {
        return Err(anyhow!("Store page size must be greater than 0"));
    }
    if config.store.acquire_timeout_ms == 0 {
        return Err(anyhow!("Store acquire timeout must be greater than 0"));
    }
    if config.store.backend == StoreBackend::Redis && config.store.url.is_empty() {
        return Err(anyhow!("Store URL cannot be empty for the redis backend"));
    }

    // Validate assignment settings
    let assignment = &config.assignment;
    if assignment.default_timeout_seconds == 0 {
        return Err(anyhow!("Assignment timeout must be greater than 0"));
    }
    if assignment.connstring_field.is_empty() {
        return Err(anyhow!("Connection string field cannot be empty"));
    }
    if assignment.initial_poll_ms == 0 || assignment.max_poll_ms < assignment.initial_poll_ms {
        return Err(anyhow!(
            "Poll interval bounds are invalid: initial {}ms, max {}ms",
            assignment.initial_poll_ms,
            assignment.max_poll_ms
        ));
    }
    if assignment.backoff_multiplier < 1.0 {
        return Err(anyhow!("Backoff multiplier must be at least 1.0"));
    }
    if !(0.0..1.0).contains(&assignment.jitter) {
        return Err(anyhow!("Jitter must be within [0, 1)"));
    }

    // Validate ignore lists
    let mut names = HashSet::new();
    for list in &config.ignore_lists {
        if list.name.is_empty() {
            return Err(anyhow!("Ignore list name cannot be empty"));
        }
        if !names.insert(list.name.as_str()) {
            return Err(anyhow!("Duplicate ignore list: {}", list.name));
        }
    }
    for required in [PROPOSED_LIST, DEINDEXED_LIST] {
        if !names.contains(required) {
            return Err(anyhow!("Ignore list '{}' must be configured", required));
        }
    }

    if config.indexing.fields.iter().any(|field| field.is_empty()) {
        return Err(anyhow!("Index field paths cannot be empty"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(validate_config(&config).is_ok());
        assert_eq!(config.assignment.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.ignore_lists.len(), 3);
    }

    #[test]
    fn test_missing_required_list_is_rejected() {
        let mut config = AppConfig::default();
        config.ignore_lists.retain(|list| list.name != PROPOSED_LIST);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_duplicate_list_is_rejected() {
        let mut config = AppConfig::default();
        config.ignore_lists.push(IgnoreListConfig::proposed());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_poll_bounds_are_rejected() {
        let mut config = AppConfig::default();
        config.assignment.max_poll_ms = 10;
        config.assignment.initial_poll_ms = 100;
        assert!(validate_config(&config).is_err());

        let mut config = AppConfig::default();
        config.assignment.jitter = 1.0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let raw = r#"
            [store]
            pool_size = 4

            [[ignore_lists]]
            name = "proposed"
            offset_seconds = 0
            duration_seconds = 60

            [[ignore_lists]]
            name = "deindexed"
            offset_seconds = 0
            duration_seconds = 60
        "#;
        let config: AppConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.store.pool_size, 4);
        assert_eq!(config.store.page_size, 1000);
        assert_eq!(config.ignore_lists.len(), 2);
        assert!(!config.ignore_lists[0].mark_on_submit);
        assert!(validate_config(&config).is_ok());
    }
}
