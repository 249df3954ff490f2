//! Configuration management for the parlor-state service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values for the state-storage layer.

pub mod app;
pub mod ignore_list;
pub mod store;

// Re-export commonly used types
pub use app::{
    validate_config, AppConfig, AssignmentSettings, IndexingSettings, ServiceSettings,
    VisibilitySettings,
};
pub use ignore_list::{IgnoreListConfig, DEINDEXED_LIST, EXPIRED_LIST, PROPOSED_LIST};
pub use store::{StoreBackend, StoreSettings};
