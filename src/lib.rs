//! Parlor State - shared matchmaking state over a key-value store
//!
//! This crate provides the state-coordination layer of a distributed
//! matchmaking system: a ledger of player requests, time-windowed ignore
//! lists, an attribute index for pool queries and per-player assignment
//! delivery. Every participant talks to the same store and relies on its
//! atomic operations instead of local locks.

pub mod assignment;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod index;
pub mod keys;
pub mod ledger;
pub mod metrics;
pub mod service;
pub mod store;
pub mod types;
pub mod utils;
pub mod visibility;

// Re-export commonly used types and traits
pub use error::{Result, StateError};
pub use types::*;

// Re-export key components
pub use coordinator::RequestCoordinator;
pub use index::{PoolFilter, PoolQuery};
pub use store::{KeyValueStore, MemoryStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
