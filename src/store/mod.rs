//! Key-value store adapter
//!
//! A pooled, concurrent-safe connection abstraction over a single shared
//! store that offers hash fields, sorted sets and atomic multi-command
//! transactions. Everything above this module treats the store as the only
//! source of truth and never adds client-side locking.
//!
//! Connections are checked out with [`KeyValueStore::acquire`], which is
//! bounded by the pool size and an optional deadline. The returned
//! [`StoreConnection`] goes back to the pool when it is released or dropped,
//! so every exit path (including timeouts and cancelled futures) gives the
//! connection back.

pub mod memory;
#[cfg(feature = "redis-storage")]
pub mod redis;

pub use memory::MemoryStore;
#[cfg(feature = "redis-storage")]
pub use self::redis::RedisStore;

use crate::error::{Result, StateError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tracing::error;

/// One end of a sorted-set score range
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreBound {
    Unbounded,
    Inclusive(f64),
    Exclusive(f64),
}

impl ScoreBound {
    /// Whether `score` lies on the allowed side of this bound used as a minimum
    pub fn admits_from_below(&self, score: f64) -> bool {
        match *self {
            ScoreBound::Unbounded => true,
            ScoreBound::Inclusive(min) => score >= min,
            ScoreBound::Exclusive(min) => score > min,
        }
    }

    /// Whether `score` lies on the allowed side of this bound used as a maximum
    pub fn admits_from_above(&self, score: f64) -> bool {
        match *self {
            ScoreBound::Unbounded => true,
            ScoreBound::Inclusive(max) => score <= max,
            ScoreBound::Exclusive(max) => score < max,
        }
    }
}

/// Insertion policy for sorted-set members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZAddMode {
    /// Insert or overwrite the score
    Upsert,
    /// Only insert members that are not present (first insertion governs)
    OnlyNew,
    /// Only update members that are already present
    OnlyExisting,
}

/// A single store command
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    HSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    HGet {
        key: String,
        field: String,
    },
    HGetAll {
        key: String,
    },
    HDel {
        key: String,
        fields: Vec<String>,
    },
    Del {
        keys: Vec<String>,
    },
    Exists {
        key: String,
    },
    ZAdd {
        key: String,
        member: String,
        score: f64,
        mode: ZAddMode,
    },
    ZRem {
        key: String,
        members: Vec<String>,
    },
    ZScore {
        key: String,
        member: String,
    },
    ZRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
        /// `(offset, count)`
        limit: Option<(usize, usize)>,
    },
    ZRemRangeByScore {
        key: String,
        min: ScoreBound,
        max: ScoreBound,
    },
    ZCard {
        key: String,
    },
}

impl Command {
    /// Command name, used for logging and error context
    pub fn name(&self) -> &'static str {
        match self {
            Command::HSet { .. } => "HSET",
            Command::HGet { .. } => "HGET",
            Command::HGetAll { .. } => "HGETALL",
            Command::HDel { .. } => "HDEL",
            Command::Del { .. } => "DEL",
            Command::Exists { .. } => "EXISTS",
            Command::ZAdd { .. } => "ZADD",
            Command::ZRem { .. } => "ZREM",
            Command::ZScore { .. } => "ZSCORE",
            Command::ZRangeByScore { .. } => "ZRANGEBYSCORE",
            Command::ZRemRangeByScore { .. } => "ZREMRANGEBYSCORE",
            Command::ZCard { .. } => "ZCARD",
        }
    }

    /// Keys this command reads or writes
    pub fn keys(&self) -> Vec<&str> {
        match self {
            Command::Del { keys } => keys.iter().map(String::as_str).collect(),
            Command::HSet { key, .. }
            | Command::HGet { key, .. }
            | Command::HGetAll { key }
            | Command::HDel { key, .. }
            | Command::Exists { key }
            | Command::ZAdd { key, .. }
            | Command::ZRem { key, .. }
            | Command::ZScore { key, .. }
            | Command::ZRangeByScore { key, .. }
            | Command::ZRemRangeByScore { key, .. }
            | Command::ZCard { key } => vec![key.as_str()],
        }
    }
}

/// Precondition checked atomically with a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Guard {
    KeyAbsent(String),
    KeyPresent(String),
    /// Hash field holds exactly `value`; `None` means the field is absent
    FieldEquals {
        key: String,
        field: String,
        value: Option<String>,
    },
}

impl Guard {
    /// The key the guard inspects
    pub fn key(&self) -> &str {
        match self {
            Guard::KeyAbsent(key) | Guard::KeyPresent(key) => key,
            Guard::FieldEquals { key, .. } => key,
        }
    }
}

/// Reply to a single command
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Nil,
    Int(i64),
    Text(String),
    Score(f64),
    Hash(HashMap<String, String>),
    Scored(Vec<(String, f64)>),
}

impl Reply {
    pub fn into_text(self) -> Option<String> {
        match self {
            Reply::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn into_int(self) -> i64 {
        match self {
            Reply::Int(value) => value,
            _ => 0,
        }
    }

    pub fn into_score(self) -> Option<f64> {
        match self {
            Reply::Score(score) => Some(score),
            _ => None,
        }
    }

    pub fn into_hash(self) -> HashMap<String, String> {
        match self {
            Reply::Hash(hash) => hash,
            _ => HashMap::new(),
        }
    }

    pub fn into_scored(self) -> Vec<(String, f64)> {
        match self {
            Reply::Scored(members) => members,
            _ => Vec::new(),
        }
    }
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    pub size: usize,
    pub available: usize,
}

impl PoolStatus {
    pub fn checked_out(&self) -> usize {
        self.size.saturating_sub(self.available)
    }
}

/// A live connection as provided by a backend
#[async_trait]
pub trait Connection: Send {
    /// Run a single command
    async fn execute(&mut self, command: Command) -> Result<Reply>;

    /// Run all commands atomically. Returns `None` without applying anything
    /// when the guard does not hold.
    async fn transaction(
        &mut self,
        guard: Option<Guard>,
        commands: Vec<Command>,
    ) -> Result<Option<Vec<Reply>>>;
}

/// Pooled connection handle; goes back to the pool on release or drop
pub struct StoreConnection {
    inner: Option<Box<dyn Connection>>,
}

impl StoreConnection {
    pub fn new(inner: Box<dyn Connection>) -> Self {
        Self { inner: Some(inner) }
    }

    fn live(&mut self, operation: &str) -> Result<&mut Box<dyn Connection>> {
        self.inner
            .as_mut()
            .ok_or_else(|| StateError::store(operation, "connection already released"))
    }

    pub async fn execute(&mut self, command: Command) -> Result<Reply> {
        let conn = self.live(command.name())?;
        conn.execute(command).await
    }

    pub async fn transaction(
        &mut self,
        guard: Option<Guard>,
        commands: Vec<Command>,
    ) -> Result<Option<Vec<Reply>>> {
        let conn = self.live("MULTI")?;
        conn.transaction(guard, commands).await
    }

    /// Return the connection to the pool. Safe to call more than once.
    pub fn release(&mut self) {
        self.inner.take();
    }

    pub fn is_released(&self) -> bool {
        self.inner.is_none()
    }
}

impl Drop for StoreConnection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for StoreConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreConnection")
            .field("released", &self.is_released())
            .finish()
    }
}

/// Trait for pooled key-value stores
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Check out a connection, waiting at most `deadline` when the pool is empty
    async fn acquire(&self, deadline: Option<Duration>) -> Result<StoreConnection>;

    /// Current pool occupancy
    fn status(&self) -> PoolStatus;

    /// Retire pooled connections idle for longer than `idle_timeout`.
    /// Returns how many were closed.
    async fn prune_idle(&self, _idle_timeout: Duration) -> usize {
        0
    }
}

/// Acquire, run one command and release
pub async fn run(
    store: &dyn KeyValueStore,
    deadline: Option<Duration>,
    command: Command,
) -> Result<Reply> {
    let name = command.name();
    let mut conn = store.acquire(deadline).await?;
    let reply = conn.execute(command).await;
    conn.release();

    if let Err(e) = &reply {
        error!(operation = name, error = %e, "State storage command failed");
    }
    reply
}

/// Acquire, run one guarded transaction and release
pub async fn run_transaction(
    store: &dyn KeyValueStore,
    deadline: Option<Duration>,
    guard: Option<Guard>,
    commands: Vec<Command>,
) -> Result<Option<Vec<Reply>>> {
    let mut conn = store.acquire(deadline).await?;
    let replies = conn.transaction(guard, commands).await;
    conn.release();

    if let Err(e) = &replies {
        error!(operation = "MULTI", error = %e, "State storage transaction failed");
    }
    replies
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_bounds() {
        assert!(ScoreBound::Inclusive(5.0).admits_from_below(5.0));
        assert!(!ScoreBound::Exclusive(5.0).admits_from_below(5.0));
        assert!(ScoreBound::Inclusive(5.0).admits_from_above(5.0));
        assert!(!ScoreBound::Exclusive(5.0).admits_from_above(5.0));
        assert!(ScoreBound::Unbounded.admits_from_above(f64::MAX));
    }

    #[test]
    fn test_command_keys() {
        let del = Command::Del {
            keys: vec!["a".into(), "b".into()],
        };
        assert_eq!(del.keys(), vec!["a", "b"]);
        assert_eq!(del.name(), "DEL");
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let store = MemoryStore::new(1);
        let mut conn = store.acquire(None).await.unwrap();
        assert_eq!(store.status().available, 0);

        conn.release();
        conn.release();
        assert!(conn.is_released());
        assert_eq!(store.status().available, 1);

        let err = conn
            .execute(Command::Exists { key: "k".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::Store { .. }));
    }
}
