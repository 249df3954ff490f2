//! Test fixtures and store wrappers for integration testing

#![allow(dead_code)]

use async_trait::async_trait;
use futures::future::BoxFuture;
use parlor_state::config::AppConfig;
use parlor_state::error::{Result, StateError};
use parlor_state::metrics::MetricsCollector;
use parlor_state::store::{
    Command, Connection, Guard, KeyValueStore, MemoryStore, PoolStatus, Reply, StoreConnection,
};
use parlor_state::utils::ManualClock;
use parlor_state::RequestCoordinator;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Work run once right after a chosen command completes
pub type Hook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Memory store that fails chosen commands on demand
///
/// `fail_next("ZADD", 2)` makes the next two `ZADD` round-trips fail with a
/// transient store error. Transactions match on their first command.
/// `after_next("HGETALL", hook)` runs `hook` once the next single `HGETALL`
/// has been applied, before its reply reaches the caller.
#[derive(Clone)]
pub struct FlakyStore {
    inner: Arc<MemoryStore>,
    failures: Arc<Mutex<HashMap<String, usize>>>,
    failed: Arc<Mutex<Vec<String>>>,
    hooks: Arc<Mutex<HashMap<String, Hook>>>,
}

impl FlakyStore {
    pub fn new(pool_size: usize) -> Self {
        Self {
            inner: Arc::new(MemoryStore::new(pool_size)),
            failures: Arc::new(Mutex::new(HashMap::new())),
            failed: Arc::new(Mutex::new(Vec::new())),
            hooks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn after_next(&self, command: &str, hook: Hook) {
        if let Ok(mut hooks) = self.hooks.lock() {
            hooks.insert(command.to_string(), hook);
        }
    }

    pub fn fail_next(&self, command: &str, count: usize) {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(command.to_string(), count);
        }
    }

    /// Command names that were failed, in order
    pub fn failed_commands(&self) -> Vec<String> {
        self.failed
            .lock()
            .map(|failed| failed.clone())
            .unwrap_or_default()
    }

    pub fn inner(&self) -> Arc<MemoryStore> {
        self.inner.clone()
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn acquire(&self, deadline: Option<Duration>) -> Result<StoreConnection> {
        let conn = self.inner.acquire(deadline).await?;
        Ok(StoreConnection::new(Box::new(FlakyConnection {
            inner: conn,
            failures: self.failures.clone(),
            failed: self.failed.clone(),
            hooks: self.hooks.clone(),
        })))
    }

    fn status(&self) -> PoolStatus {
        self.inner.status()
    }
}

struct FlakyConnection {
    inner: StoreConnection,
    failures: Arc<Mutex<HashMap<String, usize>>>,
    failed: Arc<Mutex<Vec<String>>>,
    hooks: Arc<Mutex<HashMap<String, Hook>>>,
}

impl FlakyConnection {
    fn take_hook(&self, name: &str) -> Option<Hook> {
        self.hooks.lock().ok().and_then(|mut hooks| hooks.remove(name))
    }

    fn should_fail(&self, name: &str) -> bool {
        let Ok(mut failures) = self.failures.lock() else {
            return false;
        };
        match failures.get_mut(name) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                if let Ok(mut failed) = self.failed.lock() {
                    failed.push(name.to_string());
                }
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Connection for FlakyConnection {
    async fn execute(&mut self, command: Command) -> Result<Reply> {
        let name = command.name();
        if self.should_fail(name) {
            return Err(StateError::store(name, "injected failure"));
        }
        let reply = self.inner.execute(command).await;
        if let Some(hook) = self.take_hook(name) {
            hook().await;
        }
        reply
    }

    async fn transaction(
        &mut self,
        guard: Option<Guard>,
        commands: Vec<Command>,
    ) -> Result<Option<Vec<Reply>>> {
        if let Some(first) = commands.first() {
            if self.should_fail(first.name()) {
                return Err(StateError::store("MULTI", "injected failure"));
            }
        }
        self.inner.transaction(guard, commands).await
    }
}

/// Configuration tuned for fast tests
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store.pool_size = 8;
    config.store.acquire_timeout_ms = 500;
    config.assignment.initial_poll_ms = 10;
    config.assignment.max_poll_ms = 50;
    config.assignment.jitter = 0.0;
    config.visibility.mark_retry_delay_ms = 5;
    config
}

/// Coordinator over `store` with a manual clock
pub fn coordinator_over(
    store: Arc<dyn KeyValueStore>,
    config: &AppConfig,
) -> (ManualClock, RequestCoordinator) {
    let clock = ManualClock::default();
    let coordinator = RequestCoordinator::new(
        store,
        config,
        Arc::new(clock.clone()),
        Arc::new(MetricsCollector::new().expect("metrics collector")),
    );
    (clock, coordinator)
}

/// Memory-backed coordinator with a manual clock
pub fn memory_system() -> (Arc<MemoryStore>, ManualClock, RequestCoordinator) {
    let store = Arc::new(MemoryStore::new(8));
    let (clock, coordinator) = coordinator_over(store.clone(), &test_config());
    (store, clock, coordinator)
}

/// Typical request properties
pub fn player_properties(region: &str, mode: &str, rating: f64) -> Value {
    json!({
        "region": region,
        "mode": mode,
        "mmr": { "rating": rating }
    })
}
