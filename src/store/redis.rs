//! Redis store backend
//!
//! Key layout is defined in [`crate::keys`]; this module only translates
//! [`Command`]s to Redis commands and replies back. Guarded transactions use
//! `WATCH` + `MULTI`/`EXEC`, so a concurrent writer touching the guarded key
//! aborts the transaction instead of interleaving with it. An aborted `EXEC`
//! re-evaluates the guard and runs once more; a connection whose WATCH could
//! not be cleared after an error is discarded.

use super::{
    Command, Connection, Guard, KeyValueStore, PoolStatus, Reply, ScoreBound, StoreConnection,
    ZAddMode,
};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use deadpool_redis::{Config, Pool, PoolConfig, PoolError, Runtime, Timeouts};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

fn bound_arg(bound: ScoreBound, unbounded: &str) -> String {
    match bound {
        ScoreBound::Unbounded => unbounded.to_string(),
        ScoreBound::Inclusive(score) => score.to_string(),
        ScoreBound::Exclusive(score) => format!("({}", score),
    }
}

fn build(command: &Command) -> redis::Cmd {
    let mut cmd = redis::cmd(command.name());
    match command {
        Command::HSet { key, fields } => {
            cmd.arg(key);
            for (field, value) in fields {
                cmd.arg(field).arg(value);
            }
        }
        Command::HGet { key, field } => {
            cmd.arg(key).arg(field);
        }
        Command::HGetAll { key } | Command::Exists { key } | Command::ZCard { key } => {
            cmd.arg(key);
        }
        Command::HDel { key, fields } => {
            cmd.arg(key).arg(fields);
        }
        Command::Del { keys } => {
            cmd.arg(keys);
        }
        Command::ZAdd {
            key,
            member,
            score,
            mode,
        } => {
            cmd.arg(key);
            match mode {
                ZAddMode::Upsert => {}
                ZAddMode::OnlyNew => {
                    cmd.arg("NX");
                }
                ZAddMode::OnlyExisting => {
                    cmd.arg("XX");
                }
            }
            cmd.arg(*score).arg(member);
        }
        Command::ZRem { key, members } => {
            cmd.arg(key).arg(members);
        }
        Command::ZScore { key, member } => {
            cmd.arg(key).arg(member);
        }
        Command::ZRangeByScore {
            key,
            min,
            max,
            limit,
        } => {
            cmd.arg(key)
                .arg(bound_arg(*min, "-inf"))
                .arg(bound_arg(*max, "+inf"))
                .arg("WITHSCORES");
            if let Some((offset, count)) = limit {
                cmd.arg("LIMIT").arg(*offset).arg(*count);
            }
        }
        Command::ZRemRangeByScore { key, min, max } => {
            cmd.arg(key)
                .arg(bound_arg(*min, "-inf"))
                .arg(bound_arg(*max, "+inf"));
        }
    }
    cmd
}

fn decode(command: &Command, value: &redis::Value) -> Result<Reply> {
    let err = |e: redis::RedisError| StateError::store(command.name(), e);
    let reply = match command {
        Command::HGet { .. } => redis::from_redis_value::<Option<String>>(value)
            .map_err(err)?
            .map(Reply::Text)
            .unwrap_or(Reply::Nil),
        Command::HGetAll { .. } => {
            Reply::Hash(redis::from_redis_value::<HashMap<String, String>>(value).map_err(err)?)
        }
        Command::ZScore { .. } => redis::from_redis_value::<Option<f64>>(value)
            .map_err(err)?
            .map(Reply::Score)
            .unwrap_or(Reply::Nil),
        Command::ZRangeByScore { .. } => {
            Reply::Scored(redis::from_redis_value::<Vec<(String, f64)>>(value).map_err(err)?)
        }
        Command::HSet { .. }
        | Command::HDel { .. }
        | Command::Del { .. }
        | Command::Exists { .. }
        | Command::ZAdd { .. }
        | Command::ZRem { .. }
        | Command::ZRemRangeByScore { .. }
        | Command::ZCard { .. } => {
            Reply::Int(redis::from_redis_value::<Option<i64>>(value).map_err(err)?.unwrap_or(0))
        }
    };
    Ok(reply)
}

/// Redis-backed store using a deadpool connection pool
#[derive(Clone)]
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Create a pool for `url` and verify connectivity with a PING
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let mut cfg = Config::from_url(url);
        cfg.pool = Some(PoolConfig::new(pool_size));
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StateError::store("connect", format!("failed to create pool: {}", e)))?;

        let mut conn = pool
            .get()
            .await
            .map_err(|e| StateError::store("connect", e))?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(|e| StateError::store("PING", e))?;

        info!(pool_size, "Connected to Redis state storage");
        Ok(Self { pool })
    }

    /// Wrap an existing pool
    pub fn from_pool(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn acquire(&self, deadline: Option<Duration>) -> Result<StoreConnection> {
        let timeouts = Timeouts {
            wait: deadline,
            ..Timeouts::default()
        };
        let conn = self.pool.timeout_get(&timeouts).await.map_err(|e| match e {
            PoolError::Timeout(_) => StateError::PoolExhausted {
                waited: deadline.unwrap_or_default(),
            },
            other => StateError::store("acquire", other),
        })?;
        Ok(StoreConnection::new(Box::new(RedisConnection { conn: Some(conn) })))
    }

    fn status(&self) -> PoolStatus {
        let status = self.pool.status();
        let in_use = status.size.saturating_sub(status.available);
        PoolStatus {
            size: status.max_size,
            available: status.max_size.saturating_sub(in_use),
        }
    }

    async fn prune_idle(&self, idle_timeout: Duration) -> usize {
        let result = self
            .pool
            .retain(|_, metrics| metrics.last_used() < idle_timeout);
        if !result.removed.is_empty() {
            debug!(closed = result.removed.len(), "Closed idle Redis connections");
        }
        result.removed.len()
    }
}

/// Transactions retried after `EXEC` was aborted by a concurrent write to
/// the watched key
const EXEC_ATTEMPTS: usize = 2;

enum Attempt {
    GuardFailed,
    Aborted,
    Applied(Vec<redis::Value>),
}

struct RedisConnection {
    /// `None` once the connection was detached from the pool
    conn: Option<deadpool_redis::Connection>,
}

impl RedisConnection {
    fn conn(&mut self, operation: &str) -> Result<&mut deadpool_redis::Connection> {
        self.conn
            .as_mut()
            .ok_or_else(|| StateError::store(operation, "connection was discarded"))
    }

    /// WATCH the guarded key and evaluate the guard. When it does not hold
    /// the watch is released before returning.
    async fn check_guard(&mut self, guard: &Guard) -> Result<bool> {
        let conn = self.conn("WATCH")?;
        redis::cmd("WATCH")
            .arg(guard.key())
            .query_async::<()>(&mut *conn)
            .await
            .map_err(|e| StateError::store("WATCH", e))?;

        let holds = match guard {
            Guard::KeyAbsent(key) | Guard::KeyPresent(key) => {
                let present: bool = redis::cmd("EXISTS")
                    .arg(key)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| StateError::store("EXISTS", e))?;
                present == matches!(guard, Guard::KeyPresent(_))
            }
            Guard::FieldEquals { key, field, value } => {
                let stored: Option<String> = redis::cmd("HGET")
                    .arg(key)
                    .arg(field)
                    .query_async(&mut *conn)
                    .await
                    .map_err(|e| StateError::store("HGET", e))?;
                stored == *value
            }
        };

        if !holds {
            redis::cmd("UNWATCH")
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|e| StateError::store("UNWATCH", e))?;
        }
        Ok(holds)
    }

    async fn attempt(&mut self, guard: Option<&Guard>, commands: &[Command]) -> Result<Attempt> {
        if let Some(guard) = guard {
            if !self.check_guard(guard).await? {
                return Ok(Attempt::GuardFailed);
            }
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for command in commands {
            pipe.add_command(build(command));
        }
        let values: Option<Vec<redis::Value>> = pipe
            .query_async(self.conn("EXEC")?)
            .await
            .map_err(|e| StateError::store("EXEC", e))?;

        Ok(match values {
            Some(values) => Attempt::Applied(values),
            None => Attempt::Aborted,
        })
    }

    /// Drop any WATCH a failed transaction left on the connection. A
    /// connection that cannot be reset is detached so the pool never hands
    /// it out again.
    async fn reset_watch(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if let Err(e) = redis::cmd("UNWATCH").query_async::<()>(conn).await {
            warn!(error = %e, "UNWATCH failed, discarding connection");
            if let Some(conn) = self.conn.take() {
                drop(deadpool_redis::Connection::take(conn));
            }
        }
    }
}

#[async_trait]
impl Connection for RedisConnection {
    async fn execute(&mut self, command: Command) -> Result<Reply> {
        let value: redis::Value = build(&command)
            .query_async(self.conn(command.name())?)
            .await
            .map_err(|e| StateError::store(command.name(), e))?;
        decode(&command, &value)
    }

    async fn transaction(
        &mut self,
        guard: Option<Guard>,
        commands: Vec<Command>,
    ) -> Result<Option<Vec<Reply>>> {
        for attempt in 1..=EXEC_ATTEMPTS {
            let values = match self.attempt(guard.as_ref(), &commands).await {
                Ok(Attempt::Applied(values)) => values,
                Ok(Attempt::GuardFailed) => return Ok(None),
                Ok(Attempt::Aborted) => {
                    debug!(attempt, "Watched key changed, transaction aborted");
                    continue;
                }
                Err(e) => {
                    if guard.is_some() {
                        self.reset_watch().await;
                    }
                    return Err(e);
                }
            };
            return commands
                .iter()
                .zip(values.iter())
                .map(|(command, value)| decode(command, value))
                .collect::<Result<Vec<_>>>()
                .map(Some);
        }
        Ok(None)
    }
}
