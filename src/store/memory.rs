//! In-process store backend
//!
//! Holds hashes and sorted sets behind a single mutex so that every command
//! and every transaction is applied atomically. A semaphore models the
//! connection pool: each checked-out [`StoreConnection`] owns one permit.

use super::{
    Command, Connection, Guard, KeyValueStore, PoolStatus, Reply, ScoreBound, StoreConnection,
    ZAddMode,
};
use crate::error::{Result, StateError};
use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Total order over scores so they can key a `BTreeSet`
#[derive(Debug, Clone, Copy)]
struct OrderedScore(f64);

impl PartialEq for OrderedScore {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedScore {}

impl PartialOrd for OrderedScore {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedScore {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set ordered by (score, member), ties broken lexicographically
#[derive(Debug, Clone, Default)]
struct SortedSet {
    scores: HashMap<String, f64>,
    order: BTreeSet<(OrderedScore, String)>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) -> bool {
        let added = match self.scores.insert(member.to_string(), score) {
            Some(previous) => {
                self.order.remove(&(OrderedScore(previous), member.to_string()));
                false
            }
            None => true,
        };
        self.order.insert((OrderedScore(score), member.to_string()));
        added
    }

    fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.order.remove(&(OrderedScore(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    fn range(&self, min: ScoreBound, max: ScoreBound) -> impl Iterator<Item = (&String, f64)> {
        let start = match min {
            ScoreBound::Unbounded => Bound::Unbounded,
            ScoreBound::Inclusive(score) | ScoreBound::Exclusive(score) => {
                Bound::Included((OrderedScore(score), String::new()))
            }
        };
        self.order
            .range((start, Bound::Unbounded))
            .skip_while(move |(score, _)| !min.admits_from_below(score.0))
            .take_while(move |(score, _)| max.admits_from_above(score.0))
            .map(|(score, member)| (member, score.0))
    }
}

#[derive(Debug, Clone)]
enum Value {
    Hash(HashMap<String, String>),
    ZSet(SortedSet),
}

type Keyspace = HashMap<String, Value>;

fn wrong_type(command: &Command) -> StateError {
    StateError::store(
        command.name(),
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )
}

fn hash_mut<'a>(space: &'a mut Keyspace, command: &Command, key: &str) -> Result<&'a mut HashMap<String, String>> {
    match space
        .entry(key.to_string())
        .or_insert_with(|| Value::Hash(HashMap::new()))
    {
        Value::Hash(hash) => Ok(hash),
        Value::ZSet(_) => Err(wrong_type(command)),
    }
}

fn hash_ref<'a>(space: &'a Keyspace, command: &Command, key: &str) -> Result<Option<&'a HashMap<String, String>>> {
    match space.get(key) {
        None => Ok(None),
        Some(Value::Hash(hash)) => Ok(Some(hash)),
        Some(Value::ZSet(_)) => Err(wrong_type(command)),
    }
}

fn zset_ref<'a>(space: &'a Keyspace, command: &Command, key: &str) -> Result<Option<&'a SortedSet>> {
    match space.get(key) {
        None => Ok(None),
        Some(Value::ZSet(set)) => Ok(Some(set)),
        Some(Value::Hash(_)) => Err(wrong_type(command)),
    }
}

fn zset_existing_mut<'a>(
    space: &'a mut Keyspace,
    command: &Command,
    key: &str,
) -> Result<Option<&'a mut SortedSet>> {
    match space.get_mut(key) {
        None => Ok(None),
        Some(Value::ZSet(set)) => Ok(Some(set)),
        Some(Value::Hash(_)) => Err(wrong_type(command)),
    }
}

/// Drop keys that became empty, as a real store does
fn drop_if_empty(space: &mut Keyspace, key: &str) {
    let empty = match space.get(key) {
        Some(Value::Hash(hash)) => hash.is_empty(),
        Some(Value::ZSet(set)) => set.scores.is_empty(),
        None => false,
    };
    if empty {
        space.remove(key);
    }
}

fn apply(space: &mut Keyspace, command: &Command) -> Result<Reply> {
    match command {
        Command::HSet { key, fields } => {
            let hash = hash_mut(space, command, key)?;
            let mut added = 0;
            for (field, value) in fields {
                if hash.insert(field.clone(), value.clone()).is_none() {
                    added += 1;
                }
            }
            drop_if_empty(space, key);
            Ok(Reply::Int(added))
        }
        Command::HGet { key, field } => Ok(hash_ref(space, command, key)?
            .and_then(|hash| hash.get(field))
            .map(|value| Reply::Text(value.clone()))
            .unwrap_or(Reply::Nil)),
        Command::HGetAll { key } => Ok(Reply::Hash(
            hash_ref(space, command, key)?.cloned().unwrap_or_default(),
        )),
        Command::HDel { key, fields } => {
            let present = hash_ref(space, command, key)?.is_some();
            let removed = if present {
                let hash = hash_mut(space, command, key)?;
                fields.iter().filter(|field| hash.remove(*field).is_some()).count()
            } else {
                0
            };
            drop_if_empty(space, key);
            Ok(Reply::Int(removed as i64))
        }
        Command::Del { keys } => Ok(Reply::Int(
            keys.iter().filter(|key| space.remove(*key).is_some()).count() as i64,
        )),
        Command::Exists { key } => Ok(Reply::Int(space.contains_key(key) as i64)),
        Command::ZAdd {
            key,
            member,
            score,
            mode,
        } => {
            if score.is_nan() {
                return Err(StateError::store(command.name(), "score is not a valid float"));
            }
            let exists = zset_ref(space, command, key)?
                .map(|set| set.scores.contains_key(member))
                .unwrap_or(false);
            let write = match mode {
                ZAddMode::Upsert => true,
                ZAddMode::OnlyNew => !exists,
                ZAddMode::OnlyExisting => exists,
            };
            if !write {
                return Ok(Reply::Int(0));
            }
            let set = match space
                .entry(key.clone())
                .or_insert_with(|| Value::ZSet(SortedSet::default()))
            {
                Value::ZSet(set) => set,
                Value::Hash(_) => return Err(wrong_type(command)),
            };
            Ok(Reply::Int(set.insert(member, *score) as i64))
        }
        Command::ZRem { key, members } => {
            let removed = match zset_existing_mut(space, command, key)? {
                None => 0,
                Some(set) => members.iter().filter(|member| set.remove(member)).count(),
            };
            drop_if_empty(space, key);
            Ok(Reply::Int(removed as i64))
        }
        Command::ZScore { key, member } => Ok(zset_ref(space, command, key)?
            .and_then(|set| set.scores.get(member))
            .map(|score| Reply::Score(*score))
            .unwrap_or(Reply::Nil)),
        Command::ZRangeByScore {
            key,
            min,
            max,
            limit,
        } => {
            let Some(set) = zset_ref(space, command, key)? else {
                return Ok(Reply::Scored(Vec::new()));
            };
            let (offset, count) = limit.unwrap_or((0, usize::MAX));
            let members = set
                .range(*min, *max)
                .skip(offset)
                .take(count)
                .map(|(member, score)| (member.clone(), score))
                .collect();
            Ok(Reply::Scored(members))
        }
        Command::ZRemRangeByScore { key, min, max } => {
            let doomed: Vec<String> = match zset_ref(space, command, key)? {
                None => Vec::new(),
                Some(set) => set.range(*min, *max).map(|(member, _)| member.clone()).collect(),
            };
            if let Some(set) = zset_existing_mut(space, command, key)? {
                for member in &doomed {
                    set.remove(member);
                }
            }
            drop_if_empty(space, key);
            Ok(Reply::Int(doomed.len() as i64))
        }
        Command::ZCard { key } => Ok(Reply::Int(
            zset_ref(space, command, key)?
                .map(|set| set.scores.len() as i64)
                .unwrap_or(0),
        )),
    }
}

fn guard_holds(space: &Keyspace, guard: &Guard) -> bool {
    match guard {
        Guard::KeyAbsent(key) => !space.contains_key(key),
        Guard::KeyPresent(key) => space.contains_key(key),
        Guard::FieldEquals { key, field, value } => {
            let stored = match space.get(key) {
                Some(Value::Hash(hash)) => hash.get(field),
                _ => None,
            };
            stored == value.as_ref()
        }
    }
}

/// In-memory store with a bounded connection pool
#[derive(Clone)]
pub struct MemoryStore {
    data: Arc<Mutex<Keyspace>>,
    permits: Arc<Semaphore>,
    size: usize,
}

impl MemoryStore {
    /// Create a store whose pool hands out at most `pool_size` connections
    pub fn new(pool_size: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(HashMap::new())),
            permits: Arc::new(Semaphore::new(pool_size)),
            size: pool_size,
        }
    }

    /// Number of keys currently stored
    pub fn key_count(&self) -> usize {
        self.data.lock().map(|space| space.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("status", &self.status())
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn acquire(&self, deadline: Option<Duration>) -> Result<StoreConnection> {
        let permits = self.permits.clone();
        let permit = match deadline {
            Some(limit) => tokio::time::timeout(limit, permits.acquire_owned())
                .await
                .map_err(|_| StateError::PoolExhausted { waited: limit })?,
            None => permits.acquire_owned().await,
        }
        .map_err(|e| StateError::store("acquire", e))?;

        Ok(StoreConnection::new(Box::new(MemoryConnection {
            data: self.data.clone(),
            _permit: permit,
        })))
    }

    fn status(&self) -> PoolStatus {
        PoolStatus {
            size: self.size,
            available: self.permits.available_permits(),
        }
    }
}

struct MemoryConnection {
    data: Arc<Mutex<Keyspace>>,
    _permit: OwnedSemaphorePermit,
}

impl MemoryConnection {
    fn lock(&self, operation: &str) -> Result<std::sync::MutexGuard<'_, Keyspace>> {
        self.data
            .lock()
            .map_err(|_| StateError::store(operation, "keyspace lock poisoned"))
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&mut self, command: Command) -> Result<Reply> {
        let mut space = self.lock(command.name())?;
        apply(&mut space, &command)
    }

    async fn transaction(
        &mut self,
        guard: Option<Guard>,
        commands: Vec<Command>,
    ) -> Result<Option<Vec<Reply>>> {
        let mut space = self.lock("MULTI")?;

        if let Some(guard) = &guard {
            if !guard_holds(&space, guard) {
                debug!(?guard, "Transaction guard failed, nothing applied");
                return Ok(None);
            }
        }

        // Snapshot touched keys so a failing command leaves no partial writes
        let mut snapshot: HashMap<String, Option<Value>> = HashMap::new();
        for command in &commands {
            for key in command.keys() {
                snapshot
                    .entry(key.to_string())
                    .or_insert_with(|| space.get(key).cloned());
            }
        }

        let mut replies = Vec::with_capacity(commands.len());
        for command in &commands {
            match apply(&mut space, command) {
                Ok(reply) => replies.push(reply),
                Err(e) => {
                    for (key, previous) in snapshot {
                        match previous {
                            Some(value) => space.insert(key, value),
                            None => space.remove(&key),
                        };
                    }
                    return Err(e);
                }
            }
        }
        Ok(Some(replies))
    }
}
