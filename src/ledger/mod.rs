//! Player ledger
//!
//! The authoritative record of each player's request. A record is a hash at
//! `player:{id}` holding the properties, the creation time, and the list of
//! index keys the player was added to, so removal never has to re-derive
//! them from the properties. Creation writes the record and every index entry
//! in one guarded transaction; a concurrent create of the same id either wins
//! outright or fails with [`StateError::AlreadyExists`].

use crate::error::{Result, StateError};
use crate::index::IndexSchema;
use crate::keys;
use crate::store::{self, Command, Guard, KeyValueStore, ZAddMode};
use crate::types::{PlayerId, PlayerRequest, Properties};
use crate::utils::{score_timestamp, timestamp_score, Clock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Removal attempts against a record that keeps changing underneath
const REMOVE_ATTEMPTS: usize = 5;

pub struct PlayerLedger {
    store: Arc<dyn KeyValueStore>,
    schema: IndexSchema,
    clock: Arc<dyn Clock>,
    acquire_timeout: Duration,
    /// Record field the assignment connection string is stored in
    connstring_field: String,
}

impl PlayerLedger {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        schema: IndexSchema,
        clock: Arc<dyn Clock>,
        acquire_timeout: Duration,
        connstring_field: impl Into<String>,
    ) -> Self {
        Self {
            store,
            schema,
            clock,
            acquire_timeout,
            connstring_field: connstring_field.into(),
        }
    }

    pub fn schema(&self) -> &IndexSchema {
        &self.schema
    }

    /// Record a new request and index it
    pub async fn create(&self, id: &str, properties: Properties) -> Result<PlayerRequest> {
        if id.is_empty() {
            return Err(StateError::InvalidProperties {
                id: id.to_string(),
                reason: "player id cannot be empty".to_string(),
            });
        }
        if !properties.is_object() {
            return Err(StateError::InvalidProperties {
                id: id.to_string(),
                reason: "properties must be a JSON object".to_string(),
            });
        }

        let created_at = self.clock.now();
        let created_score = timestamp_score(created_at);

        let mut entries: Vec<(String, f64)> = self
            .schema
            .extract(&properties)
            .into_iter()
            .map(|attr| {
                let score = attr.score.unwrap_or(created_score);
                (keys::index(&attr.attribute), score)
            })
            .collect();
        entries.push((keys::ALL_REQUESTS_INDEX.to_string(), created_score));
        let index_keys: Vec<&String> = entries.iter().map(|(key, _)| key).collect();

        let encoded = serde_json::to_string(&properties)
            .map_err(|e| StateError::InvalidProperties {
                id: id.to_string(),
                reason: e.to_string(),
            })?;
        let indices = serde_json::to_string(&index_keys)
            .map_err(|e| StateError::store("HSET", e))?;

        let player_key = keys::player(id);
        let mut commands = vec![Command::HSet {
            key: player_key.clone(),
            fields: vec![
                (keys::PROPERTIES_FIELD.to_string(), encoded),
                (keys::CREATED_AT_FIELD.to_string(), created_score.to_string()),
                (keys::INDICES_FIELD.to_string(), indices),
            ],
        }];
        commands.extend(entries.iter().map(|(key, score)| Command::ZAdd {
            key: key.clone(),
            member: id.to_string(),
            score: *score,
            mode: ZAddMode::Upsert,
        }));

        let applied = store::run_transaction(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Some(Guard::KeyAbsent(player_key)),
            commands,
        )
        .await?;
        if applied.is_none() {
            debug!(id, "Request already recorded");
            return Err(StateError::AlreadyExists { id: id.to_string() });
        }

        info!(id, indexes = entries.len(), "Recorded matchmaking request");
        Ok(PlayerRequest {
            id: id.to_string(),
            properties,
            created_at,
            assignment: None,
        })
    }

    /// Fetch a request record
    pub async fn get(&self, id: &str) -> Result<PlayerRequest> {
        let fields = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::HGetAll {
                key: keys::player(id),
            },
        )
        .await?
        .into_hash();

        let Some(raw) = fields.get(keys::PROPERTIES_FIELD) else {
            return Err(StateError::NotFound { id: id.to_string() });
        };
        let properties = serde_json::from_str(raw).map_err(|e| StateError::InvalidProperties {
            id: id.to_string(),
            reason: format!("stored properties are not valid JSON: {}", e),
        })?;
        let created_at = fields
            .get(keys::CREATED_AT_FIELD)
            .and_then(|raw| raw.parse::<f64>().ok())
            .map(score_timestamp)
            .unwrap_or_else(|| self.clock.now());

        Ok(PlayerRequest {
            id: id.to_string(),
            properties,
            created_at,
            assignment: fields.get(&self.connstring_field).cloned(),
        })
    }

    /// Whether a record exists for `id`
    pub async fn exists(&self, id: &str) -> Result<bool> {
        let reply = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::Exists {
                key: keys::player(id),
            },
        )
        .await?;
        Ok(reply.into_int() > 0)
    }

    /// Read the record's index keys along with the raw field they came from.
    /// A corrupt index list is rebuilt from the stored properties.
    async fn snapshot(&self, id: &str) -> Result<IndexSnapshot> {
        let fields = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::HGetAll {
                key: keys::player(id),
            },
        )
        .await?
        .into_hash();

        let raw = fields.get(keys::INDICES_FIELD).cloned();
        let index_keys = match &raw {
            None => Vec::new(),
            Some(raw) => match serde_json::from_str::<Vec<String>>(raw) {
                Ok(index_keys) => index_keys,
                Err(e) => {
                    warn!(id, error = %e, "Stored index list is corrupt, rebuilding from properties");
                    self.derive_index_keys(id, &fields)?
                }
            },
        };

        Ok(IndexSnapshot {
            present: !fields.is_empty(),
            raw,
            index_keys,
        })
    }

    fn derive_index_keys(&self, id: &str, fields: &HashMap<String, String>) -> Result<Vec<String>> {
        let raw = fields
            .get(keys::PROPERTIES_FIELD)
            .ok_or_else(|| StateError::InvalidProperties {
                id: id.to_string(),
                reason: "stored index list is corrupt and no properties are stored".to_string(),
            })?;
        let properties: Properties =
            serde_json::from_str(raw).map_err(|e| StateError::InvalidProperties {
                id: id.to_string(),
                reason: format!("stored index list and properties are both unreadable: {}", e),
            })?;

        let mut index_keys: Vec<String> = self
            .schema
            .extract(&properties)
            .into_iter()
            .map(|attr| keys::index(&attr.attribute))
            .collect();
        index_keys.push(keys::ALL_REQUESTS_INDEX.to_string());
        Ok(index_keys)
    }

    fn indices_guard(id: &str, raw: Option<String>) -> Guard {
        Guard::FieldEquals {
            key: keys::player(id),
            field: keys::INDICES_FIELD.to_string(),
            value: raw,
        }
    }

    /// Remove the record and every index entry. Deleting an unknown id is a
    /// no-op; returns whether a record was removed.
    ///
    /// The removal only applies while the record still lists the index keys
    /// that were read, so a create racing with the delete is either removed
    /// in full or left in full.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        for attempt in 1..=REMOVE_ATTEMPTS {
            let snapshot = self.snapshot(id).await?;
            let mut index_keys = snapshot.index_keys;
            if !index_keys.iter().any(|key| key == keys::ALL_REQUESTS_INDEX) {
                index_keys.push(keys::ALL_REQUESTS_INDEX.to_string());
            }

            let mut commands = vec![Command::Del {
                keys: vec![keys::player(id)],
            }];
            commands.extend(index_keys.into_iter().map(|key| Command::ZRem {
                key,
                members: vec![id.to_string()],
            }));

            let applied = store::run_transaction(
                self.store.as_ref(),
                Some(self.acquire_timeout),
                Some(Self::indices_guard(id, snapshot.raw)),
                commands,
            )
            .await?;
            let Some(replies) = applied else {
                debug!(id, attempt, "Request changed while being removed, retrying");
                continue;
            };

            let removed = replies
                .into_iter()
                .next()
                .map(|reply| reply.into_int() > 0)
                .unwrap_or(false);
            if removed {
                info!(id, "Removed matchmaking request");
            } else {
                debug!(id, "Delete of unknown request ignored");
            }
            return Ok(removed);
        }

        Err(StateError::store(
            "MULTI",
            format!("request {} kept changing while being removed", id),
        ))
    }

    /// Remove the request from every index while keeping its record, so
    /// watchers can still read the assignment. Returns false when there is
    /// no record.
    pub async fn deindex(&self, id: &str) -> Result<bool> {
        for attempt in 1..=REMOVE_ATTEMPTS {
            let snapshot = self.snapshot(id).await?;
            if !snapshot.present {
                debug!(id, "Deindex of unknown request ignored");
                return Ok(false);
            }
            // A record without an index list was never indexed
            let Some(raw) = snapshot.raw else {
                return Ok(true);
            };

            let mut commands: Vec<Command> = snapshot
                .index_keys
                .into_iter()
                .map(|key| Command::ZRem {
                    key,
                    members: vec![id.to_string()],
                })
                .collect();
            commands.push(Command::HSet {
                key: keys::player(id),
                fields: vec![(keys::INDICES_FIELD.to_string(), "[]".to_string())],
            });

            let applied = store::run_transaction(
                self.store.as_ref(),
                Some(self.acquire_timeout),
                Some(Self::indices_guard(id, Some(raw))),
                commands,
            )
            .await?;
            if applied.is_none() {
                debug!(id, attempt, "Request changed while being deindexed, retrying");
                continue;
            }

            debug!(id, "Removed request from pool indexes");
            return Ok(true);
        }

        Err(StateError::store(
            "MULTI",
            format!("request {} kept changing while being deindexed", id),
        ))
    }
}

/// Index keys listed on a record, with the raw field value they were read
/// from so a later write can be guarded on it
struct IndexSnapshot {
    present: bool,
    raw: Option<String>,
    index_keys: Vec<String>,
}

/// Ids of the players carried by `ids`, with duplicates removed in order
pub fn unique_ids<'a>(ids: impl IntoIterator<Item = &'a PlayerId>) -> Vec<PlayerId> {
    let mut seen = std::collections::HashSet::new();
    ids.into_iter()
        .filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use serde_json::json;

    fn ledger() -> (Arc<MemoryStore>, PlayerLedger) {
        let store = Arc::new(MemoryStore::new(4));
        let ledger = PlayerLedger::new(
            store.clone(),
            IndexSchema::new(vec!["region".into(), "mmr.rating".into()]),
            Arc::new(ManualClock::default()),
            Duration::from_millis(500),
            "connstring",
        );
        (store, ledger)
    }

    async fn members(store: &MemoryStore, key: &str) -> Vec<String> {
        store::run(
            store,
            None,
            Command::ZRangeByScore {
                key: key.to_string(),
                min: store::ScoreBound::Unbounded,
                max: store::ScoreBound::Unbounded,
                limit: None,
            },
        )
        .await
        .unwrap()
        .into_scored()
        .into_iter()
        .map(|(id, _)| id)
        .collect()
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let (store, ledger) = ledger();
        let props = json!({"region": "eu-west1", "mmr": {"rating": 1500}});
        let created = ledger.create("p1", props.clone()).await.unwrap();

        let fetched = ledger.get("p1").await.unwrap();
        assert_eq!(fetched.properties, props);
        assert_eq!(fetched.created_at, created.created_at);
        assert_eq!(fetched.assignment, None);

        assert_eq!(members(&store, &keys::index("region.eu-west1")).await, vec!["p1"]);
        assert_eq!(members(&store, &keys::index("mmr.rating")).await, vec!["p1"]);
        assert_eq!(members(&store, keys::ALL_REQUESTS_INDEX).await, vec!["p1"]);
    }

    #[tokio::test]
    async fn test_create_twice_conflicts_and_keeps_first() {
        let (_, ledger) = ledger();
        ledger.create("p1", json!({"region": "eu-west1"})).await.unwrap();
        let err = ledger
            .create("p1", json!({"region": "us-east1"}))
            .await
            .unwrap_err();
        assert_eq!(err, StateError::AlreadyExists { id: "p1".into() });

        let record = ledger.get("p1").await.unwrap();
        assert_eq!(record.properties, json!({"region": "eu-west1"}));
    }

    #[tokio::test]
    async fn test_invalid_input_is_rejected() {
        let (_, ledger) = ledger();
        assert!(matches!(
            ledger.create("", json!({})).await,
            Err(StateError::InvalidProperties { .. })
        ));
        assert!(matches!(
            ledger.create("p1", json!([1, 2])).await,
            Err(StateError::InvalidProperties { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_removes_record_and_indexes() {
        let (store, ledger) = ledger();
        ledger.create("p1", json!({"region": "eu-west1"})).await.unwrap();

        assert!(ledger.delete("p1").await.unwrap());
        assert_eq!(
            ledger.get("p1").await.unwrap_err(),
            StateError::NotFound { id: "p1".into() }
        );
        assert!(members(&store, &keys::index("region.eu-west1")).await.is_empty());
        assert_eq!(store.key_count(), 0);

        assert!(!ledger.delete("p1").await.unwrap());
        assert!(!ledger.delete("never-existed").await.unwrap());
    }

    #[tokio::test]
    async fn test_deindex_keeps_record() {
        let (store, ledger) = ledger();
        ledger.create("p1", json!({"region": "eu-west1"})).await.unwrap();

        assert!(ledger.deindex("p1").await.unwrap());
        assert!(ledger.exists("p1").await.unwrap());
        assert!(members(&store, keys::ALL_REQUESTS_INDEX).await.is_empty());

        assert!(!ledger.deindex("ghost").await.unwrap());
        assert!(!ledger.exists("ghost").await.unwrap());
    }

    async fn corrupt_indices(store: &MemoryStore, id: &str) {
        store::run(
            store,
            None,
            Command::HSet {
                key: keys::player(id),
                fields: vec![(keys::INDICES_FIELD.to_string(), "not json".to_string())],
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_delete_rebuilds_corrupt_index_list() {
        let (store, ledger) = ledger();
        ledger
            .create("p1", json!({"region": "eu-west1", "mmr": {"rating": 1500}}))
            .await
            .unwrap();
        corrupt_indices(&store, "p1").await;

        assert!(ledger.delete("p1").await.unwrap());
        assert!(members(&store, &keys::index("region.eu-west1")).await.is_empty());
        assert!(members(&store, &keys::index("mmr.rating")).await.is_empty());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_unreadable_record_is_reported() {
        let (store, ledger) = ledger();
        corrupt_indices(&store, "p1").await;

        let err = ledger.delete("p1").await.unwrap_err();
        assert!(matches!(err, StateError::InvalidProperties { .. }));
        assert!(ledger.exists("p1").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_after_deindex_clears_record() {
        let (store, ledger) = ledger();
        ledger.create("p1", json!({"region": "eu-west1"})).await.unwrap();
        assert!(ledger.deindex("p1").await.unwrap());

        assert!(ledger.delete("p1").await.unwrap());
        assert_eq!(store.key_count(), 0);
    }

    #[test]
    fn test_unique_ids_preserves_order() {
        let ids = vec!["b".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(unique_ids(&ids), vec!["b".to_string(), "a".to_string()]);
    }
}
