//! Visibility filter over named ignore lists
//!
//! Each list is a sorted set of player ids scored by insertion time. Whether
//! an id is hidden is decided from that score, the list's window and "now"
//! (see [`window::ExclusionWindow`]), so entries never need to be expired to
//! stop hiding their player. [`VisibilityFilter::sweep`] only reclaims space.
//!
//! Hiding and unhiding fail in opposite directions. A hide that cannot be
//! written is retried and then surfaced while the player stays visible; an
//! unhide that cannot be written leaves the entry in place so the player
//! stays hidden.

pub mod window;

pub use window::ExclusionWindow;

use crate::config::{IgnoreListConfig, VisibilitySettings};
use crate::error::{Result, StateError};
use crate::keys;
use crate::store::{self, Command, KeyValueStore, Reply, ScoreBound, ZAddMode};
use crate::types::{IgnoreListEntry, PlayerId};
use crate::utils::{score_timestamp, timestamp_score, Clock};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Ids checked per EXISTS batch when sweeping hard-TTL lists
const SWEEP_BATCH: usize = 500;

/// Time-windowed exclusion marks shared by every matchmaking participant
pub struct VisibilityFilter {
    store: Arc<dyn KeyValueStore>,
    /// Configured lists by name
    lists: HashMap<String, IgnoreListConfig>,
    clock: Arc<dyn Clock>,
    acquire_timeout: Duration,
    settings: VisibilitySettings,
}

impl VisibilityFilter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        lists: Vec<IgnoreListConfig>,
        clock: Arc<dyn Clock>,
        acquire_timeout: Duration,
        settings: VisibilitySettings,
    ) -> Self {
        let lists = lists
            .into_iter()
            .map(|list| (list.name.clone(), list))
            .collect();
        Self {
            store,
            lists,
            clock,
            acquire_timeout,
            settings,
        }
    }

    /// Look up a configured list
    pub fn list(&self, name: &str) -> Result<&IgnoreListConfig> {
        self.lists
            .get(name)
            .ok_or_else(|| StateError::UnknownIgnoreList {
                name: name.to_string(),
            })
    }

    pub fn lists(&self) -> impl Iterator<Item = &IgnoreListConfig> {
        self.lists.values()
    }

    /// Lists every new request is marked on at submit time
    pub fn submit_lists(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lists
            .values()
            .filter(|list| list.mark_on_submit)
            .map(|list| list.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn with_retry<T, F, Fut>(&self, operation: &str, list: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.settings.mark_retry_attempts.max(1);
        let mut delay = self.settings.mark_retry_delay();
        let mut tried = 0;
        loop {
            tried += 1;
            match attempt().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && tried < attempts => {
                    warn!(
                        operation,
                        list,
                        attempt = tried,
                        error = %e,
                        "Ignore list write failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(operation, list, attempts = tried, error = %e, "Ignore list write failed");
                    return Err(e);
                }
            }
        }
    }

    /// Hide `ids` on `list` as of now. An id that is already on the list keeps
    /// its original insertion time. Returns how many ids were newly marked.
    pub async fn mark_excluded(&self, list: &str, ids: &[PlayerId]) -> Result<usize> {
        self.list(list)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let key = keys::ignore_list(list);
        let score = timestamp_score(self.clock.now());

        let added = self
            .with_retry("mark", list, || {
                let commands = ids
                    .iter()
                    .map(|id| Command::ZAdd {
                        key: key.clone(),
                        member: id.clone(),
                        score,
                        mode: ZAddMode::OnlyNew,
                    })
                    .collect();
                async move {
                    let replies =
                        store::run_transaction(self.store.as_ref(), Some(self.acquire_timeout), None, commands)
                            .await?
                            .unwrap_or_default();
                    Ok(replies.into_iter().map(Reply::into_int).sum::<i64>())
                }
            })
            .await?;

        debug!(list, requested = ids.len(), added, "Marked players as excluded");
        Ok(added as usize)
    }

    /// Restart the window for `ids` on `list` from now, inserting missing ids
    pub async fn refresh(&self, list: &str, ids: &[PlayerId]) -> Result<()> {
        self.list(list)?;
        if ids.is_empty() {
            return Ok(());
        }
        let key = keys::ignore_list(list);
        let score = timestamp_score(self.clock.now());

        self.with_retry("refresh", list, || {
            let commands = ids
                .iter()
                .map(|id| Command::ZAdd {
                    key: key.clone(),
                    member: id.clone(),
                    score,
                    mode: ZAddMode::Upsert,
                })
                .collect();
            async move {
                store::run_transaction(self.store.as_ref(), Some(self.acquire_timeout), None, commands)
                    .await
                    .map(|_| ())
            }
        })
        .await?;

        debug!(list, count = ids.len(), "Refreshed exclusion marks");
        Ok(())
    }

    /// Remove `ids` from `list`. A failure is returned as-is and the entries
    /// stay, keeping the players hidden.
    pub async fn unmark(&self, list: &str, ids: &[PlayerId]) -> Result<usize> {
        self.list(list)?;
        if ids.is_empty() {
            return Ok(0);
        }
        let reply = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZRem {
                key: keys::ignore_list(list),
                members: ids.to_vec(),
            },
        )
        .await
        .inspect_err(|e| {
            warn!(list, count = ids.len(), error = %e, "Unmark failed, players stay hidden");
        })?;

        let removed = reply.into_int() as usize;
        debug!(list, requested = ids.len(), removed, "Removed exclusion marks");
        Ok(removed)
    }

    /// The mark for `id` on `list`, if any
    pub async fn entry(&self, list: &str, id: &str) -> Result<Option<IgnoreListEntry>> {
        self.list(list)?;
        let reply = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZScore {
                key: keys::ignore_list(list),
                member: id.to_string(),
            },
        )
        .await?;

        Ok(reply.into_score().map(|score| IgnoreListEntry {
            list: list.to_string(),
            id: id.to_string(),
            inserted_at: score_timestamp(score),
        }))
    }

    /// Whether `id` is visible with respect to `list` at `now`
    pub async fn is_visible(&self, id: &str, list: &str, now: DateTime<Utc>) -> Result<bool> {
        let window = ExclusionWindow::for_list(self.list(list)?);
        let inserted = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZScore {
                key: keys::ignore_list(list),
                member: id.to_string(),
            },
        )
        .await?
        .into_score();

        Ok(match inserted {
            Some(score) => !window.hides(score, timestamp_score(now)),
            None => true,
        })
    }

    /// Every id hidden by `list` at `now`
    pub async fn excluded_ids(&self, list: &str, now: DateTime<Utc>) -> Result<HashSet<PlayerId>> {
        let window = ExclusionWindow::for_list(self.list(list)?);
        let (min, max) = window.hiding_range(timestamp_score(now));
        let members = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZRangeByScore {
                key: keys::ignore_list(list),
                min,
                max,
                limit: None,
            },
        )
        .await?
        .into_scored();

        Ok(members.into_iter().map(|(id, _)| id).collect())
    }

    /// Union of the ids hidden by each of `lists` at `now`
    pub async fn excluded_by_any(
        &self,
        lists: &[String],
        now: DateTime<Utc>,
    ) -> Result<HashSet<PlayerId>> {
        let mut excluded = HashSet::new();
        for list in lists {
            excluded.extend(self.excluded_ids(list, now).await?);
        }
        Ok(excluded)
    }

    /// Reclaim entries of `list` that can no longer hide anyone. Timed lists
    /// drop entries whose window has elapsed; hard-TTL lists drop entries
    /// whose player record is gone.
    pub async fn sweep(&self, list: &str) -> Result<usize> {
        let window = ExclusionWindow::for_list(self.list(list)?);
        let key = keys::ignore_list(list);
        let now = timestamp_score(self.clock.now());

        let removed = match window.elapsed_range(now) {
            Some((min, max)) => store::run(
                self.store.as_ref(),
                Some(self.acquire_timeout),
                Command::ZRemRangeByScore { key, min, max },
            )
            .await?
            .into_int() as usize,
            None => self.sweep_orphans(&key).await?,
        };

        if removed > 0 {
            info!(list, removed, "Swept ignore list");
        }
        Ok(removed)
    }

    async fn sweep_orphans(&self, key: &str) -> Result<usize> {
        let members = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZRangeByScore {
                key: key.to_string(),
                min: ScoreBound::Unbounded,
                max: ScoreBound::Unbounded,
                limit: None,
            },
        )
        .await?
        .into_scored();

        let mut removed = 0;
        for batch in members.chunks(SWEEP_BATCH) {
            let checks = batch
                .iter()
                .map(|(id, _)| Command::Exists {
                    key: keys::player(id),
                })
                .collect();
            let replies = store::run_transaction(
                self.store.as_ref(),
                Some(self.acquire_timeout),
                None,
                checks,
            )
            .await?
            .unwrap_or_default();

            let orphans: Vec<PlayerId> = batch
                .iter()
                .zip(replies)
                .filter(|(_, exists)| exists.clone().into_int() == 0)
                .map(|((id, _), _)| id.clone())
                .collect();
            if orphans.is_empty() {
                continue;
            }
            removed += store::run(
                self.store.as_ref(),
                Some(self.acquire_timeout),
                Command::ZRem {
                    key: key.to_string(),
                    members: orphans,
                },
            )
            .await?
            .into_int() as usize;
        }
        Ok(removed)
    }

    /// Sweep every configured list, returning the total removed. A failing
    /// list is logged and skipped so the others still get swept.
    pub async fn sweep_all(&self) -> Result<usize> {
        let mut names: Vec<&String> = self.lists.keys().collect();
        names.sort();

        let mut total = 0;
        let mut last_error = None;
        for name in names {
            match self.sweep(name).await {
                Ok(removed) => total += removed,
                Err(e) => {
                    warn!(list = %name, error = %e, "Ignore list sweep failed");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) if total == 0 => Err(e),
            _ => Ok(total),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEINDEXED_LIST, EXPIRED_LIST, PROPOSED_LIST};
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use chrono::TimeZone;

    fn setup() -> (Arc<MemoryStore>, ManualClock, VisibilityFilter) {
        let store = Arc::new(MemoryStore::new(4));
        let clock = ManualClock::new(Utc.timestamp_millis_opt(1_000_000_000).unwrap());
        let filter = VisibilityFilter::new(
            store.clone(),
            IgnoreListConfig::defaults(),
            Arc::new(clock.clone()),
            Duration::from_millis(500),
            VisibilitySettings::default(),
        );
        (store, clock, filter)
    }

    fn ids(raw: &[&str]) -> Vec<PlayerId> {
        raw.iter().map(|id| id.to_string()).collect()
    }

    #[tokio::test]
    async fn test_proposed_window_hides_then_reveals() {
        let (_, clock, filter) = setup();
        filter.mark_excluded(PROPOSED_LIST, &ids(&["p1"])).await.unwrap();

        assert!(!filter.is_visible("p1", PROPOSED_LIST, clock.now()).await.unwrap());
        assert!(filter
            .excluded_ids(PROPOSED_LIST, clock.now())
            .await
            .unwrap()
            .contains("p1"));

        clock.advance(Duration::from_secs(800));
        assert!(filter.is_visible("p1", PROPOSED_LIST, clock.now()).await.unwrap());
        assert!(filter
            .excluded_ids(PROPOSED_LIST, clock.now())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_first_mark_governs() {
        let (_, clock, filter) = setup();
        assert_eq!(filter.mark_excluded(PROPOSED_LIST, &ids(&["p1"])).await.unwrap(), 1);
        let first = filter.entry(PROPOSED_LIST, "p1").await.unwrap().unwrap();

        clock.advance(Duration::from_secs(400));
        assert_eq!(filter.mark_excluded(PROPOSED_LIST, &ids(&["p1"])).await.unwrap(), 0);
        let second = filter.entry(PROPOSED_LIST, "p1").await.unwrap().unwrap();
        assert_eq!(first.inserted_at, second.inserted_at);

        clock.advance(Duration::from_secs(400));
        assert!(filter.is_visible("p1", PROPOSED_LIST, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_refresh_restarts_window() {
        let (_, clock, filter) = setup();
        filter.mark_excluded(PROPOSED_LIST, &ids(&["p1"])).await.unwrap();
        clock.advance(Duration::from_secs(500));
        filter.refresh(PROPOSED_LIST, &ids(&["p1"])).await.unwrap();

        clock.advance(Duration::from_secs(500));
        assert!(!filter.is_visible("p1", PROPOSED_LIST, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_list_hides_after_offset_forever() {
        let (_, clock, filter) = setup();
        filter.mark_excluded(EXPIRED_LIST, &ids(&["p1"])).await.unwrap();
        assert!(filter.is_visible("p1", EXPIRED_LIST, clock.now()).await.unwrap());

        clock.advance(Duration::from_secs(800));
        assert!(!filter.is_visible("p1", EXPIRED_LIST, clock.now()).await.unwrap());

        clock.advance(Duration::from_secs(86_400));
        assert!(!filter.is_visible("p1", EXPIRED_LIST, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unmark_reveals_immediately() {
        let (_, clock, filter) = setup();
        filter
            .mark_excluded(PROPOSED_LIST, &ids(&["p1", "p2"]))
            .await
            .unwrap();
        assert_eq!(filter.unmark(PROPOSED_LIST, &ids(&["p1"])).await.unwrap(), 1);

        assert!(filter.is_visible("p1", PROPOSED_LIST, clock.now()).await.unwrap());
        assert!(!filter.is_visible("p2", PROPOSED_LIST, clock.now()).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_list_is_rejected() {
        let (_, clock, filter) = setup();
        let err = filter.is_visible("p1", "banned", clock.now()).await.unwrap_err();
        assert_eq!(
            err,
            StateError::UnknownIgnoreList {
                name: "banned".into()
            }
        );
    }

    #[tokio::test]
    async fn test_sweep_timed_list_drops_elapsed_entries() {
        let (store, clock, filter) = setup();
        filter.mark_excluded(DEINDEXED_LIST, &ids(&["old"])).await.unwrap();
        clock.advance(Duration::from_secs(500));
        filter.mark_excluded(DEINDEXED_LIST, &ids(&["new"])).await.unwrap();
        clock.advance(Duration::from_secs(300));

        assert_eq!(filter.sweep(DEINDEXED_LIST).await.unwrap(), 1);
        assert!(filter.entry(DEINDEXED_LIST, "old").await.unwrap().is_none());
        assert!(filter.entry(DEINDEXED_LIST, "new").await.unwrap().is_some());
        assert_eq!(store.status().available, 4);
    }

    #[tokio::test]
    async fn test_sweep_hard_ttl_keeps_live_players() {
        let (store, clock, filter) = setup();
        store::run(
            store.as_ref(),
            None,
            Command::HSet {
                key: keys::player("alive"),
                fields: vec![("properties".into(), "{}".into())],
            },
        )
        .await
        .unwrap();
        filter
            .mark_excluded(EXPIRED_LIST, &ids(&["alive", "gone"]))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(900));

        assert_eq!(filter.sweep(EXPIRED_LIST).await.unwrap(), 1);
        assert!(!filter.is_visible("alive", EXPIRED_LIST, clock.now()).await.unwrap());
        assert!(filter.entry(EXPIRED_LIST, "gone").await.unwrap().is_none());
    }
}
