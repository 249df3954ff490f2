//! Indexed query layer
//!
//! Requests are added to one sorted set per indexed attribute when they are
//! created (see [`crate::ledger`]) and to the `requests:all` set. This module
//! answers "which requests match these constraints and are not hidden" by
//! paging through those sets.

pub mod query;
pub mod schema;

pub use query::{Constraint, Cursor, PoolFilter, PoolQuery};
pub use schema::{IndexSchema, IndexedAttribute};

use crate::error::Result;
use crate::keys;
use crate::store::{self, Command, KeyValueStore};
use crate::visibility::VisibilityFilter;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for pool queries
pub struct PoolIndex {
    store: Arc<dyn KeyValueStore>,
    visibility: Arc<VisibilityFilter>,
    page_size: usize,
    acquire_timeout: Duration,
}

impl PoolIndex {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        visibility: Arc<VisibilityFilter>,
        page_size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            store,
            visibility,
            page_size,
            acquire_timeout,
        }
    }

    /// Start a query with the configured page size
    pub fn query(&self, filter: PoolFilter) -> Result<PoolQuery> {
        self.query_with_page_size(filter, self.page_size)
    }

    /// Start a query returning pages of at most `page_size` ids
    pub fn query_with_page_size(&self, filter: PoolFilter, page_size: usize) -> Result<PoolQuery> {
        for list in &filter.ignore_lists {
            self.visibility.list(list)?;
        }
        Ok(PoolQuery::new(
            self.store.clone(),
            self.visibility.clone(),
            filter,
            page_size,
            self.acquire_timeout,
        ))
    }

    /// Number of requests indexed under `attribute`
    pub async fn count(&self, attribute: &str) -> Result<usize> {
        let reply = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZCard {
                key: keys::index(attribute),
            },
        )
        .await?;
        Ok(reply.into_int() as usize)
    }

    /// Number of indexed requests
    pub async fn pool_size(&self) -> Result<usize> {
        let reply = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZCard {
                key: keys::ALL_REQUESTS_INDEX.to_string(),
            },
        )
        .await?;
        Ok(reply.into_int() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IgnoreListConfig, VisibilitySettings, PROPOSED_LIST};
    use crate::error::StateError;
    use crate::store::{MemoryStore, ZAddMode};
    use crate::utils::ManualClock;

    struct Harness {
        store: Arc<MemoryStore>,
        visibility: Arc<VisibilityFilter>,
        index: PoolIndex,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new(4));
        let visibility = Arc::new(VisibilityFilter::new(
            store.clone(),
            IgnoreListConfig::defaults(),
            Arc::new(ManualClock::default()),
            Duration::from_millis(500),
            VisibilitySettings::default(),
        ));
        let index = PoolIndex::new(
            store.clone(),
            visibility.clone(),
            100,
            Duration::from_millis(500),
        );
        Harness {
            store,
            visibility,
            index,
        }
    }

    async fn put(store: &MemoryStore, attribute: &str, id: &str, score: f64) {
        store::run(
            store,
            None,
            Command::ZAdd {
                key: keys::index(attribute),
                member: id.to_string(),
                score,
                mode: ZAddMode::Upsert,
            },
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_tag_query_excludes_proposed() {
        let h = harness();
        for (i, id) in ["p1", "p2", "p3"].iter().enumerate() {
            put(&h.store, "region.eu-west1", id, i as f64).await;
        }
        h.visibility
            .mark_excluded(PROPOSED_LIST, &["p2".to_string()])
            .await
            .unwrap();

        let filter = PoolFilter::new()
            .tag("region.eu-west1")
            .excluding(PROPOSED_LIST);
        let ids = h.index.query(filter).unwrap().collect_all().await.unwrap();
        assert_eq!(ids, vec!["p1".to_string(), "p3".to_string()]);
    }

    #[tokio::test]
    async fn test_range_and_tag_intersect() {
        let h = harness();
        put(&h.store, "region.eu-west1", "a", 1.0).await;
        put(&h.store, "region.eu-west1", "b", 2.0).await;
        put(&h.store, "region.eu-west1", "c", 3.0).await;
        put(&h.store, "mmr.rating", "a", 1200.0).await;
        put(&h.store, "mmr.rating", "b", 1800.0).await;

        let filter = PoolFilter::new()
            .tag("region.eu-west1")
            .range("mmr.rating", 1000.0, 1500.0);
        let ids = h.index.query(filter).unwrap().collect_all().await.unwrap();
        assert_eq!(ids, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_pages_cover_ties_without_duplicates() {
        let h = harness();
        for i in 0..25 {
            put(&h.store, "mode.ranked", &format!("p{:02}", i), (i / 10) as f64).await;
        }

        let mut query = h
            .index
            .query_with_page_size(PoolFilter::new().tag("mode.ranked"), 4)
            .unwrap();
        let mut seen = Vec::new();
        while let Some(page) = query.next_page().await.unwrap() {
            assert!(page.len() <= 4);
            seen.extend(page);
        }
        assert_eq!(seen.len(), 25);
        let mut deduped = seen.clone();
        deduped.dedup();
        assert_eq!(deduped, seen);
        assert!(query.is_exhausted());
        assert_eq!(h.store.status().available, 4);
    }

    #[tokio::test]
    async fn test_removal_between_pages_does_not_skip() {
        let h = harness();
        for i in 0..6 {
            put(&h.store, "mode.casual", &format!("p{}", i), 7.0).await;
        }

        let mut query = h
            .index
            .query_with_page_size(PoolFilter::new().tag("mode.casual"), 3)
            .unwrap();
        let first = query.next_page().await.unwrap().unwrap();
        assert_eq!(first, vec!["p0", "p1", "p2"]);

        store::run(
            h.store.as_ref(),
            None,
            Command::ZRem {
                key: keys::index("mode.casual"),
                members: vec!["p1".into()],
            },
        )
        .await
        .unwrap();

        let second = query.next_page().await.unwrap().unwrap();
        assert_eq!(second, vec!["p3", "p4", "p5"]);
        assert!(query.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_restart_rereads_from_start() {
        let h = harness();
        put(&h.store, "map.dust", "p1", 1.0).await;

        let mut query = h.index.query(PoolFilter::new().tag("map.dust")).unwrap();
        assert_eq!(query.next_page().await.unwrap().unwrap(), vec!["p1"]);
        assert!(query.next_page().await.unwrap().is_none());

        query.restart();
        assert_eq!(query.next_page().await.unwrap().unwrap(), vec!["p1"]);
    }

    #[tokio::test]
    async fn test_unknown_ignore_list_is_rejected() {
        let h = harness();
        let err = h
            .index
            .query(PoolFilter::new().excluding("banned"))
            .err()
            .unwrap();
        assert!(matches!(err, StateError::UnknownIgnoreList { .. }));
    }

    #[tokio::test]
    async fn test_empty_index_yields_no_pages() {
        let h = harness();
        let mut query = h.index.query(PoolFilter::new().tag("region.nowhere")).unwrap();
        assert!(query.next_page().await.unwrap().is_none());
        assert_eq!(h.index.count("region.nowhere").await.unwrap(), 0);
    }
}
