//! Request lifecycle coordinator
//!
//! Composes the ledger, visibility filter, index and notifier into the
//! operations clients and evaluators call:
//!
//! - clients submit, cancel, await and revoke their own requests
//! - evaluators query the pool, propose players, and either reject the
//!   proposal or turn it into assignments
//!
//! None of these take a lock; every cross-participant guarantee comes from
//! the store's atomic operations.

use crate::assignment::{AssignmentNotifier, WatchHandle};
use crate::config::{AppConfig, DEINDEXED_LIST, PROPOSED_LIST};
use crate::error::{Result, StateError};
use crate::index::{IndexSchema, PoolFilter, PoolIndex, PoolQuery};
use crate::ledger::{unique_ids, PlayerLedger};
use crate::metrics::{MetricsCollector, MetricsTimer};
use crate::store::KeyValueStore;
use crate::types::{Assignment, Assignments, PlayerId, PlayerRequest, Properties, Roster};
use crate::utils::Clock;
use crate::visibility::VisibilityFilter;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Keeps the active-watch gauge balanced when an await is abandoned
struct WatchGuard<'a> {
    metrics: &'a MetricsCollector,
    id: &'a str,
    finished: bool,
}

impl<'a> WatchGuard<'a> {
    fn new(metrics: &'a MetricsCollector, id: &'a str) -> Self {
        metrics.record_watch_started();
        Self {
            metrics,
            id,
            finished: false,
        }
    }

    fn finish<T>(mut self, result: &Result<T>) {
        self.finished = true;
        self.metrics.record_watch_finished(result);
    }
}

impl Drop for WatchGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let abandoned: Result<()> = Err(StateError::Cancelled {
                id: self.id.to_string(),
            });
            self.metrics.record_watch_finished(&abandoned);
        }
    }
}

/// Entry point for every request lifecycle operation
#[derive(Clone)]
pub struct RequestCoordinator {
    ledger: Arc<PlayerLedger>,
    visibility: Arc<VisibilityFilter>,
    index: Arc<PoolIndex>,
    notifier: Arc<AssignmentNotifier>,
    metrics: Arc<MetricsCollector>,
}

impl RequestCoordinator {
    /// Build every component over `store` from configuration
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        let acquire_timeout = config.store.acquire_timeout();

        let visibility = Arc::new(VisibilityFilter::new(
            store.clone(),
            config.ignore_lists.clone(),
            clock.clone(),
            acquire_timeout,
            config.visibility.clone(),
        ));
        let ledger = Arc::new(PlayerLedger::new(
            store.clone(),
            IndexSchema::new(config.indexing.fields.clone()),
            clock.clone(),
            acquire_timeout,
            config.assignment.connstring_field.clone(),
        ));
        let index = Arc::new(PoolIndex::new(
            store.clone(),
            visibility.clone(),
            config.store.page_size,
            acquire_timeout,
        ));
        let notifier = Arc::new(AssignmentNotifier::new(
            store,
            clock,
            &config.assignment,
            acquire_timeout,
        ));

        Self {
            ledger,
            visibility,
            index,
            notifier,
            metrics,
        }
    }

    pub fn ledger(&self) -> &PlayerLedger {
        &self.ledger
    }

    pub fn visibility(&self) -> &VisibilityFilter {
        &self.visibility
    }

    pub fn index(&self) -> &PoolIndex {
        &self.index
    }

    pub fn notifier(&self) -> &AssignmentNotifier {
        &self.notifier
    }

    pub fn metrics(&self) -> Arc<MetricsCollector> {
        self.metrics.clone()
    }

    fn observe<T>(&self, operation: &str, timer: MetricsTimer, result: Result<T>) -> Result<T> {
        self.metrics
            .record_operation(operation, &result, timer.stop());
        result
    }

    /// Record a new request and start its window on every submit-time list. A
    /// second submit for a live id fails with [`StateError::DuplicateRequest`].
    pub async fn submit_request(&self, id: &str, properties: Properties) -> Result<PlayerRequest> {
        let timer = self.metrics.start_timer();
        let result = self.submit_inner(id, properties).await;
        self.observe("submit_request", timer, result)
    }

    async fn submit_inner(&self, id: &str, properties: Properties) -> Result<PlayerRequest> {
        let request = self
            .ledger
            .create(id, properties)
            .await
            .map_err(|e| match e {
                StateError::AlreadyExists { id } => StateError::DuplicateRequest { id },
                other => other,
            })?;

        // The request is new, so a mark left behind by an earlier request
        // under the same id must not carry over its insertion time
        let ids = [request.id.clone()];
        for list in self.visibility.submit_lists() {
            match self.visibility.refresh(&list, &ids).await {
                Ok(()) => self.metrics.record_marks(&list, ids.len()),
                Err(e) => {
                    // The request stays visible on this list
                    self.metrics.record_mark_failure(&list);
                    error!(id, list = %list, error = %e, "Failed to mark new request");
                }
            }
        }
        Ok(request)
    }

    /// Withdraw a request. Unknown ids are ignored.
    pub async fn cancel_request(&self, id: &str) -> Result<bool> {
        let timer = self.metrics.start_timer();
        let result = self.ledger.delete(id).await;
        self.observe("cancel_request", timer, result)
    }

    /// Read a request record
    pub async fn get_request(&self, id: &str) -> Result<PlayerRequest> {
        let timer = self.metrics.start_timer();
        let result = self.ledger.get(id).await;
        self.observe("get_request", timer, result)
    }

    /// Start a watch without waiting on it
    pub fn watch_assignment(
        &self,
        id: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> WatchHandle {
        self.notifier.watch(id, timeout, cancel)
    }

    /// Wait for `id`'s assignment, up to `timeout` (the configured default
    /// when `None`). Dropping the returned future tears the watch down.
    pub async fn await_assignment(
        &self,
        id: &str,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Assignment> {
        let timer = self.metrics.start_timer();
        let guard = WatchGuard::new(&self.metrics, id);

        let result = self.notifier.watch(id, timeout, cancel).outcome().await;
        guard.finish(&result);
        if let Err(StateError::TimedOut { waited, .. }) = &result {
            debug!(id, waited = ?waited, "No assignment before timeout");
        }
        self.observe("await_assignment", timer, result)
    }

    /// Client acknowledgement of an assignment; removes the request record
    pub async fn revoke_assignment(&self, id: &str) -> Result<bool> {
        let timer = self.metrics.start_timer();
        let result = self.ledger.delete(id).await;
        if let Ok(true) = result {
            info!(id, "Assignment acknowledged, request removed");
        }
        self.observe("revoke_assignment", timer, result)
    }

    /// Start a query over the pool
    pub fn query_pool(&self, filter: PoolFilter) -> Result<PoolQuery> {
        let timer = self.metrics.start_timer();
        let result = self.index.query(filter);
        self.observe("query_pool", timer, result)
    }

    /// Hide `ids` from other evaluators while a match is being considered
    pub async fn propose(&self, ids: &[PlayerId]) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let result = self.visibility.mark_excluded(PROPOSED_LIST, ids).await;
        match &result {
            Ok(added) => {
                self.metrics.record_marks(PROPOSED_LIST, *added);
                debug!(requested = ids.len(), added, "Proposed players");
            }
            Err(_) => self.metrics.record_mark_failure(PROPOSED_LIST),
        }
        self.observe("propose", timer, result)
    }

    /// Return proposed players to the pool
    pub async fn reject_proposal(&self, ids: &[PlayerId]) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let result = self.visibility.unmark(PROPOSED_LIST, ids).await;
        self.observe("reject_proposal", timer, result)
    }

    /// Accept a match: hide every rostered player for good, deliver the
    /// connection info and drop them from the pool indexes. Players whose
    /// request was withdrawn in the meantime are skipped. Returns how many
    /// players were assigned.
    pub async fn create_assignments(&self, assignments: &Assignments) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let result = self.create_assignments_inner(assignments).await;
        self.observe("create_assignments", timer, result)
    }

    async fn create_assignments_inner(&self, assignments: &Assignments) -> Result<usize> {
        if assignments.connection_info.is_empty() {
            return Err(StateError::InvalidProperties {
                id: assignments
                    .rosters
                    .iter()
                    .map(|roster| roster.name.as_str())
                    .collect::<Vec<_>>()
                    .join(","),
                reason: "connection info cannot be empty".to_string(),
            });
        }
        let ids = unique_ids(assignments.player_ids());
        if ids.is_empty() {
            return Ok(0);
        }

        let added = self
            .visibility
            .mark_excluded(DEINDEXED_LIST, &ids)
            .await
            .inspect_err(|_| self.metrics.record_mark_failure(DEINDEXED_LIST))?;
        self.metrics.record_marks(DEINDEXED_LIST, added);

        let mut assigned = 0;
        for id in &ids {
            if !self
                .notifier
                .publish_existing(id, &assignments.connection_info)
                .await?
            {
                warn!(id = %id, "Skipping assignment for withdrawn request");
                continue;
            }
            self.ledger.deindex(id).await?;
            assigned += 1;
        }

        info!(
            rosters = assignments.rosters.len(),
            players = ids.len(),
            assigned,
            "Created assignments"
        );
        Ok(assigned)
    }

    /// Withdraw published connection info for every player of `roster`.
    /// Returns how many players had one.
    pub async fn delete_assignments(&self, roster: &Roster) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let result = self.delete_assignments_inner(roster).await;
        self.observe("delete_assignments", timer, result)
    }

    async fn delete_assignments_inner(&self, roster: &Roster) -> Result<usize> {
        let mut cleared = 0;
        for id in unique_ids(&roster.player_ids) {
            if self.notifier.clear(&id).await? {
                cleared += 1;
            }
        }
        info!(roster = %roster.name, cleared, "Deleted assignments");
        Ok(cleared)
    }

    /// Reclaim ignore list entries that can no longer hide anyone
    pub async fn sweep(&self) -> Result<usize> {
        let timer = self.metrics.start_timer();
        let result = self.visibility.sweep_all().await;
        if let Ok(removed) = &result {
            self.metrics.record_sweep(*removed);
        }
        self.observe("sweep", timer, result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::utils::ManualClock;
    use serde_json::json;

    fn coordinator() -> (Arc<MemoryStore>, ManualClock, RequestCoordinator) {
        let store = Arc::new(MemoryStore::new(8));
        let clock = ManualClock::default();
        let mut config = AppConfig::default();
        config.assignment.initial_poll_ms = 10;
        config.assignment.max_poll_ms = 50;
        let coordinator = RequestCoordinator::new(
            store.clone(),
            &config,
            Arc::new(clock.clone()),
            Arc::new(MetricsCollector::new().unwrap()),
        );
        (store, clock, coordinator)
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_rejected() {
        let (_, _, coordinator) = coordinator();
        coordinator
            .submit_request("p1", json!({"region": "eu-west1"}))
            .await
            .unwrap();
        let err = coordinator
            .submit_request("p1", json!({"region": "eu-west1"}))
            .await
            .unwrap_err();
        assert_eq!(err, StateError::DuplicateRequest { id: "p1".into() });
    }

    #[tokio::test]
    async fn test_submit_marks_expiry_list() {
        let (_, clock, coordinator) = coordinator();
        coordinator.submit_request("p1", json!({})).await.unwrap();

        let entry = coordinator
            .visibility()
            .entry(crate::config::EXPIRED_LIST, "p1")
            .await
            .unwrap();
        assert!(entry.is_some());

        let visible = coordinator
            .visibility()
            .is_visible("p1", crate::config::EXPIRED_LIST, clock.now())
            .await
            .unwrap();
        assert!(visible);
    }

    #[tokio::test]
    async fn test_resubmission_restarts_expiry_window() {
        let (_, clock, coordinator) = coordinator();
        coordinator
            .submit_request("p1", json!({"region": "eu-west1"}))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(900));
        assert!(coordinator.cancel_request("p1").await.unwrap());

        coordinator
            .submit_request("p1", json!({"region": "eu-west1"}))
            .await
            .unwrap();
        let entry = coordinator
            .visibility()
            .entry(crate::config::EXPIRED_LIST, "p1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            entry.inserted_at.timestamp_millis(),
            clock.now().timestamp_millis()
        );

        let pool = coordinator
            .query_pool(
                PoolFilter::new()
                    .tag("region.eu-west1")
                    .excluding(crate::config::EXPIRED_LIST),
            )
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(pool, vec!["p1".to_string()]);
    }

    #[tokio::test]
    async fn test_propose_then_reject_round_trip() {
        let (_, clock, coordinator) = coordinator();
        coordinator
            .submit_request("p1", json!({"region": "eu-west1"}))
            .await
            .unwrap();
        let ids = vec!["p1".to_string()];

        assert_eq!(coordinator.propose(&ids).await.unwrap(), 1);
        let filter = PoolFilter::new()
            .tag("region.eu-west1")
            .excluding(PROPOSED_LIST);
        let pool = coordinator
            .query_pool(filter.clone())
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert!(pool.is_empty());

        assert_eq!(coordinator.reject_proposal(&ids).await.unwrap(), 1);
        let pool = coordinator
            .query_pool(filter)
            .unwrap()
            .collect_all()
            .await
            .unwrap();
        assert_eq!(pool, ids);
        assert!(coordinator
            .visibility()
            .is_visible("p1", PROPOSED_LIST, clock.now())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_create_assignments_delivers_and_deindexes() {
        let (store, _, coordinator) = coordinator();
        for id in ["a", "b"] {
            coordinator
                .submit_request(id, json!({"mode": "ranked"}))
                .await
                .unwrap();
        }
        let assignments = Assignments {
            connection_info: "10.1.1.1:7777".into(),
            rosters: vec![
                Roster::new("red", vec!["a".into()]),
                Roster::new("blue", vec!["b".into(), "ghost".into()]),
            ],
        };

        assert_eq!(coordinator.create_assignments(&assignments).await.unwrap(), 2);
        assert_eq!(coordinator.index().count("mode.ranked").await.unwrap(), 0);

        let assignment = coordinator
            .await_assignment("a", Some(Duration::from_secs(2)), None)
            .await
            .unwrap();
        assert_eq!(assignment.connection_string, "10.1.1.1:7777");
        assert!(!coordinator.ledger().exists("ghost").await.unwrap());

        assert!(coordinator.revoke_assignment("a").await.unwrap());
        assert!(!coordinator.ledger().exists("a").await.unwrap());
        assert_eq!(store.status().available, 8);
    }

    #[tokio::test]
    async fn test_delete_assignments_clears_connection_info() {
        let (_, _, coordinator) = coordinator();
        coordinator.submit_request("a", json!({})).await.unwrap();
        let roster = Roster::new("red", vec!["a".into()]);
        coordinator
            .create_assignments(&Assignments {
                connection_info: "addr".into(),
                rosters: vec![roster.clone()],
            })
            .await
            .unwrap();

        assert_eq!(coordinator.delete_assignments(&roster).await.unwrap(), 1);
        assert_eq!(coordinator.notifier().fetch("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_empty_connection_info_is_rejected() {
        let (_, _, coordinator) = coordinator();
        let err = coordinator
            .create_assignments(&Assignments {
                connection_info: String::new(),
                rosters: vec![Roster::new("red", vec!["a".into()])],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidProperties { .. }));
    }

    #[tokio::test]
    async fn test_abandoned_await_balances_watch_gauge() {
        let (_, _, coordinator) = coordinator();
        let pending = coordinator.await_assignment("p9", Some(Duration::from_secs(30)), None);
        let _ = tokio::time::timeout(Duration::from_millis(30), pending).await;

        assert_eq!(coordinator.metrics().requests().active_watches.get(), 0);
    }
}
