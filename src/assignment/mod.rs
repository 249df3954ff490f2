//! Assignment notifier
//!
//! The evaluator publishes a connection string onto a player's record and a
//! waiting client picks it up through a [`WatchHandle`]. Publishing after
//! the watch started and watching after the publish both deliver it.

pub mod watch;

pub use watch::{PollSchedule, WatchHandle, WatchState};

use crate::config::AssignmentSettings;
use crate::error::Result;
use crate::keys;
use crate::store::{self, Command, Guard, KeyValueStore};
use crate::types::PlayerId;
use crate::utils::{timestamp_score, Clock};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct AssignmentNotifier {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    connstring_field: String,
    default_timeout: Duration,
    schedule: PollSchedule,
}

impl AssignmentNotifier {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        settings: &AssignmentSettings,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            connstring_field: settings.connstring_field.clone(),
            default_timeout: settings.default_timeout(),
            schedule: PollSchedule {
                initial: settings.initial_poll(),
                max: settings.max_poll(),
                multiplier: settings.backoff_multiplier,
                jitter: settings.jitter,
                acquire_timeout,
            },
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    fn acquire_timeout(&self) -> Option<Duration> {
        Some(self.schedule.acquire_timeout)
    }

    /// Attach a connection string to `id`'s record. A later publish replaces
    /// an earlier one.
    pub async fn publish(&self, id: &str, connection_string: &str) -> Result<()> {
        store::run(
            self.store.as_ref(),
            self.acquire_timeout(),
            Command::HSet {
                key: keys::player(id),
                fields: vec![
                    (self.connstring_field.clone(), connection_string.to_string()),
                    (
                        keys::ASSIGNED_AT_FIELD.to_string(),
                        timestamp_score(self.clock.now()).to_string(),
                    ),
                ],
            },
        )
        .await?;
        info!(id, "Published assignment");
        Ok(())
    }

    /// Publish only when the record still exists. Returns false when the
    /// request was withdrawn in the meantime.
    pub async fn publish_existing(&self, id: &str, connection_string: &str) -> Result<bool> {
        let key = keys::player(id);
        let applied = store::run_transaction(
            self.store.as_ref(),
            self.acquire_timeout(),
            Some(Guard::KeyPresent(key.clone())),
            vec![Command::HSet {
                key,
                fields: vec![
                    (self.connstring_field.clone(), connection_string.to_string()),
                    (
                        keys::ASSIGNED_AT_FIELD.to_string(),
                        timestamp_score(self.clock.now()).to_string(),
                    ),
                ],
            }],
        )
        .await?;

        if applied.is_none() {
            debug!(id, "Skipped assignment for withdrawn request");
            return Ok(false);
        }
        info!(id, "Published assignment");
        Ok(true)
    }

    /// Current connection string for `id`, if one was published
    pub async fn fetch(&self, id: &str) -> Result<Option<String>> {
        let reply = store::run(
            self.store.as_ref(),
            self.acquire_timeout(),
            Command::HGet {
                key: keys::player(id),
                field: self.connstring_field.clone(),
            },
        )
        .await?;
        Ok(reply.into_text().filter(|conn| !conn.is_empty()))
    }

    /// Remove a published connection string. Returns whether one was removed.
    pub async fn clear(&self, id: &str) -> Result<bool> {
        let reply = store::run(
            self.store.as_ref(),
            self.acquire_timeout(),
            Command::HDel {
                key: keys::player(id),
                fields: vec![
                    self.connstring_field.clone(),
                    keys::ASSIGNED_AT_FIELD.to_string(),
                ],
            },
        )
        .await?;
        let cleared = reply.into_int() > 0;
        if cleared {
            info!(id, "Cleared assignment");
        }
        Ok(cleared)
    }

    /// Start watching `id` for an assignment. The watch ends with the
    /// assignment, [`crate::StateError::TimedOut`] after `timeout`, or
    /// [`crate::StateError::Cancelled`] once `cancel` fires or the handle is
    /// dropped.
    pub fn watch(
        &self,
        id: impl Into<PlayerId>,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> WatchHandle {
        let token = match cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        WatchHandle::spawn(
            self.store.clone(),
            id.into(),
            self.connstring_field.clone(),
            timeout.unwrap_or(self.default_timeout),
            self.schedule.clone(),
            token,
        )
    }
}
