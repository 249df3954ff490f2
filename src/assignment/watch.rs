//! Assignment watches
//!
//! A watch is a spawned task that polls the player record until the
//! connection string shows up, the deadline passes or it is cancelled.
//! Each store read and each sleep races against cancellation and the
//! deadline, and the connection is returned before sleeping, so a finished
//! or abandoned watch never holds a pooled connection.

use crate::error::{Result, StateError};
use crate::keys;
use crate::store::{self, Command, KeyValueStore};
use crate::types::{Assignment, PlayerId};
use crate::utils::Backoff;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of a single watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Unassigned,
    Watching,
    Resolved,
    TimedOut,
    Cancelled,
}

impl WatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WatchState::Resolved | WatchState::TimedOut | WatchState::Cancelled
        )
    }

    fn of(outcome: &Result<Assignment>) -> Self {
        match outcome {
            Ok(_) => WatchState::Resolved,
            Err(StateError::TimedOut { .. }) => WatchState::TimedOut,
            Err(_) => WatchState::Cancelled,
        }
    }
}

/// Polling schedule for watches
#[derive(Debug, Clone)]
pub struct PollSchedule {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    pub jitter: f64,
    /// Longest wait for a pooled connection per read
    pub acquire_timeout: Duration,
}

impl PollSchedule {
    fn backoff(&self) -> Backoff {
        Backoff::new(self.initial, self.max, self.multiplier, self.jitter)
    }
}

/// Handle to a running watch. Dropping it cancels the watch.
pub struct WatchHandle {
    id: PlayerId,
    watch_id: Uuid,
    cancel: CancellationToken,
    state: watch::Receiver<WatchState>,
    outcome: oneshot::Receiver<Result<Assignment>>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    pub(crate) fn spawn(
        store: Arc<dyn KeyValueStore>,
        id: PlayerId,
        field: String,
        timeout: Duration,
        schedule: PollSchedule,
        cancel: CancellationToken,
    ) -> Self {
        let watch_id = Uuid::new_v4();
        let (state_tx, state) = watch::channel(WatchState::Unassigned);
        let (outcome_tx, outcome) = oneshot::channel();

        let poller = Poller {
            store,
            id: id.clone(),
            watch_id,
            field,
            timeout,
            schedule,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(async move {
            let _ = state_tx.send(WatchState::Watching);
            let result = poller.run().await;
            let _ = state_tx.send(WatchState::of(&result));
            let _ = outcome_tx.send(result);
        });

        Self {
            id,
            watch_id,
            cancel,
            state,
            outcome,
            task,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Correlation id used in this watch's log lines
    pub fn watch_id(&self) -> Uuid {
        self.watch_id
    }

    pub fn state(&self) -> WatchState {
        *self.state.borrow()
    }

    /// Stop the watch; its outcome becomes [`StateError::Cancelled`] unless it
    /// had already resolved
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the watch to finish
    pub async fn outcome(mut self) -> Result<Assignment> {
        match (&mut self.outcome).await {
            Ok(result) => result,
            Err(_) => Err(StateError::Cancelled {
                id: self.id.clone(),
            }),
        }
    }

    /// Whether the background task has exited
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle")
            .field("id", &self.id)
            .field("watch_id", &self.watch_id)
            .field("state", &self.state())
            .finish()
    }
}

/// Resolves at `deadline`, or never when there is none
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

struct Poller {
    store: Arc<dyn KeyValueStore>,
    id: PlayerId,
    watch_id: Uuid,
    field: String,
    timeout: Duration,
    schedule: PollSchedule,
    cancel: CancellationToken,
}

impl Poller {
    async fn run(self) -> Result<Assignment> {
        // A timeout too large to add means no deadline at all
        let deadline = Instant::now().checked_add(self.timeout);
        let mut backoff = self.schedule.backoff();
        let mut polls = 0u32;

        debug!(id = %self.id, watch_id = %self.watch_id, timeout = ?self.timeout, "Watching for assignment");

        loop {
            polls += 1;
            let read = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(polls)),
                _ = until(deadline) => return Err(self.timed_out(polls)),
                read = self.read() => read,
            };

            match read {
                Ok(Some(connection_string)) => {
                    info!(id = %self.id, watch_id = %self.watch_id, polls, "Assignment delivered");
                    return Ok(Assignment {
                        id: self.id.clone(),
                        connection_string,
                    });
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(id = %self.id, watch_id = %self.watch_id, error = %e, "Assignment poll failed, will retry");
                }
            }

            let delay = backoff.next_delay();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(self.cancelled(polls)),
                _ = until(deadline) => return Err(self.timed_out(polls)),
                _ = sleep(delay) => {}
            }
        }
    }

    /// One read of the connection string; the connection is released on return
    async fn read(&self) -> Result<Option<String>> {
        let reply = store::run(
            self.store.as_ref(),
            Some(self.schedule.acquire_timeout),
            Command::HGet {
                key: keys::player(&self.id),
                field: self.field.clone(),
            },
        )
        .await?;
        Ok(reply.into_text().filter(|conn| !conn.is_empty()))
    }

    fn cancelled(&self, polls: u32) -> StateError {
        debug!(id = %self.id, watch_id = %self.watch_id, polls, "Assignment watch cancelled");
        StateError::Cancelled {
            id: self.id.clone(),
        }
    }

    fn timed_out(&self, polls: u32) -> StateError {
        info!(id = %self.id, watch_id = %self.watch_id, polls, "Assignment watch timed out");
        StateError::TimedOut {
            id: self.id.clone(),
            waited: self.timeout,
        }
    }
}
