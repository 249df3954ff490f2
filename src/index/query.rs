//! Paged pool queries
//!
//! A query walks the sorted set of its first constraint (the driving index)
//! in score order, checks the remaining constraints for each candidate and
//! drops ids hidden by any of the filter's ignore lists. Paging is keyset
//! based: the cursor remembers the last scanned `(score, id)` so concurrent
//! inserts and removals never shift the position of unread candidates.
//!
//! Queries are weakly consistent. The ignore lists are read once when the
//! first page is fetched; requests created or removed while the query runs
//! may or may not be returned.

use crate::error::Result;
use crate::keys;
use crate::store::{self, Command, KeyValueStore, Reply, ScoreBound};
use crate::types::PlayerId;
use crate::visibility::VisibilityFilter;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A single index predicate
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    /// The request carries the tag attribute
    Tag(String),
    /// The request's numeric attribute lies within the bounds
    Range {
        attribute: String,
        min: ScoreBound,
        max: ScoreBound,
    },
}

impl Constraint {
    pub fn attribute(&self) -> &str {
        match self {
            Constraint::Tag(attribute) => attribute,
            Constraint::Range { attribute, .. } => attribute,
        }
    }

    fn bounds(&self) -> (ScoreBound, ScoreBound) {
        match self {
            Constraint::Tag(_) => (ScoreBound::Unbounded, ScoreBound::Unbounded),
            Constraint::Range { min, max, .. } => (*min, *max),
        }
    }

    fn admits(&self, score: Option<f64>) -> bool {
        let Some(score) = score else {
            return false;
        };
        let (min, max) = self.bounds();
        min.admits_from_below(score) && max.admits_from_above(score)
    }
}

/// Conjunction of index constraints minus the ids hidden by ignore lists
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolFilter {
    pub constraints: Vec<Constraint>,
    pub ignore_lists: Vec<String>,
}

impl PoolFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require a tag attribute, e.g. `region.eu-west1`
    pub fn tag(mut self, attribute: impl Into<String>) -> Self {
        self.constraints.push(Constraint::Tag(attribute.into()));
        self
    }

    /// Require a numeric attribute within `[min, max]`
    pub fn range(mut self, attribute: impl Into<String>, min: f64, max: f64) -> Self {
        self.constraints.push(Constraint::Range {
            attribute: attribute.into(),
            min: ScoreBound::Inclusive(min),
            max: ScoreBound::Inclusive(max),
        });
        self
    }

    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Drop ids currently hidden by `list`
    pub fn excluding(mut self, list: impl Into<String>) -> Self {
        self.ignore_lists.push(list.into());
        self
    }

    fn driving_index(&self) -> (String, ScoreBound, ScoreBound) {
        match self.constraints.first() {
            Some(constraint) => {
                let (min, max) = constraint.bounds();
                (keys::index(constraint.attribute()), min, max)
            }
            None => (
                keys::ALL_REQUESTS_INDEX.to_string(),
                ScoreBound::Unbounded,
                ScoreBound::Unbounded,
            ),
        }
    }
}

/// Position after the last scanned candidate
#[derive(Debug, Clone, PartialEq)]
pub struct Cursor {
    pub score: f64,
    pub id: PlayerId,
    /// Scanned candidates sharing `score`
    ties: usize,
}

impl Cursor {
    fn passed(&self, score: f64, id: &str) -> bool {
        score < self.score || (score == self.score && id <= self.id.as_str())
    }
}

/// An in-progress pool query
pub struct PoolQuery {
    store: Arc<dyn KeyValueStore>,
    visibility: Arc<VisibilityFilter>,
    filter: PoolFilter,
    page_size: usize,
    acquire_timeout: Duration,
    cursor: Option<Cursor>,
    excluded: Option<HashSet<PlayerId>>,
    exhausted: bool,
}

impl PoolQuery {
    pub(crate) fn new(
        store: Arc<dyn KeyValueStore>,
        visibility: Arc<VisibilityFilter>,
        filter: PoolFilter,
        page_size: usize,
        acquire_timeout: Duration,
    ) -> Self {
        Self {
            store,
            visibility,
            filter,
            page_size: page_size.max(1),
            acquire_timeout,
            cursor: None,
            excluded: None,
            exhausted: false,
        }
    }

    pub fn filter(&self) -> &PoolFilter {
        &self.filter
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Start over from the lowest score, re-reading the ignore lists
    pub fn restart(&mut self) {
        self.cursor = None;
        self.excluded = None;
        self.exhausted = false;
    }

    /// Next page of matching ids, at most `page_size` long. Returns `None`
    /// once the driving index has been fully scanned.
    pub async fn next_page(&mut self) -> Result<Option<Vec<PlayerId>>> {
        if self.exhausted {
            return Ok(None);
        }
        if self.excluded.is_none() {
            let now = self.visibility.now();
            let excluded = self
                .visibility
                .excluded_by_any(&self.filter.ignore_lists, now)
                .await?;
            debug!(
                lists = ?self.filter.ignore_lists,
                excluded = excluded.len(),
                "Loaded exclusion snapshot for pool query"
            );
            self.excluded = Some(excluded);
        }

        let mut page = Vec::new();
        while page.len() < self.page_size && !self.exhausted {
            let candidates = self.scan(self.page_size - page.len()).await?;
            page.extend(self.admit(candidates).await?);
        }

        if page.is_empty() && self.exhausted {
            return Ok(None);
        }
        Ok(Some(page))
    }

    /// Drain the query into a single list
    pub async fn collect_all(mut self) -> Result<Vec<PlayerId>> {
        let mut all = Vec::new();
        while let Some(page) = self.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Read up to `want` candidates past the cursor from the driving index
    async fn scan(&mut self, want: usize) -> Result<Vec<PlayerId>> {
        let (key, min, max) = self.filter.driving_index();
        let (min, overlap) = match &self.cursor {
            Some(cursor) => (ScoreBound::Inclusive(cursor.score), cursor.ties),
            None => (min, 0),
        };
        let requested = want + overlap;

        let members = store::run(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            Command::ZRangeByScore {
                key,
                min,
                max,
                limit: Some((0, requested)),
            },
        )
        .await?
        .into_scored();

        if members.len() < requested {
            self.exhausted = true;
        }

        let mut candidates = Vec::with_capacity(want);
        let mut skipped = 0;
        for (id, score) in members {
            if let Some(cursor) = &self.cursor {
                if cursor.passed(score, &id) {
                    skipped += 1;
                    continue;
                }
            }
            if candidates.len() == want {
                // Surplus from the overlap; left for the next scan
                self.exhausted = false;
                break;
            }
            self.cursor = Some(match self.cursor.take() {
                Some(prev) if prev.score == score => Cursor {
                    score,
                    id: id.clone(),
                    ties: prev.ties + 1,
                },
                _ => Cursor {
                    score,
                    id: id.clone(),
                    ties: 1,
                },
            });
            candidates.push(id);
        }

        // Ties inserted behind the cursor filled the whole window; widen it
        if candidates.is_empty() && !self.exhausted {
            if let Some(cursor) = self.cursor.as_mut() {
                cursor.ties = skipped;
            }
        }
        Ok(candidates)
    }

    /// Keep candidates satisfying every other constraint and no ignore list
    async fn admit(&self, candidates: Vec<PlayerId>) -> Result<Vec<PlayerId>> {
        let excluded = self.excluded.as_ref();
        let candidates: Vec<PlayerId> = candidates
            .into_iter()
            .filter(|id| !excluded.is_some_and(|set| set.contains(id)))
            .collect();

        let rest = &self.filter.constraints[self.filter.constraints.len().min(1)..];
        if rest.is_empty() || candidates.is_empty() {
            return Ok(candidates);
        }

        let lookups = candidates
            .iter()
            .flat_map(|id| {
                rest.iter().map(move |constraint| Command::ZScore {
                    key: keys::index(constraint.attribute()),
                    member: id.clone(),
                })
            })
            .collect();
        let scores: Vec<Option<f64>> = store::run_transaction(
            self.store.as_ref(),
            Some(self.acquire_timeout),
            None,
            lookups,
        )
        .await?
        .unwrap_or_default()
        .into_iter()
        .map(Reply::into_score)
        .collect();

        Ok(candidates
            .into_iter()
            .zip(scores.chunks(rest.len()))
            .filter(|(_, scores)| {
                rest.iter()
                    .zip(scores.iter())
                    .all(|(constraint, score)| constraint.admits(*score))
            })
            .map(|(id, _)| id)
            .collect())
    }
}
