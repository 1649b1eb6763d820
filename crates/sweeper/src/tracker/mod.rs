//! Attempt tracking: durable cooldown markers plus per-run failure memory.
//!
//! Two separate mechanisms keep the daemon from thrashing on the same issue:
//!
//! - A durable marker per item (see [`MarkerStore`]) records the last attempt
//!   and its outcome. Any instance that sees a marker younger than the
//!   cooldown window skips the item, so the window survives restarts.
//! - The session failure set lives only in memory. An item that failed in this
//!   run is never dispatched again by this run, even after its cooldown
//!   expires; a fresh process starts with an empty set.
//! - Items whose marker could not be written are also remembered for the rest
//!   of the run, since nothing durable would hold them back otherwise.

pub mod comments;
pub mod file;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, warn};

use crate::source::{ItemKey, Repository, WorkItem};

pub use comments::GhCommentMarkers;
pub use file::FileMarkerStore;

/// How far in the future (seconds) a marker timestamp may lie and still be
/// trusted.
pub const MAX_CLOCK_SKEW_SECS: i64 = 300;

/// Outcome of one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Succeeded,
    Failed,
    /// The fixer ran but had nothing to contribute
    Skipped,
}

impl AttemptOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The last attempt made on an item. One per item, overwritten each time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub item: ItemKey,
    pub last_attempt_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    #[serde(default)]
    pub reason: String,
}

impl AttemptRecord {
    /// Time left in the cooldown window at `now`, if any.
    ///
    /// A record dated beyond the allowed clock skew never holds an item back.
    #[must_use]
    pub fn cooldown_remaining(&self, window: Duration, now: DateTime<Utc>) -> Option<Duration> {
        if self.last_attempt_at > now + Duration::seconds(MAX_CLOCK_SKEW_SECS) {
            return None;
        }
        let age = now - self.last_attempt_at;
        (age < window).then(|| (window - age).min(window))
    }
}

/// Durable storage for attempt markers, visible across process restarts.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MarkerStore: Send + Sync {
    /// Most recent marker for the item, if one exists.
    async fn last_attempt(
        &self,
        repository: &Repository,
        item: &WorkItem,
    ) -> Result<Option<AttemptRecord>>;

    /// Create or replace the marker for the item.
    async fn record_attempt(&self, repository: &Repository, record: &AttemptRecord) -> Result<()>;
}

/// Cooldown and session-failure bookkeeping for the orchestrator.
pub struct AttemptTracker {
    store: Box<dyn MarkerStore>,
    cooldown: Duration,
    session_failures: HashSet<ItemKey>,
    unmarked: HashSet<ItemKey>,
}

impl AttemptTracker {
    #[must_use]
    pub fn new(store: Box<dyn MarkerStore>, cooldown: Duration) -> Self {
        Self {
            store,
            cooldown,
            session_failures: HashSet::new(),
            unmarked: HashSet::new(),
        }
    }

    /// Cooldown window in use.
    #[must_use]
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a durable marker younger than the cooldown window exists.
    ///
    /// A marker lookup that fails counts as "no marker".
    pub async fn is_in_cooldown(&self, repository: &Repository, item: &WorkItem) -> bool {
        self.is_in_cooldown_at(repository, item, Utc::now()).await
    }

    /// [`Self::is_in_cooldown`] evaluated at an explicit instant.
    pub async fn is_in_cooldown_at(
        &self,
        repository: &Repository,
        item: &WorkItem,
        now: DateTime<Utc>,
    ) -> bool {
        let record = match self.store.last_attempt(repository, item).await {
            Ok(record) => record,
            Err(e) => {
                warn!(item = %item.key(), error = %format!("{e:#}"), "Marker lookup failed, assuming no cooldown");
                return false;
            }
        };

        let Some(record) = record else {
            return false;
        };

        match record.cooldown_remaining(self.cooldown, now) {
            Some(remaining) => {
                info!(
                    item = %item.key(),
                    last_outcome = %record.outcome,
                    remaining_mins = remaining.num_minutes(),
                    "Item in cooldown"
                );
                true
            }
            None => {
                debug!(item = %item.key(), last_outcome = %record.outcome, "Cooldown expired");
                false
            }
        }
    }

    /// Record a dispatch outcome in session memory and the durable marker.
    pub async fn record_outcome(
        &mut self,
        repository: &Repository,
        item: &WorkItem,
        outcome: AttemptOutcome,
        reason: &str,
    ) {
        let key = item.key();
        if outcome == AttemptOutcome::Failed {
            self.session_failures.insert(key.clone());
        }

        let record = AttemptRecord {
            item: key,
            last_attempt_at: Utc::now(),
            outcome,
            reason: reason.to_string(),
        };
        if let Err(e) = self.store.record_attempt(repository, &record).await {
            warn!(item = %record.item, error = %format!("{e:#}"), "Failed to write attempt marker");
            self.unmarked.insert(record.item);
        } else {
            debug!(item = %record.item, outcome = %outcome, "Attempt marker written");
        }
    }

    /// Whether the item already failed during this process lifetime.
    #[must_use]
    pub fn is_session_failed(&self, key: &ItemKey) -> bool {
        self.session_failures.contains(key)
    }

    /// Whether an attempt on the item this run left no durable marker.
    #[must_use]
    pub fn is_unmarked(&self, key: &ItemKey) -> bool {
        self.unmarked.contains(key)
    }

    /// Items that failed during this process lifetime.
    #[must_use]
    pub fn session_failures(&self) -> &HashSet<ItemKey> {
        &self.session_failures
    }
}
