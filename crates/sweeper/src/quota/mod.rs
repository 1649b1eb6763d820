//! Remote API quota governor.
//!
//! Before each repository is scanned the orchestrator calls
//! [`QuotaGovernor::check_and_wait`]. The governor looks at every tracked
//! quota category, picks the binding one (fewest requests remaining) and
//! either lets the caller continue, spreads the remaining requests evenly over
//! the time left until reset, or blocks until the quota resets. It never
//! refuses: all back-pressure is expressed as time spent inside the call.

pub mod github;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::QuotaSettings;

pub use github::GhRateLimit;

/// Remaining budget of one quota category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub category: String,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
}

impl QuotaSnapshot {
    /// Build a snapshot, clamping `remaining` to `limit`.
    #[must_use]
    pub fn new(
        category: impl Into<String>,
        remaining: u64,
        limit: u64,
        reset_at: DateTime<Utc>,
    ) -> Self {
        Self {
            category: category.into(),
            remaining: remaining.min(limit),
            limit,
            reset_at,
        }
    }
}

/// Source of quota snapshots.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotaProvider: Send + Sync {
    /// Current snapshot for every tracked category.
    async fn snapshots(&self) -> Result<Vec<QuotaSnapshot>>;
}

/// What the governor decided for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacingDecision {
    /// Plenty of quota, or no usable snapshot
    Proceed,
    /// Low quota: wait this long once to spread the remaining requests
    Pace {
        category: String,
        remaining: u64,
        delay: Duration,
    },
    /// Quota exhausted: wait until reset plus the safety margin
    WaitForReset {
        category: String,
        reset_at: DateTime<Utc>,
        delay: Duration,
    },
}

impl PacingDecision {
    /// Time the caller will be blocked.
    #[must_use]
    pub fn delay(&self) -> Duration {
        match self {
            Self::Proceed => Duration::ZERO,
            Self::Pace { delay, .. } | Self::WaitForReset { delay, .. } => *delay,
        }
    }
}

/// Result of [`QuotaGovernor::check_and_wait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaCheck {
    /// Always `true`; kept so callers read as "check, then proceed"
    pub proceed: bool,
    pub decision: PacingDecision,
}

/// Paces remote calls according to the binding quota category.
pub struct QuotaGovernor {
    provider: Box<dyn QuotaProvider>,
    settings: QuotaSettings,
    /// Latest reset time seen per category; resets never move backwards
    last_reset: HashMap<String, DateTime<Utc>>,
}

impl QuotaGovernor {
    #[must_use]
    pub fn new(provider: Box<dyn QuotaProvider>, settings: QuotaSettings) -> Self {
        Self {
            provider,
            settings,
            last_reset: HashMap::new(),
        }
    }

    /// Fetch quota state and block as long as the policy requires.
    ///
    /// A failed fetch fails open: quota introspection must never stall the
    /// daemon on its own.
    pub async fn check_and_wait(&mut self) -> QuotaCheck {
        let snapshots = match self.provider.snapshots().await {
            Ok(snapshots) => self.enforce_monotonic_reset(snapshots),
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Quota check failed, proceeding without pacing");
                Vec::new()
            }
        };

        let decision = decide(&snapshots, &self.settings, Utc::now());
        match &decision {
            PacingDecision::Proceed => {
                debug!(categories = snapshots.len(), "Quota healthy");
            }
            PacingDecision::Pace {
                category,
                remaining,
                delay,
            } => {
                info!(
                    category = %category,
                    remaining,
                    delay_secs = delay.as_secs_f64(),
                    "Quota low, pacing request"
                );
                tokio::time::sleep(*delay).await;
            }
            PacingDecision::WaitForReset {
                category,
                reset_at,
                delay,
            } => {
                warn!(
                    category = %category,
                    reset_at = %reset_at.to_rfc3339(),
                    wait_mins = delay.as_secs_f64() / 60.0,
                    "Quota exhausted, waiting for reset"
                );
                tokio::time::sleep(*delay).await;
                info!(category = %category, "Quota wait finished");
            }
        }

        QuotaCheck {
            proceed: true,
            decision,
        }
    }

    fn enforce_monotonic_reset(&mut self, snapshots: Vec<QuotaSnapshot>) -> Vec<QuotaSnapshot> {
        snapshots
            .into_iter()
            .map(|mut snap| {
                let seen = self
                    .last_reset
                    .entry(snap.category.clone())
                    .or_insert(snap.reset_at);
                if snap.reset_at < *seen {
                    debug!(
                        category = %snap.category,
                        reported = %snap.reset_at.to_rfc3339(),
                        kept = %seen.to_rfc3339(),
                        "Ignoring reset time that moved backwards"
                    );
                    snap.reset_at = *seen;
                } else {
                    *seen = snap.reset_at;
                }
                snap
            })
            .collect()
    }
}

/// The binding category: fewest remaining, earlier reset on ties.
#[must_use]
pub fn binding(snapshots: &[QuotaSnapshot]) -> Option<&QuotaSnapshot> {
    snapshots
        .iter()
        .min_by(|a, b| (a.remaining, a.reset_at).cmp(&(b.remaining, b.reset_at)))
}

/// Pacing policy, evaluated at `now`.
#[must_use]
pub fn decide(
    snapshots: &[QuotaSnapshot],
    settings: &QuotaSettings,
    now: DateTime<Utc>,
) -> PacingDecision {
    let Some(snap) = binding(snapshots) else {
        return PacingDecision::Proceed;
    };

    let until_reset = (snap.reset_at - now).to_std().unwrap_or(Duration::ZERO);

    if snap.remaining == 0 {
        return PacingDecision::WaitForReset {
            category: snap.category.clone(),
            reset_at: snap.reset_at,
            delay: until_reset + Duration::from_secs(settings.safety_margin_secs),
        };
    }

    if snap.remaining < settings.low_water_mark && !until_reset.is_zero() {
        let per_request = until_reset / u32::try_from(snap.remaining).unwrap_or(u32::MAX);
        return PacingDecision::Pace {
            category: snap.category.clone(),
            remaining: snap.remaining,
            delay: per_request,
        };
    }

    PacingDecision::Proceed
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn settings() -> QuotaSettings {
        QuotaSettings {
            low_water_mark: 50,
            safety_margin_secs: 60,
        }
    }

    fn snap(category: &str, remaining: u64, reset_in_secs: i64, now: DateTime<Utc>) -> QuotaSnapshot {
        QuotaSnapshot::new(
            category,
            remaining,
            5000,
            now + ChronoDuration::seconds(reset_in_secs),
        )
    }

    #[test]
    fn test_snapshot_clamps_remaining() {
        let s = QuotaSnapshot::new("core", 7000, 5000, Utc::now());
        assert_eq!(s.remaining, 5000);
    }

    #[test]
    fn test_binding_is_smallest_remaining() {
        let now = Utc::now();
        let snaps = vec![snap("core", 4000, 600, now), snap("graphql", 30, 900, now)];
        assert_eq!(binding(&snaps).unwrap().category, "graphql");
    }

    #[test]
    fn test_binding_tie_prefers_earlier_reset() {
        let now = Utc::now();
        let snaps = vec![snap("core", 0, 900, now), snap("graphql", 0, 300, now)];
        assert_eq!(binding(&snaps).unwrap().category, "graphql");
    }

    #[test]
    fn test_healthy_quota_proceeds() {
        let now = Utc::now();
        let snaps = vec![snap("core", 4999, 3600, now), snap("graphql", 4000, 3600, now)];
        assert_eq!(decide(&snaps, &settings(), now), PacingDecision::Proceed);
    }

    #[test]
    fn test_no_snapshots_proceeds() {
        assert_eq!(decide(&[], &settings(), Utc::now()), PacingDecision::Proceed);
    }

    #[test]
    fn test_low_quota_spreads_requests() {
        let now = Utc::now();
        let snaps = vec![snap("core", 10, 600, now)];
        match decide(&snaps, &settings(), now) {
            PacingDecision::Pace { delay, remaining, .. } => {
                assert_eq!(remaining, 10);
                assert_eq!(delay, Duration::from_secs(60));
            }
            other => panic!("expected pacing, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_quota_waits_for_reset_plus_margin() {
        let now = Utc::now();
        let snaps = vec![snap("core", 0, 300, now), snap("graphql", 4000, 100, now)];
        match decide(&snaps, &settings(), now) {
            PacingDecision::WaitForReset { category, delay, .. } => {
                assert_eq!(category, "core");
                assert_eq!(delay, Duration::from_secs(360));
            }
            other => panic!("expected hard wait, got {other:?}"),
        }
    }

    #[test]
    fn test_exhausted_with_past_reset_waits_margin_only() {
        let now = Utc::now();
        let snaps = vec![snap("core", 0, -30, now)];
        assert_eq!(
            decide(&snaps, &settings(), now).delay(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_and_wait_returns_immediately_when_healthy() {
        let mut provider = MockQuotaProvider::new();
        provider
            .expect_snapshots()
            .returning(|| Ok(vec![QuotaSnapshot::new("core", 4999, 5000, Utc::now())]));
        let mut governor = QuotaGovernor::new(Box::new(provider), settings());

        let start = tokio::time::Instant::now();
        let check = governor.check_and_wait().await;
        assert!(check.proceed);
        assert_eq!(check.decision, PacingDecision::Proceed);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_and_wait_fails_open() {
        let mut provider = MockQuotaProvider::new();
        provider
            .expect_snapshots()
            .returning(|| Err(anyhow::anyhow!("gh: not logged in")));
        let mut governor = QuotaGovernor::new(Box::new(provider), settings());

        let check = governor.check_and_wait().await;
        assert!(check.proceed);
        assert_eq!(check.decision, PacingDecision::Proceed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_time_never_moves_backwards() {
        let base = Utc::now() + ChronoDuration::minutes(10);
        let mut provider = MockQuotaProvider::new();
        let mut calls = 0;
        provider.expect_snapshots().times(2).returning(move || {
            calls += 1;
            let reset = if calls == 1 {
                base
            } else {
                base - ChronoDuration::minutes(5)
            };
            Ok(vec![QuotaSnapshot::new("core", 0, 5000, reset)])
        });
        let mut governor = QuotaGovernor::new(Box::new(provider), settings());

        governor.check_and_wait().await;
        let second = governor.check_and_wait().await;
        match second.decision {
            PacingDecision::WaitForReset { reset_at, .. } => assert_eq!(reset_at, base),
            other => panic!("expected hard wait, got {other:?}"),
        }
    }
}
