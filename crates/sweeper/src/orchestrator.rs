//! The scan, dispatch and sleep loop.
//!
//! A pass walks every repository in order. For each one the quota governor
//! is consulted first, then the item source is listed and every surviving
//! item is dispatched to the fixer one at a time. Pass results drive the loop:
//! `progressed` starts the next pass immediately, `idle` and `exhausted` sleep
//! once and end the run so an external scheduler can restart the process.

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::fixer::{reason, FixReport, Fixer};
use crate::quota::QuotaGovernor;
use crate::source::{ItemSource, Repository, WorkItem};
use crate::tracker::{AttemptOutcome, AttemptTracker};

/// Loop-level result of one pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassOutcome {
    /// No eligible items anywhere
    Idle,
    /// Items exist but none could be dispatched
    Exhausted,
    /// At least one item was dispatched
    Progressed,
}

impl fmt::Display for PassOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::Exhausted => "exhausted",
            Self::Progressed => "progressed",
        })
    }
}

/// Counters collected during one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassReport {
    pub repositories: usize,
    pub repo_errors: usize,
    /// Items returned by the source
    pub seen: usize,
    /// Items dropped for carrying the exclusion label
    pub excluded: usize,
    pub session_skipped: usize,
    pub cooldown_skipped: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl PassReport {
    /// Items that count as existing work (everything not excluded by label).
    #[must_use]
    pub fn eligible(&self) -> usize {
        self.seen.saturating_sub(self.excluded)
    }

    #[must_use]
    pub fn outcome(&self) -> PassOutcome {
        if self.dispatched > 0 {
            PassOutcome::Progressed
        } else if self.eligible() == 0 {
            PassOutcome::Idle
        } else {
            PassOutcome::Exhausted
        }
    }

    fn count(&mut self, report: &FixReport) {
        self.dispatched += 1;
        match report.outcome {
            AttemptOutcome::Succeeded => self.succeeded += 1,
            AttemptOutcome::Failed => self.failed += 1,
            AttemptOutcome::Skipped => self.skipped += 1,
        }
    }
}

/// Totals over a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub passes: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub last_outcome: PassOutcome,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self {
            passes: 0,
            dispatched: 0,
            succeeded: 0,
            failed: 0,
            skipped: 0,
            last_outcome: PassOutcome::Idle,
        }
    }
}

impl RunSummary {
    fn absorb(&mut self, report: &PassReport) {
        self.passes += 1;
        self.dispatched += report.dispatched;
        self.succeeded += report.succeeded;
        self.failed += report.failed;
        self.skipped += report.skipped;
        self.last_outcome = report.outcome();
    }
}

/// Timing and filtering knobs for the loop.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub skip_label: String,
    pub item_delay: Duration,
    pub fixer_timeout: Duration,
    pub sleep: Duration,
}

impl OrchestratorSettings {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            skip_label: config.skip_label.clone(),
            item_delay: config.item_delay(),
            fixer_timeout: config.fixer_timeout(),
            sleep: config.sleep_duration(),
        }
    }
}

pub struct Orchestrator {
    source: Box<dyn ItemSource>,
    governor: QuotaGovernor,
    tracker: AttemptTracker,
    fixer: Box<dyn Fixer>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    #[must_use]
    pub fn new(
        source: Box<dyn ItemSource>,
        governor: QuotaGovernor,
        tracker: AttemptTracker,
        fixer: Box<dyn Fixer>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            source,
            governor,
            tracker,
            fixer,
            settings,
        }
    }

    #[must_use]
    pub fn tracker(&self) -> &AttemptTracker {
        &self.tracker
    }

    /// Run passes until one is not `progressed`, then sleep and return.
    ///
    /// With `once`, a single pass runs and no sleep follows.
    pub async fn run(&mut self, once: bool) -> RunSummary {
        let mut summary = RunSummary::default();
        loop {
            let report = self.run_pass().await;
            summary.absorb(&report);
            let outcome = report.outcome();

            if once {
                info!(outcome = %outcome, "Single pass requested, stopping");
                return summary;
            }
            if outcome == PassOutcome::Progressed {
                debug!("Work dispatched, starting next pass");
                continue;
            }

            info!(
                outcome = %outcome,
                sleep_mins = self.settings.sleep.as_secs() / 60,
                "Nothing dispatchable, sleeping before exit"
            );
            tokio::time::sleep(self.settings.sleep).await;
            return summary;
        }
    }

    /// One full scan over every repository.
    pub async fn run_pass(&mut self) -> PassReport {
        let mut report = PassReport::default();

        let repositories = match self.source.repositories().await {
            Ok(repos) => repos,
            Err(e) => {
                error!(error = %format!("{e:#}"), "Failed to enumerate repositories");
                Vec::new()
            }
        };
        report.repositories = repositories.len();
        info!(repositories = repositories.len(), "Starting pass");

        for repository in &repositories {
            self.scan_repository(repository, &mut report).await;
        }

        info!(
            outcome = %report.outcome(),
            seen = report.seen,
            dispatched = report.dispatched,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            session_skipped = report.session_skipped,
            cooldown_skipped = report.cooldown_skipped,
            repo_errors = report.repo_errors,
            "Pass complete"
        );
        report
    }

    async fn scan_repository(&mut self, repository: &Repository, report: &mut PassReport) {
        self.governor.check_and_wait().await;

        let items = match self.source.list(repository).await {
            Ok(items) => items,
            Err(e) => {
                warn!(repo = %repository.name, error = %format!("{e:#}"), "Failed to list items, skipping repository");
                report.repo_errors += 1;
                return;
            }
        };
        debug!(repo = %repository.name, items = items.len(), "Listed items");
        report.seen += items.len();

        for item in &items {
            if item.has_label(&self.settings.skip_label) {
                debug!(item = %item.key(), label = %self.settings.skip_label, "Excluded by label");
                report.excluded += 1;
                continue;
            }
            if self.tracker.is_session_failed(&item.key()) {
                info!(item = %item.key(), "Already failed this run, skipping");
                report.session_skipped += 1;
                continue;
            }
            if self.tracker.is_unmarked(&item.key()) {
                info!(item = %item.key(), "Attempted this run without a marker, skipping");
                report.session_skipped += 1;
                continue;
            }
            if self.tracker.is_in_cooldown(repository, item).await {
                report.cooldown_skipped += 1;
                continue;
            }

            let result = self.dispatch(repository, item).await;
            report.count(&result);
            self.tracker
                .record_outcome(repository, item, result.outcome, &result.reason)
                .await;

            tokio::time::sleep(self.settings.item_delay).await;
        }
    }

    /// Call the fixer under the timeout; errors and timeouts become failures.
    async fn dispatch(&self, repository: &Repository, item: &WorkItem) -> FixReport {
        info!(item = %item.key(), title = %item.title, "Dispatching item");
        let result = tokio::time::timeout(
            self.settings.fixer_timeout,
            self.fixer.apply(repository, item),
        )
        .await;

        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                error!(item = %item.key(), error = %format!("{e:#}"), "Fixer raised an error");
                FixReport::failed(reason::ERROR)
            }
            Err(_) => {
                warn!(
                    item = %item.key(),
                    timeout_mins = self.settings.fixer_timeout.as_secs() / 60,
                    "Fixer timed out"
                );
                FixReport::failed(reason::TIMEOUT)
            }
        };

        match report.outcome {
            AttemptOutcome::Succeeded => info!(item = %item.key(), reason = %report.reason, "Item fixed"),
            AttemptOutcome::Failed => warn!(item = %item.key(), reason = %report.reason, "Item failed"),
            AttemptOutcome::Skipped => info!(item = %item.key(), reason = %report.reason, "Item skipped"),
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuotaSettings;
    use crate::fixer::MockFixer;
    use crate::quota::MockQuotaProvider;
    use crate::source::MockItemSource;
    use crate::tracker::MockMarkerStore;
    use mockall::predicate::always;

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            skip_label: "sweeper:skip".to_string(),
            item_delay: Duration::from_secs(30),
            fixer_timeout: Duration::from_secs(45 * 60),
            sleep: Duration::from_secs(30 * 60),
        }
    }

    fn governor() -> QuotaGovernor {
        let mut provider = MockQuotaProvider::new();
        provider.expect_snapshots().returning(|| Ok(Vec::new()));
        QuotaGovernor::new(Box::new(provider), QuotaSettings::default())
    }

    fn quiet_markers() -> MockMarkerStore {
        let mut store = MockMarkerStore::new();
        store.expect_last_attempt().returning(|_, _| Ok(None));
        store.expect_record_attempt().returning(|_, _| Ok(()));
        store
    }

    fn one_repo_source(items: Vec<WorkItem>) -> MockItemSource {
        let mut source = MockItemSource::new();
        source
            .expect_repositories()
            .returning(|| Ok(vec![Repository::new("api", "/srv/api")]));
        source
            .expect_list()
            .returning(move |_| Ok(items.clone()));
        source
    }

    fn orchestrator(source: MockItemSource, fixer: MockFixer, store: MockMarkerStore) -> Orchestrator {
        Orchestrator::new(
            Box::new(source),
            governor(),
            AttemptTracker::new(Box::new(store), chrono::Duration::hours(1)),
            Box::new(fixer),
            settings(),
        )
    }

    #[test]
    fn test_outcome_classification() {
        assert_eq!(PassReport::default().outcome(), PassOutcome::Idle);

        let excluded_only = PassReport {
            seen: 2,
            excluded: 2,
            ..PassReport::default()
        };
        assert_eq!(excluded_only.outcome(), PassOutcome::Idle);

        let blocked = PassReport {
            seen: 2,
            cooldown_skipped: 2,
            ..PassReport::default()
        };
        assert_eq!(blocked.outcome(), PassOutcome::Exhausted);

        let progressed = PassReport {
            seen: 2,
            dispatched: 1,
            ..PassReport::default()
        };
        assert_eq!(progressed.outcome(), PassOutcome::Progressed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_items_is_idle() {
        let mut fixer = MockFixer::new();
        fixer.expect_apply().never();
        let mut orch = orchestrator(one_repo_source(Vec::new()), fixer, quiet_markers());

        let report = orch.run_pass().await;
        assert_eq!(report.outcome(), PassOutcome::Idle);
        assert_eq!(report.repositories, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_item_not_redispatched_in_same_run() {
        let mut fixer = MockFixer::new();
        fixer
            .expect_apply()
            .with(always(), always())
            .times(1)
            .returning(|_, _| Ok(FixReport::failed(reason::FIXER_FAILED)));
        let items = vec![WorkItem::new("api", 9, "flaky")];
        let mut orch = orchestrator(one_repo_source(items), fixer, quiet_markers());

        let first = orch.run_pass().await;
        assert_eq!(first.outcome(), PassOutcome::Progressed);
        assert_eq!(first.failed, 1);
        assert!(orch.tracker().is_session_failed(&WorkItem::new("api", 9, "").key()));

        let second = orch.run_pass().await;
        assert_eq!(second.outcome(), PassOutcome::Exhausted);
        assert_eq!(second.session_skipped, 1);
        assert_eq!(second.dispatched, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmarked_attempt_not_repeated_in_same_run() {
        let mut fixer = MockFixer::new();
        fixer
            .expect_apply()
            .times(1)
            .returning(|_, _| Ok(FixReport::skipped(reason::NO_CHANGES)));
        let mut store = MockMarkerStore::new();
        store.expect_last_attempt().returning(|_, _| Ok(None));
        store
            .expect_record_attempt()
            .returning(|_, _| Err(anyhow::anyhow!("gh: HTTP 403")));
        let items = vec![WorkItem::new("api", 11, "nothing to do")];
        let mut orch = orchestrator(one_repo_source(items), fixer, store);

        let start = tokio::time::Instant::now();
        let summary = orch.run(false).await;

        assert_eq!(summary.passes, 2);
        assert_eq!(summary.dispatched, 1);
        assert_eq!(summary.last_outcome, PassOutcome::Exhausted);
        assert!(orch.tracker().session_failures().is_empty());
        assert!(start.elapsed() < Duration::from_secs(3600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_labelled_items_never_dispatched() {
        let mut fixer = MockFixer::new();
        fixer.expect_apply().never();
        let items = vec![WorkItem::new("api", 1, "wip").with_label("Sweeper:Skip")];
        let mut orch = orchestrator(one_repo_source(items), fixer, quiet_markers());

        let report = orch.run_pass().await;
        assert_eq!(report.excluded, 1);
        assert_eq!(report.outcome(), PassOutcome::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_skips_dispatch() {
        let mut fixer = MockFixer::new();
        fixer.expect_apply().never();
        let mut store = MockMarkerStore::new();
        store.expect_last_attempt().returning(|_, item| {
            Ok(Some(crate::tracker::AttemptRecord {
                item: item.key(),
                last_attempt_at: chrono::Utc::now() - chrono::Duration::minutes(5),
                outcome: AttemptOutcome::Failed,
                reason: reason::TESTS_FAILED.to_string(),
            }))
        });
        store.expect_record_attempt().never();
        let items = vec![WorkItem::new("api", 4, "slow")];
        let mut orch = orchestrator(one_repo_source(items), fixer, store);

        let report = orch.run_pass().await;
        assert_eq!(report.cooldown_skipped, 1);
        assert_eq!(report.outcome(), PassOutcome::Exhausted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixer_error_recorded_as_failure() {
        let mut fixer = MockFixer::new();
        fixer.expect_apply().returning(|_, item| {
            if item.id == 1 {
                Err(anyhow::anyhow!("boom"))
            } else {
                Ok(FixReport::succeeded(reason::FIXED))
            }
        });
        let items = vec![WorkItem::new("api", 1, "err"), WorkItem::new("api", 2, "ok")];
        let mut orch = orchestrator(one_repo_source(items), fixer, quiet_markers());

        let report = orch.run_pass().await;
        assert_eq!(report.dispatched, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.succeeded, 1);
        assert!(orch.tracker().is_session_failed(&WorkItem::new("api", 1, "").key()));
        assert!(!orch.tracker().is_session_failed(&WorkItem::new("api", 2, "").key()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_listing_error_only_skips_that_repository() {
        let mut source = MockItemSource::new();
        source.expect_repositories().returning(|| {
            Ok(vec![
                Repository::new("broken", "/srv/broken"),
                Repository::new("api", "/srv/api"),
            ])
        });
        source.expect_list().returning(|repo| {
            if repo.name == "broken" {
                Err(anyhow::anyhow!("gh: not authenticated"))
            } else {
                Ok(vec![WorkItem::new("api", 3, "fine")])
            }
        });
        let mut fixer = MockFixer::new();
        fixer
            .expect_apply()
            .times(1)
            .returning(|_, _| Ok(FixReport::succeeded(reason::FIXED)));
        let mut orch = orchestrator(source, fixer, quiet_markers());

        let report = orch.run_pass().await;
        assert_eq!(report.repo_errors, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.outcome(), PassOutcome::Progressed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_sleeps_after_idle_pass() {
        let mut fixer = MockFixer::new();
        fixer.expect_apply().never();
        let mut orch = orchestrator(one_repo_source(Vec::new()), fixer, quiet_markers());

        let start = tokio::time::Instant::now();
        let summary = orch.run(false).await;
        assert_eq!(summary.passes, 1);
        assert_eq!(summary.last_outcome, PassOutcome::Idle);
        assert!(start.elapsed() >= Duration::from_secs(30 * 60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_does_not_sleep() {
        let mut fixer = MockFixer::new();
        fixer.expect_apply().never();
        let mut orch = orchestrator(one_repo_source(Vec::new()), fixer, quiet_markers());

        let start = tokio::time::Instant::now();
        let summary = orch.run(true).await;
        assert_eq!(summary.passes, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
