//! The fixer collaborator: given an issue, try to produce and land a fix.

pub mod git;
pub mod pipeline;
pub mod prompt;
pub mod verify;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use crate::source::{Repository, WorkItem};
use crate::tracker::AttemptOutcome;

pub use pipeline::PipelineFixer;

/// Reason codes reported alongside an outcome.
pub mod reason {
    pub const FIXED: &str = "fixed";
    pub const NO_CHANGES: &str = "no_changes";
    pub const REFRESH_FAILED: &str = "refresh_failed";
    pub const FIXER_FAILED: &str = "fixer_failed";
    pub const TESTS_FAILED: &str = "tests_failed";
    pub const COMMIT_FAILED: &str = "commit_failed";
    pub const PUSH_FAILED: &str = "push_failed";
    pub const TIMEOUT: &str = "timeout";
    pub const ERROR: &str = "error";
}

/// What a fixer reports back for one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FixReport {
    pub outcome: AttemptOutcome,
    pub reason: String,
}

impl FixReport {
    #[must_use]
    pub fn succeeded(reason: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Succeeded,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Failed,
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            outcome: AttemptOutcome::Skipped,
            reason: reason.into(),
        }
    }
}

/// Attempts a fix for one work item.
///
/// Implementations may take a long time; the caller bounds the call with a
/// timeout and treats an `Err` like a failed attempt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Fixer: Send + Sync {
    async fn apply(&self, repository: &Repository, item: &WorkItem) -> Result<FixReport>;
}
