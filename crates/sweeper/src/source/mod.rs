//! Work items and the collaborator that enumerates them.

pub mod github;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

pub use github::GhIssueSource;

/// A candidate repository on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    /// Identifier (directory name)
    pub name: String,
    /// Working copy location
    pub path: PathBuf,
}

impl Repository {
    #[must_use]
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

/// Unique identity of a work item: `(repository, id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ItemKey {
    pub repository: String,
    pub id: u64,
}

impl fmt::Display for ItemKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.repository, self.id)
    }
}

/// One open issue in one repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub repository: String,
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
}

impl WorkItem {
    #[must_use]
    pub fn new(repository: impl Into<String>, id: u64, title: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            id,
            title: title.into(),
            labels: BTreeSet::new(),
        }
    }

    /// Builder-style label addition, mostly for tests and fakes.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }

    #[must_use]
    pub fn key(&self) -> ItemKey {
        ItemKey {
            repository: self.repository.clone(),
            id: self.id,
        }
    }

    /// Label match, ignoring ASCII case like GitHub does.
    #[must_use]
    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l.eq_ignore_ascii_case(label))
    }
}

/// Enumerates repositories and their candidate items.
///
/// Implementations must already drop items carrying the configured skip
/// label, and listing must be a side-effect-free read.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ItemSource: Send + Sync {
    /// Valid repositories under the configured root.
    async fn repositories(&self) -> Result<Vec<Repository>>;

    /// Open work items of one repository.
    async fn list(&self, repository: &Repository) -> Result<Vec<WorkItem>>;
}
