//! Item source backed by local git checkouts and the `gh` CLI.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::debug;

use super::{ItemSource, Repository, WorkItem};
use crate::exec;

/// Lists repositories under a root directory and their open issues.
#[derive(Debug, Clone)]
pub struct GhIssueSource {
    root: PathBuf,
    skip_label: String,
    limit: u32,
}

#[derive(Debug, Deserialize)]
struct GhIssue {
    number: u64,
    title: String,
    #[serde(default)]
    labels: Vec<GhLabel>,
}

#[derive(Debug, Deserialize)]
struct GhLabel {
    name: String,
}

impl GhIssueSource {
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, skip_label: impl Into<String>, limit: u32) -> Self {
        Self {
            root: root.into(),
            skip_label: skip_label.into(),
            limit,
        }
    }

    /// Parse `gh issue list --json number,title,labels` output, dropping
    /// items that carry the skip label.
    pub fn parse_issues(&self, repository: &str, json: &str) -> Result<Vec<WorkItem>> {
        let issues: Vec<GhIssue> =
            serde_json::from_str(json).context("Failed to parse gh issue list output")?;

        Ok(issues
            .into_iter()
            .map(|issue| WorkItem {
                repository: repository.to_string(),
                id: issue.number,
                title: issue.title,
                labels: issue.labels.into_iter().map(|l| l.name).collect(),
            })
            .filter(|item| {
                let excluded = item.has_label(&self.skip_label);
                if excluded {
                    debug!(item = %item.key(), label = %self.skip_label, "Excluding labelled issue");
                }
                !excluded
            })
            .collect())
    }
}

#[async_trait]
impl ItemSource for GhIssueSource {
    async fn repositories(&self) -> Result<Vec<Repository>> {
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read {}", self.root.display()))?;

        let mut repos = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.is_dir() || !path.join(".git").exists() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            repos.push(Repository::new(name, path));
        }
        repos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(repos)
    }

    async fn list(&self, repository: &Repository) -> Result<Vec<WorkItem>> {
        let limit = self.limit.to_string();
        let stdout = exec::run_checked(
            "gh",
            [
                "issue",
                "list",
                "--state",
                "open",
                "--json",
                "number,title,labels",
                "--limit",
                &limit,
            ],
            Some(&repository.path),
        )
        .await
        .with_context(|| format!("Failed to list issues for {}", repository.name))?;

        self.parse_issues(&repository.name, &stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ISSUES: &str = r#"[
        {"number": 7, "title": "Panic on empty input", "labels": [{"id": "x", "name": "bug", "color": "d73a4a"}]},
        {"number": 9, "title": "Needs design", "labels": [{"name": "Sweeper:Skip"}]},
        {"number": 12, "title": "Typo in README"}
    ]"#;

    #[test]
    fn test_parse_issues_filters_skip_label() {
        let source = GhIssueSource::new(".", "sweeper:skip", 100);
        let items = source.parse_issues("api", ISSUES).unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].id, 7);
        assert_eq!(items[0].repository, "api");
        assert!(items[0].has_label("bug"));
        assert_eq!(items[1].id, 12);
        assert!(items[1].labels.is_empty());
    }

    #[test]
    fn test_parse_issues_rejects_garbage() {
        let source = GhIssueSource::new(".", "sweeper:skip", 100);
        assert!(source.parse_issues("api", "not json").is_err());
    }

    #[tokio::test]
    async fn test_repositories_requires_git_dir() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("beta/.git")).unwrap();
        std::fs::create_dir_all(root.path().join("alpha/.git")).unwrap();
        std::fs::create_dir_all(root.path().join("plain-dir")).unwrap();
        std::fs::write(root.path().join("file.txt"), "x").unwrap();

        let source = GhIssueSource::new(root.path(), "sweeper:skip", 100);
        let repos = source.repositories().await.unwrap();
        let names: Vec<_> = repos.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_repositories_missing_root_is_error() {
        let source = GhIssueSource::new("/no/such/root", "sweeper:skip", 100);
        assert!(source.repositories().await.is_err());
    }
}
