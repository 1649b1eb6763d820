//! GitHub rate limits via `gh api rate_limit`.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use tracing::debug;

use super::{QuotaProvider, QuotaSnapshot};
use crate::exec;

/// Categories that gate the daemon: REST for comments/closing, GraphQL for
/// `gh issue list`.
pub const TRACKED_CATEGORIES: &[&str] = &["core", "graphql"];

#[derive(Debug, Deserialize)]
struct RateLimitResponse {
    resources: BTreeMap<String, RateLimitResource>,
}

#[derive(Debug, Deserialize)]
struct RateLimitResource {
    limit: u64,
    remaining: u64,
    /// Epoch seconds
    reset: i64,
}

/// Quota provider backed by the `gh` CLI.
#[derive(Debug, Clone)]
pub struct GhRateLimit {
    categories: Vec<String>,
}

impl Default for GhRateLimit {
    fn default() -> Self {
        Self {
            categories: TRACKED_CATEGORIES.iter().map(|c| (*c).to_string()).collect(),
        }
    }
}

impl GhRateLimit {
    /// Provider tracking a custom category set.
    #[must_use]
    pub fn with_categories(categories: Vec<String>) -> Self {
        Self { categories }
    }

    /// Snapshots for every category GitHub reports, tracked or not.
    pub async fn fetch_all(&self) -> Result<Vec<QuotaSnapshot>> {
        let stdout = exec::run_checked("gh", ["api", "rate_limit"], None)
            .await
            .context("Failed to query GitHub rate limits")?;
        parse_rate_limit(&stdout)
    }
}

#[async_trait]
impl QuotaProvider for GhRateLimit {
    async fn snapshots(&self) -> Result<Vec<QuotaSnapshot>> {
        let all = self.fetch_all().await?;
        let tracked: Vec<_> = all
            .into_iter()
            .filter(|s| self.categories.iter().any(|c| c == &s.category))
            .collect();
        if tracked.len() < self.categories.len() {
            debug!(
                found = tracked.len(),
                expected = self.categories.len(),
                "Some quota categories missing from rate_limit response"
            );
        }
        Ok(tracked)
    }
}

/// Parse the `rate_limit` endpoint body into snapshots, ordered by category.
pub fn parse_rate_limit(json: &str) -> Result<Vec<QuotaSnapshot>> {
    let response: RateLimitResponse =
        serde_json::from_str(json).context("Failed to parse rate_limit response")?;

    response
        .resources
        .into_iter()
        .map(|(category, r)| {
            let reset_at = DateTime::<Utc>::from_timestamp(r.reset, 0)
                .with_context(|| format!("Invalid reset timestamp for {category}: {}", r.reset))?;
            Ok(QuotaSnapshot::new(category, r.remaining, r.limit, reset_at))
        })
        .collect()
}
