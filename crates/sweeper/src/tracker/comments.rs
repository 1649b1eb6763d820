//! Attempt markers stored as issue comments.
//!
//! Each marker is a comment whose body opens with an HTML comment carrying our
//! tag and a JSON payload, e.g.
//!
//! ```text
//! <!-- sweeper-attempt {"outcome":"failed","at":"2026-01-01T10:00:00Z","reason":"tests_failed"} -->
//! Automated fix attempt: failed (tests_failed)
//! ```
//!
//! The HTML part is invisible on GitHub but lets every instance find the last
//! attempt. Only comments authored by the account `gh` is logged in as, with
//! the exact tag at the start of the body, count as markers. Payloads dated
//! more than [`MAX_CLOCK_SKEW_SECS`] seconds in the future are ignored.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::{AttemptOutcome, AttemptRecord, MarkerStore, MAX_CLOCK_SKEW_SECS};
use crate::exec;
use crate::source::{Repository, WorkItem};

/// Payload embedded in a marker comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkerPayload {
    pub outcome: AttemptOutcome,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct IssueComments {
    #[serde(default)]
    comments: Vec<IssueComment>,
}

#[derive(Debug, Deserialize)]
struct IssueComment {
    #[serde(default)]
    author: Option<CommentAuthor>,
    #[serde(default)]
    body: String,
}

#[derive(Debug, Deserialize)]
struct CommentAuthor {
    #[serde(default)]
    login: String,
}

/// Marker store that reads and writes issue comments through `gh`.
#[derive(Debug, Clone)]
pub struct GhCommentMarkers {
    tag: String,
    login: OnceCell<String>,
}

impl GhCommentMarkers {
    #[must_use]
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            login: OnceCell::new(),
        }
    }

    /// Trust markers from `login` without asking `gh` who we are.
    #[must_use]
    pub fn with_login(tag: impl Into<String>, login: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            login: OnceCell::new_with(Some(login.into())),
        }
    }

    /// Login of the authenticated `gh` account, looked up once.
    async fn login(&self) -> Result<&str> {
        let login = self
            .login
            .get_or_try_init(|| async {
                let stdout = exec::run_checked("gh", ["api", "user", "--jq", ".login"], None)
                    .await
                    .context("Failed to look up the authenticated GitHub user")?;
                let login = stdout.trim().to_string();
                if login.is_empty() {
                    anyhow::bail!("gh api user returned an empty login");
                }
                debug!(login = %login, "Trusting attempt markers from this account");
                Ok::<_, anyhow::Error>(login)
            })
            .await?;
        Ok(login.as_str())
    }

    fn opener(&self) -> String {
        format!("<!-- {} ", self.tag)
    }

    /// Render a comment body for `record`.
    pub fn render(&self, record: &AttemptRecord) -> Result<String> {
        let payload = MarkerPayload {
            outcome: record.outcome,
            at: record.last_attempt_at,
            reason: record.reason.clone(),
        };
        let json = serde_json::to_string(&payload)?;
        let detail = if record.reason.is_empty() {
            String::new()
        } else {
            format!(" ({})", record.reason)
        };
        Ok(format!(
            "{}{json} -->\nAutomated fix attempt: {}{detail}",
            self.opener(),
            record.outcome
        ))
    }

    /// Extract our payload from a comment body, if it is one of our markers.
    #[must_use]
    pub fn parse(&self, body: &str) -> Option<MarkerPayload> {
        let rest = body.trim_start().strip_prefix(&self.opener())?;
        let end = rest.find(" -->")?;
        serde_json::from_str(rest[..end].trim()).ok()
    }

    /// Newest trusted marker among `(author, body)` pairs.
    ///
    /// Comments by anyone but `login` are skipped, as are payloads dated
    /// beyond `now` plus the allowed clock skew.
    #[must_use]
    pub fn newest<'a>(
        &self,
        comments: impl IntoIterator<Item = (&'a str, &'a str)>,
        login: &str,
        now: DateTime<Utc>,
    ) -> Option<MarkerPayload> {
        comments
            .into_iter()
            .filter(|(author, _)| author.eq_ignore_ascii_case(login))
            .filter_map(|(_, body)| self.parse(body))
            .filter(|payload| {
                let trusted = payload.at <= now + chrono::Duration::seconds(MAX_CLOCK_SKEW_SECS);
                if !trusted {
                    warn!(at = %payload.at, "Ignoring attempt marker dated in the future");
                }
                trusted
            })
            .max_by_key(|payload| payload.at)
    }
}

#[async_trait]
impl MarkerStore for GhCommentMarkers {
    async fn last_attempt(
        &self,
        repository: &Repository,
        item: &WorkItem,
    ) -> Result<Option<AttemptRecord>> {
        let id = item.id.to_string();
        let stdout = exec::run_checked(
            "gh",
            ["issue", "view", &id, "--json", "comments"],
            Some(&repository.path),
        )
        .await
        .with_context(|| format!("Failed to read comments of {}", item.key()))?;

        let parsed: IssueComments =
            serde_json::from_str(&stdout).context("Failed to parse issue comments")?;
        let login = self.login().await?;

        let comments = parsed.comments.iter().map(|c| {
            let author = c.author.as_ref().map_or("", |a| a.login.as_str());
            (author, c.body.as_str())
        });
        Ok(self
            .newest(comments, login, Utc::now())
            .map(|payload| AttemptRecord {
                item: item.key(),
                last_attempt_at: payload.at,
                outcome: payload.outcome,
                reason: payload.reason,
            }))
    }

    async fn record_attempt(&self, repository: &Repository, record: &AttemptRecord) -> Result<()> {
        let body = self.render(record)?;
        let id = record.item.id.to_string();
        exec::run_checked(
            "gh",
            ["issue", "comment", &id, "--body", &body],
            Some(&repository.path),
        )
        .await
        .with_context(|| format!("Failed to post attempt marker on {}", record.item))?;
        Ok(())
    }
}
