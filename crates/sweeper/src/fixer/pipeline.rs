//! Default fixer: refresh, generate, verify, commit, push, close.

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use super::prompt::PromptRenderer;
use super::{git, reason, verify, FixReport, Fixer};
use crate::config::FixerSettings;
use crate::exec;
use crate::source::{Repository, WorkItem};

/// Locate the fix-generation executable.
///
/// Looks on `PATH` first, then in the per-user install location
/// `~/.claude/local/<command>` used by the Claude CLI installer.
#[must_use]
pub fn resolve_command(command: &str) -> Option<PathBuf> {
    if let Ok(path) = which::which(command) {
        return Some(path);
    }
    let home = std::env::var_os("HOME")?;
    let local = PathBuf::from(home).join(".claude").join("local").join(command);
    local.is_file().then_some(local)
}

/// Runs the configured fix-generation tool inside the repository and lands
/// the result on the default branch.
pub struct PipelineFixer {
    settings: FixerSettings,
    executable: String,
    prompt: PromptRenderer,
}

impl PipelineFixer {
    pub fn new(settings: FixerSettings) -> Result<Self> {
        let prompt = PromptRenderer::new(&settings.prompt)?;
        let executable = resolve_command(&settings.command).map_or_else(
            || settings.command.clone(),
            |path| path.to_string_lossy().into_owned(),
        );
        Ok(Self {
            settings,
            executable,
            prompt,
        })
    }

    /// Resolved program path (or the bare command if it was not found).
    #[must_use]
    pub fn executable(&self) -> &str {
        &self.executable
    }

    /// Full argument vector for one item: configured args, then the prompt.
    pub fn command_args(&self, item: &WorkItem) -> Result<Vec<String>> {
        let mut args = self.settings.args.clone();
        args.push(self.prompt.render(item)?);
        Ok(args)
    }

    #[must_use]
    pub fn commit_message(item: &WorkItem) -> String {
        format!("Fix issue #{} (automated by sweeper)", item.id)
    }

    async fn close_issue(repository: &Repository, item: &WorkItem) {
        let number = item.id.to_string();
        let args = [
            "issue",
            "close",
            number.as_str(),
            "--comment",
            "Resolved automatically by sweeper.",
        ];
        match exec::run("gh", args, Some(&repository.path)).await {
            Ok(out) if out.success => info!(item = %item.key(), "Issue closed"),
            Ok(out) => {
                warn!(item = %item.key(), stderr = %out.stderr_tail(300), "Failed to close issue");
            }
            Err(e) => warn!(item = %item.key(), error = %e, "Failed to close issue"),
        }
    }

    /// Everything after `base` was recorded. Explicit failures reset to
    /// `base` themselves; an `Err` is reset by the caller.
    async fn attempt(
        &self,
        repository: &Repository,
        item: &WorkItem,
        base: &str,
    ) -> Result<FixReport> {
        let repo = repository.path.as_path();

        let args = self.command_args(item)?;
        if let Some(prompt) = args.last() {
            debug!(item = %item.key(), prompt = %exec::tail(prompt, 200), "Rendered prompt");
        }
        info!(
            item = %item.key(),
            program = %self.settings.command,
            arg_count = args.len(),
            "Running fixer"
        );
        let output = exec::run(&self.executable, &args, Some(repo)).await?;
        if !output.success {
            warn!(
                item = %item.key(),
                code = ?output.code,
                stderr = %output.stderr_tail(500),
                "Fixer exited with an error"
            );
            git::reset_to(repo, base).await;
            return Ok(FixReport::failed(reason::FIXER_FAILED));
        }

        // The tool may have committed on its own.
        let dirty = git::has_changes(repo).await?;
        let committed = git::head(repo).await? != base;
        if !dirty && !committed {
            info!(item = %item.key(), "Fixer made no changes");
            return Ok(FixReport::skipped(reason::NO_CHANGES));
        }

        if self.settings.run_tests
            && !verify::run_tests(repo, &self.settings.test_command).await?
        {
            git::reset_to(repo, base).await;
            return Ok(FixReport::failed(reason::TESTS_FAILED));
        }

        if dirty {
            if let Err(e) = git::commit_all(repo, &Self::commit_message(item)).await {
                warn!(item = %item.key(), error = %format!("{e:#}"), "Commit failed");
                git::reset_to(repo, base).await;
                return Ok(FixReport::failed(reason::COMMIT_FAILED));
            }
        }

        if let Err(e) = git::push(repo).await {
            warn!(item = %item.key(), error = %format!("{e:#}"), "Push failed");
            git::reset_to(repo, base).await;
            return Ok(FixReport::failed(reason::PUSH_FAILED));
        }
        info!(item = %item.key(), "Fix pushed");

        if self.settings.close_issue {
            Self::close_issue(repository, item).await;
        }
        Ok(FixReport::succeeded(reason::FIXED))
    }
}

#[async_trait]
impl Fixer for PipelineFixer {
    async fn apply(&self, repository: &Repository, item: &WorkItem) -> Result<FixReport> {
        let repo = repository.path.as_path();

        if let Err(e) = git::refresh(repo).await {
            warn!(repo = %repository.name, error = %format!("{e:#}"), "Refresh failed");
            return Ok(FixReport::failed(reason::REFRESH_FAILED));
        }
        let base = git::head(repo).await?;

        match self.attempt(repository, item, &base).await {
            Ok(report) => Ok(report),
            Err(e) => {
                warn!(item = %item.key(), error = %format!("{e:#}"), "Fix attempt aborted");
                git::reset_to(repo, &base).await;
                Ok(FixReport::failed(reason::ERROR))
            }
        }
    }
}
