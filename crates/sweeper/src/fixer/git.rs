//! Git operations on a repository checkout.

use anyhow::{Context, Result};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::exec;

/// Branches tried, in order, as the integration branch.
const DEFAULT_BRANCHES: &[&str] = &["main", "master"];

/// Stash local edits, switch to the default branch, drop any local commits
/// the upstream does not have, and pull.
pub async fn refresh(repo: &Path) -> Result<()> {
    info!(repo = %repo.display(), "Refreshing repository");

    let stash = exec::run("git", ["stash"], Some(repo)).await?;
    if !stash.success {
        debug!(stderr = %stash.stderr_tail(200), "git stash reported an error");
    }

    let mut checked_out = false;
    for branch in DEFAULT_BRANCHES {
        if exec::run("git", ["checkout", *branch], Some(repo)).await?.success {
            checked_out = true;
            break;
        }
    }
    if !checked_out {
        anyhow::bail!("Neither main nor master could be checked out");
    }

    // Leftovers of an interrupted attempt must not ride along with the next push
    let sync = exec::run("git", ["reset", "--hard", "@{u}"], Some(repo)).await?;
    if !sync.success {
        warn!(
            repo = %repo.display(),
            stderr = %sync.stderr_tail(200),
            "Could not reset to upstream"
        );
    }

    exec::run_checked("git", ["pull"], Some(repo))
        .await
        .context("git pull failed")?;
    Ok(())
}

/// Whether the working tree has uncommitted changes (including untracked files).
pub async fn has_changes(repo: &Path) -> Result<bool> {
    let status = exec::run_checked("git", ["status", "--porcelain"], Some(repo)).await?;
    Ok(!status.trim().is_empty())
}

/// Current `HEAD` commit id.
pub async fn head(repo: &Path) -> Result<String> {
    let out = exec::run_checked("git", ["rev-parse", "HEAD"], Some(repo)).await?;
    Ok(out.trim().to_string())
}

/// Hard-reset to `rev` and drop untracked files, discarding any commits or
/// edits made since.
pub async fn reset_to(repo: &Path, rev: &str) {
    for args in [&["reset", "--hard", rev][..], &["clean", "-fd"][..]] {
        match exec::run("git", args, Some(repo)).await {
            Ok(out) if out.success => {}
            Ok(out) => warn!(repo = %repo.display(), stderr = %out.stderr_tail(200), "Reset step failed"),
            Err(e) => warn!(repo = %repo.display(), error = %e, "Reset step failed"),
        }
    }
}

/// Stage everything and commit.
pub async fn commit_all(repo: &Path, message: &str) -> Result<()> {
    exec::run_checked("git", ["add", "-A"], Some(repo))
        .await
        .context("git add failed")?;
    exec::run_checked("git", ["commit", "-m", message], Some(repo))
        .await
        .context("git commit failed")?;
    Ok(())
}

pub async fn push(repo: &Path) -> Result<()> {
    exec::run_checked("git", ["push"], Some(repo))
        .await
        .context("git push failed")?;
    Ok(())
}
