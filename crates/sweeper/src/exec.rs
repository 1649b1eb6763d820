//! Subprocess helpers shared by the `gh`, `git` and fixer collaborators.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Last `max` characters of stderr, for log lines and failure reasons.
    #[must_use]
    pub fn stderr_tail(&self, max: usize) -> String {
        tail(self.stderr.trim(), max)
    }
}

/// Run `program` with `args`, optionally inside `cwd`, capturing output.
///
/// A non-zero exit is reported through [`CommandOutput::success`]; only a
/// failure to spawn the process is an error. The child is killed if the
/// returned future is dropped.
pub async fn run<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    debug!(program, cwd = ?cwd, "Running command");

    let output = cmd
        .output()
        .await
        .with_context(|| format!("Failed to execute {program}"))?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Like [`run`], but a non-zero exit becomes an error carrying stderr.
pub async fn run_checked<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run(program, args, cwd).await?;
    if !output.success {
        anyhow::bail!(
            "{program} exited with {}: {}",
            output.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            output.stderr_tail(500)
        );
    }
    Ok(output.stdout)
}

/// Keep at most the last `max` characters of `text`.
#[must_use]
pub fn tail(text: &str, max: usize) -> String {
    let count = text.chars().count();
    if count <= max {
        text.to_string()
    } else {
        let skipped: String = text.chars().skip(count - max).collect();
        format!("...{skipped}")
    }
}
