//! Preflight checks and the `doctor` diagnostics report.

use chrono::Utc;
use colored::Colorize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::Config;
use crate::error::{SweeperError, SweeperResult};
use crate::exec;
use crate::fixer::pipeline::resolve_command;
use crate::quota::github::{GhRateLimit, TRACKED_CATEGORIES};
use crate::quota::{decide, PacingDecision, QuotaSnapshot};

/// Tools every run needs besides the fixer command.
const BASE_TOOLS: &[&str] = &["gh", "git"];

/// One external tool and where it was found.
#[derive(Debug, Clone)]
pub struct ToolCheck {
    pub name: String,
    pub path: Option<PathBuf>,
}

/// Locate `gh`, `git` and the configured fixer command.
#[must_use]
pub fn check_tools(config: &Config) -> Vec<ToolCheck> {
    let mut checks: Vec<ToolCheck> = BASE_TOOLS
        .iter()
        .map(|tool| ToolCheck {
            name: (*tool).to_string(),
            path: which::which(tool).ok(),
        })
        .collect();
    checks.push(ToolCheck {
        name: config.fixer.command.clone(),
        path: resolve_command(&config.fixer.command),
    });
    checks
}

/// Fail with [`SweeperError::MissingDependency`] if any required tool is absent.
pub fn preflight(config: &Config) -> SweeperResult<()> {
    let missing: Vec<String> = check_tools(config)
        .into_iter()
        .filter(|check| check.path.is_none())
        .map(|check| check.name)
        .collect();
    if missing.is_empty() {
        debug!("All required tools found");
        Ok(())
    } else {
        Err(SweeperError::MissingDependency(missing.join(", ")))
    }
}

async fn tool_version(path: &Path) -> Option<String> {
    let out = exec::run(&path.to_string_lossy(), ["--version"], None)
        .await
        .ok()?;
    out.stdout.lines().next().map(|line| line.trim().to_string())
}

fn print_check(name: &str, passed: bool, detail: &str) {
    let status = if passed { "✓".green() } else { "✗".red() };
    println!("  {status} {name} {}", detail.bright_black());
}

/// Print the full diagnostics report.
///
/// Missing tools are reported and returned as an error; quota problems never
/// fail the report.
pub async fn report(config: &Config) -> SweeperResult<()> {
    println!("{}", "Tools".bold());
    let checks = check_tools(config);
    for check in &checks {
        match &check.path {
            Some(path) => {
                let version = tool_version(path).await.unwrap_or_default();
                print_check(&check.name, true, &format!("{} {version}", path.display()));
            }
            None => print_check(&check.name, false, "not found on PATH"),
        }
    }

    println!();
    println!("{}", "Configuration".bold());
    println!("  repos_directory: {}", config.repos_directory.display());
    println!("  lock_path:       {}", config.lock_path.display());
    println!("  marker_store:    {:?}", config.marker_store);
    println!(
        "  cooldown:        {} min, sleep {} min, fixer timeout {} min",
        config.cooldown_minutes, config.sleep_time, config.fixer_timeout_mins
    );

    if which::which("gh").is_ok() {
        println!();
        println!("{}", "GitHub".bold());
        match exec::run("gh", ["auth", "status"], None).await {
            Ok(out) if out.success => print_check("gh auth", true, "authenticated"),
            Ok(out) => print_check("gh auth", false, &out.stderr_tail(200)),
            Err(e) => print_check("gh auth", false, &e.to_string()),
        }

        match GhRateLimit::default().fetch_all().await {
            Ok(snapshots) => print_quota(&snapshots, config),
            Err(e) => println!("  {} {}", "⚠".yellow(), format!("quota unavailable: {e:#}").yellow()),
        }
    }

    let missing: Vec<&str> = checks
        .iter()
        .filter(|c| c.path.is_none())
        .map(|c| c.name.as_str())
        .collect();
    if missing.is_empty() {
        println!();
        println!("{}", "All checks passed".green());
        Ok(())
    } else {
        Err(SweeperError::MissingDependency(missing.join(", ")))
    }
}

fn print_quota(snapshots: &[QuotaSnapshot], config: &Config) {
    let now = Utc::now();
    for snap in snapshots {
        let mins = (snap.reset_at - now).num_minutes().max(0);
        let line = format!(
            "{:<10} {:>6}/{:<6} resets in {mins} min",
            snap.category, snap.remaining, snap.limit
        );
        if TRACKED_CATEGORIES.contains(&snap.category.as_str()) {
            println!("  {line}");
        } else {
            println!("  {}", line.bright_black());
        }
    }

    let tracked: Vec<QuotaSnapshot> = snapshots
        .iter()
        .filter(|s| TRACKED_CATEGORIES.contains(&s.category.as_str()))
        .cloned()
        .collect();
    let advice = match decide(&tracked, &config.quota, now) {
        PacingDecision::Proceed => "no pacing needed".green(),
        PacingDecision::Pace {
            category, delay, ..
        } => format!("{category} is low: pacing {:.1}s per request", delay.as_secs_f64()).yellow(),
        PacingDecision::WaitForReset {
            category, delay, ..
        } => format!(
            "{category} is exhausted: next pass waits {:.1} min",
            delay.as_secs_f64() / 60.0
        )
        .red(),
    };
    println!("  recommended: {advice}");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_fixer_command_reported() {
        let mut config = Config::default();
        config.fixer.command = "definitely-not-installed-fixer".to_string();

        let checks = check_tools(&config);
        assert_eq!(checks.len(), 3);
        assert_eq!(checks[0].name, "gh");
        assert_eq!(checks[1].name, "git");
        assert!(checks[2].path.is_none());

        match preflight(&config) {
            Err(SweeperError::MissingDependency(names)) => {
                assert!(names.contains("definitely-not-installed-fixer"));
            }
            other => panic!("expected missing dependency, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_dependency_exit_code() {
        let mut config = Config::default();
        config.fixer.command = "definitely-not-installed-fixer".to_string();
        let err = preflight(&config).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }
}
