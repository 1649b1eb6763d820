//! Test suite discovery and execution for fix verification.

use anyhow::Result;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::exec;

/// A test command, run without a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl TestCommand {
    fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

impl fmt::Display for TestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Build-file markers, checked in order.
const MARKERS: &[(&str, &str, &[&str])] = &[
    ("package.json", "npm", &["test"]),
    ("Makefile", "make", &["test"]),
    ("setup.py", "python", &["-m", "pytest"]),
    ("pyproject.toml", "pytest", &[]),
    ("Cargo.toml", "cargo", &["test"]),
    ("go.mod", "go", &["test", "./..."]),
];

/// Pick the test command for a checkout, if the project has one.
///
/// `package.json` only counts when it defines a `test` script.
#[must_use]
pub fn discover_test_command(repo: &Path) -> Option<TestCommand> {
    for (marker, program, args) in MARKERS {
        let path = repo.join(marker);
        if !path.exists() {
            continue;
        }
        if *marker == "package.json" && !has_npm_test_script(&path) {
            continue;
        }
        return Some(TestCommand::new(program, args));
    }

    if repo.join("tests").is_dir() {
        return Some(TestCommand::new("pytest", &["tests/"]));
    }
    if repo.join("test").is_dir() {
        return Some(TestCommand::new(
            "python",
            &["-m", "unittest", "discover", "test/"],
        ));
    }
    None
}

fn has_npm_test_script(path: &Path) -> bool {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| serde_json::from_str::<serde_json::Value>(&content).ok())
        .is_some_and(|pkg| pkg["scripts"]["test"].is_string())
}

/// Command from a configured argv; empty means "discover".
#[must_use]
pub fn configured_command(argv: &[String]) -> Option<TestCommand> {
    let (program, args) = argv.split_first()?;
    Some(TestCommand {
        program: program.clone(),
        args: args.to_vec(),
    })
}

/// Run the project's tests. A project without tests passes.
///
/// `configured` (from `fixer.test_command`) takes precedence over discovery.
pub async fn run_tests(repo: &Path, configured: &[String]) -> Result<bool> {
    let Some(command) = configured_command(configured).or_else(|| discover_test_command(repo))
    else {
        info!(repo = %repo.display(), "No test command found, skipping verification");
        return Ok(true);
    };

    info!(repo = %repo.display(), command = %command, "Running tests");
    let output = exec::run(&command.program, &command.args, Some(repo)).await?;
    if output.success {
        debug!(command = %command, "Tests passed");
    } else {
        warn!(
            command = %command,
            code = ?output.code,
            stderr = %output.stderr_tail(1000),
            "Tests failed"
        );
    }
    Ok(output.success)
}
