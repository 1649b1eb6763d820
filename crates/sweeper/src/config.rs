//! Daemon configuration.
//!
//! Loaded from a YAML file (default `sweeper.yaml`). Every key is optional;
//! unknown keys are rejected so that a misspelled option is reported instead
//! of silently falling back to its default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{SweeperError, SweeperResult};
use crate::fixer::prompt::PromptRenderer;

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "sweeper.yaml";

/// Largest accepted `item_delay_secs` (one day).
const MAX_ITEM_DELAY_SECS: u64 = 24 * 60 * 60;

/// Environment variable that overrides the config file path.
pub const CONFIG_ENV: &str = "SWEEPER_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Minutes to sleep after an idle or exhausted pass
    #[serde(default = "default_sleep_time")]
    pub sleep_time: u64,
    /// Root directory containing candidate repositories
    #[serde(default = "default_repos_directory")]
    pub repos_directory: PathBuf,
    /// Cooldown window after an attempt (minutes)
    #[serde(default = "default_cooldown_minutes")]
    pub cooldown_minutes: u64,
    /// Delay between two dispatched items (seconds)
    #[serde(default = "default_item_delay_secs")]
    pub item_delay_secs: u64,
    /// Upper bound for one fixer invocation (minutes)
    #[serde(default = "default_fixer_timeout_mins")]
    pub fixer_timeout_mins: u64,
    /// Issues carrying this label are never dispatched
    #[serde(default = "default_skip_label")]
    pub skip_label: String,
    /// Location of the single-instance lock record
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,
    /// Where durable attempt markers live
    #[serde(default)]
    pub marker_store: MarkerStoreKind,
    /// Path for the `file` marker store
    #[serde(default = "default_marker_file")]
    pub marker_file: PathBuf,
    /// Tag that distinguishes our markers from other actors'
    #[serde(default = "default_marker_tag")]
    pub marker_tag: String,
    /// Maximum issues listed per repository
    #[serde(default = "default_issue_limit")]
    pub issue_limit: u32,
    /// Remote quota pacing
    #[serde(default)]
    pub quota: QuotaSettings,
    /// Fix pipeline
    #[serde(default)]
    pub fixer: FixerSettings,
}

/// Backend for durable attempt markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkerStoreKind {
    /// Marker comments on the issue itself, visible to every instance
    #[default]
    Comments,
    /// Local JSON file
    File,
}

/// Quota governor thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuotaSettings {
    /// Below this many remaining requests the governor starts pacing
    #[serde(default = "default_low_water_mark")]
    pub low_water_mark: u64,
    /// Added to every hard wait on an exhausted quota (seconds)
    #[serde(default = "default_safety_margin_secs")]
    pub safety_margin_secs: u64,
}

/// Settings for the default fix pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FixerSettings {
    /// Fix-generation executable
    #[serde(default = "default_fixer_command")]
    pub command: String,
    /// Arguments placed before the rendered prompt
    #[serde(default = "default_fixer_args")]
    pub args: Vec<String>,
    /// Handlebars prompt template (`number`, `title`, `repository`)
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Run the project's test suite before committing
    #[serde(default = "default_true")]
    pub run_tests: bool,
    /// Explicit test command (program then args); empty means discover it
    #[serde(default)]
    pub test_command: Vec<String>,
    /// Close the issue once the fix is pushed
    #[serde(default = "default_true")]
    pub close_issue: bool,
}

fn default_sleep_time() -> u64 {
    30
}
fn default_repos_directory() -> PathBuf {
    PathBuf::from(".")
}
fn default_cooldown_minutes() -> u64 {
    60
}
fn default_item_delay_secs() -> u64 {
    30
}
fn default_fixer_timeout_mins() -> u64 {
    45
}
fn default_skip_label() -> String {
    "sweeper:skip".to_string()
}
fn default_lock_path() -> PathBuf {
    PathBuf::from("sweeper.lock")
}
fn default_marker_file() -> PathBuf {
    PathBuf::from(".sweeper/attempts.json")
}
fn default_marker_tag() -> String {
    "sweeper-attempt".to_string()
}
fn default_issue_limit() -> u32 {
    100
}
fn default_low_water_mark() -> u64 {
    50
}
fn default_safety_margin_secs() -> u64 {
    60
}
fn default_fixer_command() -> String {
    "claude".to_string()
}
fn default_fixer_args() -> Vec<String> {
    vec![
        "--dangerously-skip-permissions".to_string(),
        "-p".to_string(),
    ]
}
fn default_prompt() -> String {
    "Please fix GitHub issue #{{number}}: {{title}}. Run any necessary tests to verify your fix."
        .to_string()
}
fn default_true() -> bool {
    true
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self {
            low_water_mark: default_low_water_mark(),
            safety_margin_secs: default_safety_margin_secs(),
        }
    }
}

impl Default for FixerSettings {
    fn default() -> Self {
        Self {
            command: default_fixer_command(),
            args: default_fixer_args(),
            prompt: default_prompt(),
            run_tests: true,
            test_command: Vec::new(),
            close_issue: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sleep_time: default_sleep_time(),
            repos_directory: default_repos_directory(),
            cooldown_minutes: default_cooldown_minutes(),
            item_delay_secs: default_item_delay_secs(),
            fixer_timeout_mins: default_fixer_timeout_mins(),
            skip_label: default_skip_label(),
            lock_path: default_lock_path(),
            marker_store: MarkerStoreKind::default(),
            marker_file: default_marker_file(),
            marker_tag: default_marker_tag(),
            issue_limit: default_issue_limit(),
            quota: QuotaSettings::default(),
            fixer: FixerSettings::default(),
        }
    }
}

impl Config {
    /// Read, parse and validate the configuration file.
    pub fn load(path: &Path) -> SweeperResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SweeperError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        let config = Self::from_yaml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse YAML text. An empty document yields the defaults.
    pub fn from_yaml(content: &str) -> SweeperResult<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
            .map_err(|e| SweeperError::Config(format!("invalid configuration: {e}")))
    }

    /// Check value ranges and that the repository root exists.
    pub fn validate(&self) -> SweeperResult<()> {
        if self.sleep_time == 0 {
            return Err(SweeperError::Config("sleep_time must be > 0".into()));
        }
        if self.cooldown_minutes == 0 {
            return Err(SweeperError::Config("cooldown_minutes must be > 0".into()));
        }
        if self.fixer_timeout_mins == 0 {
            return Err(SweeperError::Config(
                "fixer_timeout_mins must be > 0".into(),
            ));
        }
        for (key, minutes) in [
            ("sleep_time", self.sleep_time),
            ("fixer_timeout_mins", self.fixer_timeout_mins),
        ] {
            if minutes.checked_mul(60).is_none() {
                return Err(SweeperError::Config(format!("{key} is too large")));
            }
        }
        if self.item_delay_secs > MAX_ITEM_DELAY_SECS {
            return Err(SweeperError::Config(format!(
                "item_delay_secs must be at most {MAX_ITEM_DELAY_SECS}"
            )));
        }
        if self.fixer.command.trim().is_empty() {
            return Err(SweeperError::Config("fixer.command is empty".into()));
        }
        if self.marker_tag.trim().is_empty() || self.marker_tag.contains(char::is_whitespace) {
            return Err(SweeperError::Config(
                "marker_tag must be a single non-empty word".into(),
            ));
        }
        PromptRenderer::new(&self.fixer.prompt)
            .map_err(|e| SweeperError::Config(format!("fixer.prompt: {e:#}")))?;
        if !self.repos_directory.is_dir() {
            return Err(SweeperError::MissingRoot(self.repos_directory.clone()));
        }
        Ok(())
    }

    /// Sleep after an idle or exhausted pass.
    #[must_use]
    pub fn sleep_duration(&self) -> Duration {
        Duration::from_secs(self.sleep_time.saturating_mul(60))
    }

    /// Cooldown window as a wall-clock span, for comparing marker ages.
    #[must_use]
    pub fn cooldown(&self) -> chrono::Duration {
        let max = i64::MAX / 60_000;
        let minutes = i64::try_from(self.cooldown_minutes).map_or(max, |m| m.min(max));
        chrono::Duration::minutes(minutes)
    }

    /// Delay between dispatched items.
    #[must_use]
    pub fn item_delay(&self) -> Duration {
        Duration::from_secs(self.item_delay_secs)
    }

    /// Upper bound for one fixer call.
    #[must_use]
    pub fn fixer_timeout(&self) -> Duration {
        Duration::from_secs(self.fixer_timeout_mins.saturating_mul(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.sleep_time, 30);
        assert_eq!(config.cooldown_minutes, 60);
        assert_eq!(config.item_delay_secs, 30);
        assert_eq!(config.repos_directory, PathBuf::from("."));
        assert_eq!(config.marker_store, MarkerStoreKind::Comments);
        assert_eq!(config.quota.low_water_mark, 50);
        assert_eq!(config.sleep_duration(), Duration::from_secs(1800));
        assert_eq!(config.cooldown(), chrono::Duration::hours(1));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml(
            "sleep_time: 5\nrepos_directory: /srv/repos\nquota:\n  low_water_mark: 10\n",
        )
        .unwrap();
        assert_eq!(config.sleep_time, 5);
        assert_eq!(config.repos_directory, PathBuf::from("/srv/repos"));
        assert_eq!(config.quota.low_water_mark, 10);
        assert_eq!(config.quota.safety_margin_secs, 60);
        assert_eq!(config.fixer.command, "claude");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let config = Config::from_yaml("  \n").unwrap();
        assert_eq!(config.sleep_time, 30);
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = Config::from_yaml("sleep_tme: 5\n").unwrap_err();
        assert!(matches!(err, SweeperError::Config(_)));
    }

    #[test]
    fn test_marker_store_kind() {
        let config = Config::from_yaml("marker_store: file\n").unwrap();
        assert_eq!(config.marker_store, MarkerStoreKind::File);
    }

    #[test]
    fn test_missing_root_is_reported() {
        let mut config = Config::default();
        config.repos_directory = PathBuf::from("/definitely/not/here");
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SweeperError::MissingRoot(_)));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_zero_sleep_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.repos_directory = dir.path().to_path_buf();
        config.sleep_time = 0;
        assert!(matches!(config.validate(), Err(SweeperError::Config(_))));
    }

    #[test]
    fn test_oversized_durations_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.repos_directory = dir.path().to_path_buf();

        config.sleep_time = u64::MAX / 2;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SweeperError::Config(ref msg) if msg.contains("sleep_time")));
        assert_eq!(err.exit_code(), 2);
        config.sleep_time = 30;

        config.fixer_timeout_mins = u64::MAX;
        assert!(matches!(config.validate(), Err(SweeperError::Config(_))));
        assert_eq!(
            config.fixer_timeout(),
            Duration::from_secs(u64::MAX),
            "accessors saturate instead of wrapping"
        );
        config.fixer_timeout_mins = 45;

        config.item_delay_secs = MAX_ITEM_DELAY_SECS + 1;
        assert!(matches!(config.validate(), Err(SweeperError::Config(_))));
        config.item_delay_secs = MAX_ITEM_DELAY_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bad_prompt_template_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.repos_directory = dir.path().to_path_buf();
        config.fixer.prompt = "Fix {{#if number}}".to_string();
        assert!(matches!(config.validate(), Err(SweeperError::Config(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/no/such/sweeper.yaml")).unwrap_err();
        assert!(matches!(err, SweeperError::Config(_)));
    }

    #[test]
    fn test_load_valid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sweeper.yaml");
        std::fs::write(
            &path,
            format!("repos_directory: {}\nsleep_time: 1\n", dir.path().display()),
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.sleep_time, 1);
    }
}
