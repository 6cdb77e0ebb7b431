//! Layered configuration for foreman.
//!
//! Settings are read from `.foreman/foreman.toml`, then overridden by the
//! environment, then by CLI flags. Every field has a default, so an absent
//! file (or an empty one) is a valid configuration.
//!
//! # Configuration File Format
//!
//! ```toml
//! [worker]
//! command = "q"
//! args = ["chat"]
//! profile_flag = "--agent"
//! non_interactive_flag = "--no-interactive"
//! auto_approve_flag = "--trust-all-tools"
//!
//! [executor]
//! heartbeat_interval_secs = 30
//! grace_period_secs = 5
//! timeout_secs = 1800
//!
//! [pipeline]
//! max_attempts = 3
//! max_increment_lines = 50
//!
//! [store]
//! lock_timeout_ms = 5000
//! retention_days = 7
//!
//! [verify]
//! error_markers = ["error:", "failed:", "exception:", "traceback"]
//! completion_marker = "TASK COMPLETE"
//! require_artifacts = false
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::executor::{ExecutorConfig, WorkerCommand};
use crate::pipeline::{PipelineConfig, VerifyConfig};
use crate::planner::DEFAULT_MAX_INCREMENT_LINES;
use crate::store::StoreOptions;

pub const CONFIG_FILE: &str = "foreman.toml";

/// Environment variable overriding `[worker] command`.
pub const ENV_WORKER_CMD: &str = "FOREMAN_WORKER_CMD";
/// Environment variable overriding `[pipeline] max_attempts`.
pub const ENV_MAX_ATTEMPTS: &str = "FOREMAN_MAX_ATTEMPTS";

/// How to invoke the external worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerSection {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default = "default_worker_args")]
    pub args: Vec<String>,
    #[serde(default = "default_profile_flag")]
    pub profile_flag: String,
    #[serde(default = "default_non_interactive_flag")]
    pub non_interactive_flag: Option<String>,
    #[serde(default = "default_auto_approve_flag")]
    pub auto_approve_flag: Option<String>,
}

fn default_worker_command() -> String {
    "q".to_string()
}

fn default_worker_args() -> Vec<String> {
    vec!["chat".to_string()]
}

fn default_profile_flag() -> String {
    "--agent".to_string()
}

fn default_non_interactive_flag() -> Option<String> {
    Some("--no-interactive".to_string())
}

fn default_auto_approve_flag() -> Option<String> {
    Some("--trust-all-tools".to_string())
}

impl Default for WorkerSection {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: default_worker_args(),
            profile_flag: default_profile_flag(),
            non_interactive_flag: default_non_interactive_flag(),
            auto_approve_flag: default_auto_approve_flag(),
        }
    }
}

/// Supervision settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorSection {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    /// Only applies to agents that are not keep-alive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_grace_period_secs() -> u64 {
    5
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            grace_period_secs: default_grace_period_secs(),
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Total attempts per increment.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_max_increment_lines")]
    pub max_increment_lines: u32,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_max_increment_lines() -> u32 {
    DEFAULT_MAX_INCREMENT_LINES
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            max_increment_lines: default_max_increment_lines(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSection {
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Age after which terminal records are archived by `cleanup`.
    #[serde(default = "default_retention_days")]
    pub retention_days: u64,
}

fn default_lock_timeout_ms() -> u64 {
    5000
}

fn default_retention_days() -> u64 {
    7
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            lock_timeout_ms: default_lock_timeout_ms(),
            retention_days: default_retention_days(),
        }
    }
}

/// The complete foreman.toml structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForemanToml {
    #[serde(default)]
    pub worker: WorkerSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub pipeline: PipelineSection,
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub verify: VerifyConfig,
}

impl ForemanToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse foreman.toml")
    }

    /// Load `.foreman/foreman.toml`, or defaults if the file doesn't exist.
    pub fn load_or_default(foreman_dir: &Path) -> Result<Self> {
        let config_path = foreman_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize foreman.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides. Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(cmd) = std::env::var(ENV_WORKER_CMD)
            && !cmd.trim().is_empty()
        {
            self.worker.command = cmd;
        }
        if let Ok(attempts) = std::env::var(ENV_MAX_ATTEMPTS)
            && let Ok(attempts) = attempts.trim().parse::<u32>()
            && attempts > 0
        {
            self.pipeline.max_attempts = attempts;
        }
    }

    /// Problems worth telling the user about; none are fatal.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.worker.command.trim().is_empty() {
            warnings.push("[worker] command is empty".to_string());
        }
        if self.pipeline.max_attempts == 0 {
            warnings.push("[pipeline] max_attempts is 0; increments will never run".to_string());
        }
        if self.executor.grace_period_secs == 0 {
            warnings.push(
                "[executor] grace_period_secs is 0; stops will always need a second call"
                    .to_string(),
            );
        }
        if self.store.retention_days.checked_mul(SECS_PER_DAY).is_none() {
            warnings.push("[store] retention_days is out of range".to_string());
        }
        if self.verify.error_markers.iter().any(|m| m.trim().is_empty()) {
            warnings.push("[verify] error_markers contains an empty marker".to_string());
        }
        warnings
    }

    pub fn worker_command(&self) -> WorkerCommand {
        WorkerCommand {
            program: self.worker.command.clone(),
            args: self.worker.args.clone(),
            profile_flag: self.worker.profile_flag.clone(),
            non_interactive_flag: self.worker.non_interactive_flag.clone(),
            auto_approve_flag: self.worker.auto_approve_flag.clone(),
        }
    }

    pub fn executor_config(&self, working_dir: &Path) -> ExecutorConfig {
        ExecutorConfig::new(self.worker_command(), working_dir)
            .with_grace_period(Duration::from_secs(self.executor.grace_period_secs))
            .with_heartbeat_interval(Duration::from_secs(
                self.executor.heartbeat_interval_secs.max(1),
            ))
            .with_default_timeout(self.executor.timeout_secs.map(Duration::from_secs))
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_attempts: self.pipeline.max_attempts.max(1),
            ..Default::default()
        }
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            lock_timeout: Duration::from_millis(self.store.lock_timeout_ms),
        }
    }

    pub fn retention(&self) -> Result<Duration> {
        retention_from_days(self.store.retention_days)
    }
}

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Convert a retention period in days, rejecting values that overflow.
pub fn retention_from_days(days: u64) -> Result<Duration> {
    match days.checked_mul(SECS_PER_DAY) {
        Some(secs) => Ok(Duration::from_secs(secs)),
        None => anyhow::bail!("Retention of {} days is out of range", days),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_parse_empty_uses_defaults() {
        let config = ForemanToml::parse("").unwrap();
        assert_eq!(config, ForemanToml::default());
        assert_eq!(config.worker.command, "q");
        assert_eq!(config.pipeline.max_attempts, 3);
        assert_eq!(config.verify.error_markers.len(), 4);
        assert!(config.executor.timeout_secs.is_none());
    }

    #[test]
    fn test_parse_partial_sections() {
        let config = ForemanToml::parse(
            r#"
[worker]
command = "/usr/local/bin/worker"
auto_approve_flag = "--yes"

[executor]
grace_period_secs = 2
timeout_secs = 600

[verify]
completion_marker = "DONE"
"#,
        )
        .unwrap();

        assert_eq!(config.worker.command, "/usr/local/bin/worker");
        assert_eq!(config.worker.args, vec!["chat"]);
        assert_eq!(config.worker.auto_approve_flag.as_deref(), Some("--yes"));
        assert_eq!(config.executor.grace_period_secs, 2);
        assert_eq!(config.executor.heartbeat_interval_secs, 30);
        assert_eq!(config.verify.completion_marker.as_deref(), Some("DONE"));
        assert_eq!(config.verify.error_markers.len(), 4);

        let executor = config.executor_config(Path::new("/tmp"));
        assert_eq!(executor.grace_period, Duration::from_secs(2));
        assert_eq!(executor.default_timeout, Some(Duration::from_secs(600)));
    }

    #[test]
    fn test_parse_invalid_toml_fails() {
        assert!(ForemanToml::parse("[worker\ncommand = ").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = ForemanToml::default();
        // SAFETY: test-only; these variables are read by no other test.
        unsafe {
            std::env::set_var(ENV_WORKER_CMD, "my-worker");
            std::env::set_var(ENV_MAX_ATTEMPTS, "5");
        }
        config.apply_env();
        unsafe {
            std::env::remove_var(ENV_WORKER_CMD);
            std::env::remove_var(ENV_MAX_ATTEMPTS);
        }

        assert_eq!(config.worker.command, "my-worker");
        assert_eq!(config.pipeline.max_attempts, 5);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let config = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(config, ForemanToml::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let mut config = ForemanToml::default();
        config.pipeline.max_attempts = 4;
        config.executor.timeout_secs = Some(90);
        config.save(&dir.path().join(CONFIG_FILE)).unwrap();

        let loaded = ForemanToml::load_or_default(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_validate_flags_bad_values() {
        let mut config = ForemanToml::default();
        assert!(config.validate().is_empty());

        config.pipeline.max_attempts = 0;
        config.worker.command = " ".into();
        let warnings = config.validate();
        assert_eq!(warnings.len(), 2);
        assert_eq!(config.pipeline_config().max_attempts, 1);
    }

    #[test]
    fn test_retention_in_days() {
        let config = ForemanToml::default();
        assert_eq!(config.retention().unwrap(), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_retention_overflow_is_an_error() {
        let mut config = ForemanToml::default();
        config.store.retention_days = u64::MAX;

        let err = config.retention().unwrap_err();
        assert!(err.to_string().contains("out of range"));
        assert_eq!(
            config.validate(),
            vec!["[store] retention_days is out of range".to_string()]
        );
        assert!(retention_from_days(u64::MAX / SECS_PER_DAY).is_ok());
    }
}
