use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::foreman_config::{CONFIG_FILE, ForemanToml};

/// Directory under the project root holding all foreman state.
pub const FOREMAN_DIR: &str = ".foreman";

/// Runtime configuration for foreman.
///
/// Resolves the on-disk layout under `.foreman/` and carries the layered
/// settings from `foreman.toml` and the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    /// `.foreman/`, also the state store root.
    pub foreman_dir: PathBuf,
    pub context_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub config_file: PathBuf,
    pub verbose: bool,
    settings: ForemanToml,
}

impl Config {
    /// Build the runtime configuration for `project_dir`.
    ///
    /// Precedence is file, then environment, then CLI flags.
    pub fn new(project_dir: PathBuf, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;

        let foreman_dir = project_dir.join(FOREMAN_DIR);
        let mut settings = ForemanToml::load_or_default(&foreman_dir)?;
        settings.apply_env();

        Ok(Self {
            context_dir: foreman_dir.join("context"),
            logs_dir: foreman_dir.join("logs"),
            config_file: foreman_dir.join(CONFIG_FILE),
            foreman_dir,
            project_dir,
            verbose,
            settings,
        })
    }

    pub fn settings(&self) -> &ForemanToml {
        &self.settings
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.foreman_dir)
            .context("Failed to create .foreman directory")?;
        std::fs::create_dir_all(&self.context_dir)
            .context("Failed to create context directory")?;
        std::fs::create_dir_all(&self.logs_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Whether `foreman init` has been run for this project.
    pub fn is_initialized(&self) -> bool {
        self.config_file.exists()
    }

    pub fn state_root(&self) -> &Path {
        &self.foreman_dir
    }
}
