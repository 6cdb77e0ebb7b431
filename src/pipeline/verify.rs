//! Post-completion verification of an increment.
//!
//! The baseline strategy scans the worker log for error markers and checks
//! for result artifacts. Richer strategies plug in behind [`Verifier`].

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;
use crate::planner::Increment;
use crate::store::Agent;

/// Maximum number of offending log lines quoted in feedback.
const MAX_QUOTED_LINES: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Fail { feedback: String },
}

impl Verdict {
    pub fn fail(feedback: impl Into<String>) -> Self {
        Verdict::Fail {
            feedback: feedback.into(),
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Verdict::Pass)
    }
}

/// Decides whether a completed agent actually did its increment.
///
/// Real implementation: `LogScanVerifier`. Tests substitute their own.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, increment: &Increment, agent: &Agent) -> Result<Verdict, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Case-insensitive substrings that mark a failed run.
    #[serde(default = "default_error_markers")]
    pub error_markers: Vec<String>,
    /// When set, the log must contain this text.
    #[serde(default)]
    pub completion_marker: Option<String>,
    /// Require at least one file in the agent's result directory.
    #[serde(default)]
    pub require_artifacts: bool,
}

fn default_error_markers() -> Vec<String> {
    ["error:", "failed:", "exception:", "traceback"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            error_markers: default_error_markers(),
            completion_marker: None,
            require_artifacts: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LogScanVerifier {
    config: VerifyConfig,
}

impl LogScanVerifier {
    pub fn new(config: VerifyConfig) -> Self {
        Self { config }
    }

    /// Verdict for a given log text and result directory.
    pub fn check(&self, log: &str, result_dir: &Path) -> Verdict {
        let lowered = log.to_lowercase();
        let markers: Vec<String> = self
            .config
            .error_markers
            .iter()
            .map(|m| m.to_lowercase())
            .collect();

        if markers.iter().any(|m| lowered.contains(m.as_str())) {
            let quoted: Vec<&str> = log
                .lines()
                .filter(|line| {
                    let line = line.to_lowercase();
                    markers.iter().any(|m| line.contains(m.as_str()))
                })
                .take(MAX_QUOTED_LINES)
                .collect();
            return Verdict::fail(format!(
                "Errors detected in agent log:\n{}",
                quoted.join("\n")
            ));
        }

        if let Some(marker) = &self.config.completion_marker
            && !log.contains(marker.as_str())
        {
            return Verdict::fail(format!(
                "Agent log does not contain the completion marker `{marker}`"
            ));
        }

        if self.config.require_artifacts && !has_artifacts(result_dir) {
            return Verdict::fail(format!(
                "No result artifacts were written to {}",
                result_dir.display()
            ));
        }

        Verdict::Pass
    }
}

fn has_artifacts(dir: &Path) -> bool {
    std::fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

#[async_trait]
impl Verifier for LogScanVerifier {
    async fn verify(&self, increment: &Increment, agent: &Agent) -> Result<Verdict, PipelineError> {
        let log = match tokio::fs::read(&agent.log_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => {
                return Err(PipelineError::Verification {
                    index: increment.index,
                    message: format!("cannot read {}: {e}", agent.log_path.display()),
                });
            }
        };
        Ok(self.check(&log, &agent.result_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_clean_log_passes() {
        let dir = tempdir().unwrap();
        let verifier = LogScanVerifier::default();
        assert_eq!(verifier.check("all good\ndone", dir.path()), Verdict::Pass);
    }

    #[test]
    fn test_error_marker_fails_and_quotes_lines() {
        let dir = tempdir().unwrap();
        let verifier = LogScanVerifier::default();
        let verdict = verifier.check("compiling\nERROR: missing semicolon\nok", dir.path());
        match verdict {
            Verdict::Fail { feedback } => {
                assert!(feedback.contains("ERROR: missing semicolon"));
                assert!(!feedback.contains("compiling"));
            }
            Verdict::Pass => panic!("expected failure"),
        }
    }

    #[test]
    fn test_missing_completion_marker_fails() {
        let dir = tempdir().unwrap();
        let verifier = LogScanVerifier::new(VerifyConfig {
            completion_marker: Some("TASK COMPLETE".into()),
            ..Default::default()
        });
        assert!(!verifier.check("worked on it", dir.path()).is_pass());
        assert!(verifier.check("...\nTASK COMPLETE", dir.path()).is_pass());
    }

    #[test]
    fn test_required_artifacts_must_exist() {
        let dir = tempdir().unwrap();
        let verifier = LogScanVerifier::new(VerifyConfig {
            require_artifacts: true,
            ..Default::default()
        });
        assert!(!verifier.check("", dir.path()).is_pass());

        std::fs::write(dir.path().join("out.txt"), "x").unwrap();
        assert!(verifier.check("", dir.path()).is_pass());
    }
}
