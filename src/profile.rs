//! Worker profiles.
//!
//! A profile selects which external capability an agent invokes. The set is
//! closed: each variant carries a capability descriptor naming the worker
//! configuration passed to the external executable and the tools it may use.
//!
//! | Profile        | Worker config        | Typical layer              |
//! |----------------|----------------------|----------------------------|
//! | `Backend`      | `backend-agent`      | schema, service, fixes     |
//! | `Frontend`     | `frontend-agent`     | presentation               |
//! | `Test`         | `test-agent`         | tests, regression checks   |
//! | `Docs`         | `docs-agent`         | documentation              |
//! | `Orchestrator` | `orchestrator-agent` | anything not classified    |

use serde::{Deserialize, Serialize};

/// The closed set of worker profiles.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum WorkerProfile {
    Backend,
    Frontend,
    Test,
    Docs,
    #[default]
    Orchestrator,
}

/// What a profile is allowed to do when invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    /// Worker configuration name handed to the external executable.
    pub agent_config: &'static str,
    /// Tools the worker may use without confirmation.
    pub allowed_tools: &'static [&'static str],
    /// Whether the worker is expected to modify source files.
    pub writes_code: bool,
}

impl WorkerProfile {
    pub const ALL: [WorkerProfile; 5] = [
        WorkerProfile::Backend,
        WorkerProfile::Frontend,
        WorkerProfile::Test,
        WorkerProfile::Docs,
        WorkerProfile::Orchestrator,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            WorkerProfile::Backend => "backend",
            WorkerProfile::Frontend => "frontend",
            WorkerProfile::Test => "test",
            WorkerProfile::Docs => "docs",
            WorkerProfile::Orchestrator => "orchestrator",
        }
    }

    pub fn capability(self) -> Capability {
        match self {
            WorkerProfile::Backend => Capability {
                agent_config: "backend-agent",
                allowed_tools: &["fs_read", "fs_write", "execute_bash"],
                writes_code: true,
            },
            WorkerProfile::Frontend => Capability {
                agent_config: "frontend-agent",
                allowed_tools: &["fs_read", "fs_write", "execute_bash"],
                writes_code: true,
            },
            WorkerProfile::Test => Capability {
                agent_config: "test-agent",
                allowed_tools: &["fs_read", "fs_write", "execute_bash"],
                writes_code: true,
            },
            WorkerProfile::Docs => Capability {
                agent_config: "docs-agent",
                allowed_tools: &["fs_read", "fs_write"],
                writes_code: false,
            },
            WorkerProfile::Orchestrator => Capability {
                agent_config: "orchestrator-agent",
                allowed_tools: &["fs_read", "fs_write", "execute_bash", "use_subagent"],
                writes_code: true,
            },
        }
    }
}

impl std::fmt::Display for WorkerProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkerProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase();
        let name = normalized.strip_suffix("-agent").unwrap_or(&normalized);
        match name {
            "backend" => Ok(WorkerProfile::Backend),
            "frontend" => Ok(WorkerProfile::Frontend),
            "test" => Ok(WorkerProfile::Test),
            "docs" => Ok(WorkerProfile::Docs),
            "orchestrator" => Ok(WorkerProfile::Orchestrator),
            _ => anyhow::bail!(
                "Invalid worker profile '{}'. Valid values: backend, frontend, test, docs, orchestrator",
                s
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_names_and_agent_config_names() {
        assert_eq!("backend".parse::<WorkerProfile>().unwrap(), WorkerProfile::Backend);
        assert_eq!("Test-Agent".parse::<WorkerProfile>().unwrap(), WorkerProfile::Test);
        assert!("designer".parse::<WorkerProfile>().is_err());
    }

    #[test]
    fn test_display_roundtrips_through_from_str() {
        for profile in WorkerProfile::ALL {
            assert_eq!(profile.to_string().parse::<WorkerProfile>().unwrap(), profile);
        }
    }

    #[test]
    fn test_docs_profile_does_not_write_code() {
        assert!(!WorkerProfile::Docs.capability().writes_code);
        assert!(!WorkerProfile::Docs.capability().allowed_tools.contains(&"execute_bash"));
    }

    #[test]
    fn test_serializes_lowercase() {
        let json = serde_json::to_string(&WorkerProfile::Frontend).unwrap();
        assert_eq!(json, "\"frontend\"");
    }
}
