//! Durable record types for tasks and agents.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::profile::WorkerProfile;

/// Opaque key-value metadata attached to a record.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }

    /// Forward-only transitions, plus cancellation from any non-terminal state.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Running | Completed | Cancelled) => true,
            (Running, Completed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Priority of a task. Ordered from most to least urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

impl std::str::FromStr for TaskPriority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "critical" => Ok(TaskPriority::Critical),
            "high" => Ok(TaskPriority::High),
            "medium" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            _ => anyhow::bail!(
                "Invalid priority '{}'. Valid values: low, medium, high, critical",
                s
            ),
        }
    }
}

/// A unit of requested work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Metadata key recording how a task that did not complete ended.
pub const TASK_OUTCOME: &str = "outcome";

impl Task {
    /// The agent status equivalent to how this task ended, if it has.
    ///
    /// Tasks have no failed status: a cancelled task whose outcome is
    /// `failed` counts as failed.
    pub fn terminal_outcome(&self) -> Option<AgentStatus> {
        match self.status {
            TaskStatus::Completed => Some(AgentStatus::Completed),
            TaskStatus::Cancelled => {
                let failed = self
                    .metadata
                    .get(TASK_OUTCOME)
                    .and_then(|v| v.as_str())
                    .is_some_and(|outcome| outcome == "failed");
                Some(if failed {
                    AgentStatus::Failed
                } else {
                    AgentStatus::Cancelled
                })
            }
            TaskStatus::Pending | TaskStatus::Running => None,
        }
    }
}

/// Parameters for creating a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub description: String,
    pub priority: TaskPriority,
    pub dependencies: Vec<String>,
    pub metadata: Metadata,
}

impl NewTask {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Status of an agent. `Completed`, `Failed` and `Cancelled` are terminal and
/// never change once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl AgentStatus {
    pub const ALL: [AgentStatus; 5] = [
        AgentStatus::Pending,
        AgentStatus::Running,
        AgentStatus::Completed,
        AgentStatus::Failed,
        AgentStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn can_transition_to(&self, next: AgentStatus) -> bool {
        use AgentStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Running | Failed | Cancelled) => true,
            (Running, Completed | Failed | Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentStatus::ALL
            .into_iter()
            .find(|status| status.to_string() == s.to_lowercase())
            .ok_or_else(|| anyhow::anyhow!("Invalid agent status '{}'", s))
    }
}

/// One supervised external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    /// Semantic slug, e.g. `backend-add-auth-user`.
    pub id: String,
    pub worker_profile: WorkerProfile,
    /// Owning task. Never changes once set.
    #[serde(default)]
    pub task_id: Option<String>,
    /// Agent that spawned this one, if any.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub description: String,
    pub status: AgentStatus,
    /// OS process id while the worker is live.
    #[serde(default)]
    pub process_handle: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
    pub result_dir: PathBuf,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Agent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Most recent activity timestamp, used for "most recent N" ordering.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.end_time
            .or(self.start_time)
            .unwrap_or(self.created_at)
    }
}

/// Parameters for creating an agent.
#[derive(Debug, Clone, Default)]
pub struct NewAgent {
    pub worker_profile: WorkerProfile,
    pub task_id: Option<String>,
    pub description: String,
    pub parent_id: Option<String>,
    /// Overrides the generated semantic name.
    pub custom_name: Option<String>,
    pub metadata: Metadata,
}

impl NewAgent {
    pub fn new(worker_profile: WorkerProfile, description: impl Into<String>) -> Self {
        Self {
            worker_profile,
            description: description.into(),
            ..Default::default()
        }
    }

    pub fn for_task(mut self, task_id: impl Into<String>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: Option<String>) -> Self {
        self.parent_id = parent_id;
        self
    }

    pub fn with_custom_name(mut self, name: impl Into<String>) -> Self {
        self.custom_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Selection criteria for listing agents.
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub statuses: Vec<AgentStatus>,
    pub task_id: Option<String>,
    pub parent_id: Option<String>,
    pub worker_profile: Option<WorkerProfile>,
}

impl AgentFilter {
    pub fn status(status: AgentStatus) -> Self {
        Self {
            statuses: vec![status],
            ..Default::default()
        }
    }

    pub fn task(task_id: impl Into<String>) -> Self {
        Self {
            task_id: Some(task_id.into()),
            ..Default::default()
        }
    }

    pub fn matches(&self, agent: &Agent) -> bool {
        (self.statuses.is_empty() || self.statuses.contains(&agent.status))
            && self
                .task_id
                .as_ref()
                .is_none_or(|t| agent.task_id.as_ref() == Some(t))
            && self
                .parent_id
                .as_ref()
                .is_none_or(|p| agent.parent_id.as_ref() == Some(p))
            && self
                .worker_profile
                .is_none_or(|p| agent.worker_profile == p)
    }
}

/// Aggregate agent counts by status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub tasks: usize,
}

impl StoreStats {
    pub(crate) fn record(&mut self, status: AgentStatus) {
        self.total += 1;
        match status {
            AgentStatus::Pending => self.pending += 1,
            AgentStatus::Running => self.running += 1,
            AgentStatus::Completed => self.completed += 1,
            AgentStatus::Failed => self.failed += 1,
            AgentStatus::Cancelled => self.cancelled += 1,
        }
    }
}
