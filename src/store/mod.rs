//! Durable state store for tasks and agents.
//!
//! One JSON record per entity under the workspace:
//!
//! ```text
//! .foreman/
//!   state/agents/<id>.json   agent record
//!   state/agents/<id>.lock   companion advisory lock
//!   state/tasks/<id>.json    task record
//!   logs/<agent-id>.log      worker output
//!   results/<agent-id>/      worker artifacts
//!   archive/{agents,tasks}/  records retired by `delete_stale`
//! ```
//!
//! Writes go to a temp file that is fsynced and atomically renamed over the
//! record, so readers never observe a partial write and need no lock. Every
//! mutation is on disk before the call returns.

pub mod lock;
pub mod naming;
pub mod records;

pub use lock::RecordLock;
pub use records::{
    Agent, AgentFilter, AgentStatus, Metadata, NewAgent, NewTask, StoreStats, TASK_OUTCOME, Task,
    TaskPriority, TaskStatus,
};

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, instrument, warn};

use crate::errors::{RecordKind, StoreError};

const MAX_ID_ATTEMPTS: usize = 8;

/// Tunables for the store.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Upper bound on how long a writer waits for a record lock.
    pub lock_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct Layout {
    root: PathBuf,
    agents_dir: PathBuf,
    tasks_dir: PathBuf,
    logs_dir: PathBuf,
    results_dir: PathBuf,
    archive_dir: PathBuf,
}

/// Handle to the on-disk state. Cheap to clone; every component that needs
/// state receives one explicitly.
#[derive(Debug, Clone)]
pub struct StateStore {
    layout: Arc<Layout>,
    options: StoreOptions,
}

/// What `delete_stale` retired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub agents: Vec<String>,
    pub tasks: Vec<String>,
}

impl StateStore {
    /// Open (creating if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, options: StoreOptions) -> Result<Self, StoreError> {
        let root = root.into();
        let layout = Layout {
            agents_dir: root.join("state").join("agents"),
            tasks_dir: root.join("state").join("tasks"),
            logs_dir: root.join("logs"),
            results_dir: root.join("results"),
            archive_dir: root.join("archive"),
            root,
        };
        for dir in [
            &layout.agents_dir,
            &layout.tasks_dir,
            &layout.logs_dir,
            &layout.results_dir,
            &layout.archive_dir.join("agents"),
            &layout.archive_dir.join("tasks"),
        ] {
            fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        debug!(root = %layout.root.display(), "state store opened");
        Ok(Self {
            layout: Arc::new(layout),
            options,
        })
    }

    pub fn root(&self) -> &Path {
        &self.layout.root
    }

    pub fn logs_dir(&self) -> &Path {
        &self.layout.logs_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.layout.results_dir
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Create a task with a fresh id. Id collisions are retried internally.
    #[instrument(skip_all, fields(priority = ?new.priority))]
    pub fn create_task(&self, new: NewTask) -> Result<Task, StoreError> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = format!("task-{}", short_uuid());
            let task = Task {
                id: id.clone(),
                description: new.description.clone(),
                priority: new.priority,
                status: TaskStatus::Pending,
                dependencies: new.dependencies.clone(),
                created_at: Utc::now(),
                started_at: None,
                completed_at: None,
                metadata: new.metadata.clone(),
            };
            match self.insert(RecordKind::Task, &id, &task) {
                Ok(()) => {
                    debug!(task_id = %id, "task created");
                    return Ok(task);
                }
                Err(StoreError::DuplicateId { .. }) => {
                    debug!(task_id = %id, "task id collision, regenerating");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::DuplicateId {
            id: "task-*".to_string(),
        })
    }

    pub fn get_task(&self, id: &str) -> Result<Task, StoreError> {
        self.read(RecordKind::Task, id)
    }

    /// All tasks, optionally filtered by status, ordered by priority then age.
    pub fn list_tasks(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, StoreError> {
        let mut tasks: Vec<Task> = self
            .read_all(RecordKind::Task)?
            .into_iter()
            .filter(|t: &Task| status.is_none_or(|s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        Ok(tasks)
    }

    /// Read-modify-write a task under its lock.
    ///
    /// Status may only move forward (or to `cancelled`); start and completion
    /// timestamps are stamped automatically.
    pub fn update_task<F>(&self, id: &str, mutate: F) -> Result<Task, StoreError>
    where
        F: FnOnce(&mut Task),
    {
        let _lock = self.lock(RecordKind::Task, id)?;
        let before: Task = self.read(RecordKind::Task, id)?;
        let mut task = before.clone();
        mutate(&mut task);

        if task.id != before.id {
            return Err(StoreError::ImmutableField {
                id: id.to_string(),
                field: "id",
            });
        }
        if !before.status.can_transition_to(task.status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: before.status.to_string(),
                to: task.status.to_string(),
            });
        }
        if task.status == TaskStatus::Running && task.started_at.is_none() {
            task.started_at = Some(Utc::now());
        }
        if task.status.is_terminal() && task.completed_at.is_none() {
            task.completed_at = Some(Utc::now());
        }

        if task != before {
            self.write(RecordKind::Task, id, &task)?;
        }
        Ok(task)
    }

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Create a `pending` agent with a semantic id.
    ///
    /// When the name is taken a short suffix is appended; existing records are
    /// never overwritten. The agent's result directory is created eagerly.
    #[instrument(skip_all, fields(profile = %new.worker_profile))]
    pub fn create_agent(&self, new: NewAgent) -> Result<Agent, StoreError> {
        let base = naming::semantic_name(
            &new.description,
            new.worker_profile,
            new.custom_name.as_deref(),
        );

        let mut candidate = base.clone();
        for _ in 0..MAX_ID_ATTEMPTS {
            let agent = Agent {
                id: candidate.clone(),
                worker_profile: new.worker_profile,
                task_id: new.task_id.clone(),
                parent_id: new.parent_id.clone(),
                description: new.description.clone(),
                status: AgentStatus::Pending,
                process_handle: None,
                created_at: Utc::now(),
                start_time: None,
                end_time: None,
                log_path: self.layout.logs_dir.join(format!("{candidate}.log")),
                result_dir: self.layout.results_dir.join(&candidate),
                error_message: None,
                metadata: new.metadata.clone(),
            };

            match self.insert(RecordKind::Agent, &candidate, &agent) {
                Ok(()) => {
                    fs::create_dir_all(&agent.result_dir)
                        .map_err(|e| StoreError::io(&agent.result_dir, e))?;
                    info!(agent_id = %agent.id, task_id = ?agent.task_id, "agent created");
                    return Ok(agent);
                }
                Err(StoreError::DuplicateId { .. }) => {
                    candidate = format!("{base}-{}", naming::disambiguating_suffix());
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::DuplicateId { id: base })
    }

    pub fn get_agent(&self, id: &str) -> Result<Agent, StoreError> {
        self.read(RecordKind::Agent, id)
    }

    /// Agents matching `filter`, most recently active first.
    pub fn list_agents(
        &self,
        filter: &AgentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<Agent> = self
            .read_all(RecordKind::Agent)?
            .into_iter()
            .filter(|a| filter.matches(a))
            .collect();
        agents.sort_by(|a, b| {
            b.last_activity()
                .cmp(&a.last_activity())
                .then_with(|| a.id.cmp(&b.id))
        });
        if let Some(limit) = limit {
            agents.truncate(limit);
        }
        Ok(agents)
    }

    /// The `n` most recently active agents.
    pub fn recent_agents(&self, n: usize) -> Result<Vec<Agent>, StoreError> {
        self.list_agents(&AgentFilter::default(), Some(n))
    }

    /// Read-modify-write an agent under its lock.
    ///
    /// Enforced here rather than trusted to callers:
    /// - terminal statuses never change;
    /// - `task_id` never changes once set;
    /// - `start_time`/`end_time` are stamped on entering running/terminal.
    pub fn update_agent<F>(&self, id: &str, mutate: F) -> Result<Agent, StoreError>
    where
        F: FnOnce(&mut Agent),
    {
        let _lock = self.lock(RecordKind::Agent, id)?;
        let before: Agent = self.read(RecordKind::Agent, id)?;
        let mut agent = before.clone();
        mutate(&mut agent);

        if agent.id != before.id {
            return Err(StoreError::ImmutableField {
                id: id.to_string(),
                field: "id",
            });
        }
        if before.task_id.is_some() && agent.task_id != before.task_id {
            return Err(StoreError::ImmutableField {
                id: id.to_string(),
                field: "task_id",
            });
        }
        if !before.status.can_transition_to(agent.status) {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: before.status.to_string(),
                to: agent.status.to_string(),
            });
        }
        if agent.status == AgentStatus::Running && agent.start_time.is_none() {
            agent.start_time = Some(Utc::now());
        }
        if agent.status.is_terminal() && !before.status.is_terminal() {
            agent.end_time.get_or_insert_with(Utc::now);
        }

        if agent != before {
            self.write(RecordKind::Agent, id, &agent)?;
        }
        Ok(agent)
    }

    /// Move a non-terminal agent into a terminal status.
    ///
    /// Returns the record as it stands afterwards. If the agent was already
    /// terminal it is returned unchanged, so the first writer wins.
    pub fn finish_agent(
        &self,
        id: &str,
        status: AgentStatus,
        error_message: Option<String>,
    ) -> Result<Agent, StoreError> {
        debug_assert!(status.is_terminal());
        self.update_agent(id, |agent| {
            if agent.status.is_terminal() {
                return;
            }
            agent.status = status;
            agent.process_handle = None;
            if error_message.is_some() {
                agent.error_message = error_message;
            }
        })
    }

    /// Counts of agents by status, plus the number of tasks.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for agent in self.read_all::<Agent>(RecordKind::Agent)? {
            stats.record(agent.status);
        }
        stats.tasks = self.record_ids(RecordKind::Task)?.len();
        Ok(stats)
    }

    /// Archive terminal records whose end is older than `older_than`.
    ///
    /// Only statuses listed in `statuses` that are terminal are eligible;
    /// non-terminal records are never touched. Tasks are matched by
    /// [`Task::terminal_outcome`] against the same statuses and archived
    /// when they ended before the horizon.
    #[instrument(skip(self))]
    pub fn delete_stale(
        &self,
        older_than: Duration,
        statuses: &[AgentStatus],
    ) -> Result<PurgeReport, StoreError> {
        let horizon = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut report = PurgeReport::default();

        for id in self.record_ids(RecordKind::Agent)? {
            let _lock = self.lock(RecordKind::Agent, &id)?;
            let agent: Agent = match self.read(RecordKind::Agent, &id) {
                Ok(agent) => agent,
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let eligible = agent.status.is_terminal()
                && statuses.contains(&agent.status)
                && agent.end_time.unwrap_or(agent.created_at) < horizon;
            if eligible {
                self.archive(RecordKind::Agent, &id)?;
                report.agents.push(id);
            }
        }

        for id in self.record_ids(RecordKind::Task)? {
            let _lock = self.lock(RecordKind::Task, &id)?;
            let task: Task = match self.read(RecordKind::Task, &id) {
                Ok(task) => task,
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            };
            let eligible = task
                .terminal_outcome()
                .is_some_and(|outcome| statuses.contains(&outcome))
                && task.completed_at.is_some_and(|t| t < horizon);
            if eligible {
                self.archive(RecordKind::Task, &id)?;
                report.tasks.push(id);
            }
        }

        if !report.agents.is_empty() || !report.tasks.is_empty() {
            info!(
                agents = report.agents.len(),
                tasks = report.tasks.len(),
                "archived stale records"
            );
        }
        Ok(report)
    }

    // ------------------------------------------------------------------
    // Record plumbing
    // ------------------------------------------------------------------

    fn dir(&self, kind: RecordKind) -> &Path {
        match kind {
            RecordKind::Agent => &self.layout.agents_dir,
            RecordKind::Task => &self.layout.tasks_dir,
        }
    }

    fn record_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        self.dir(kind).join(format!("{id}.json"))
    }

    fn lock(&self, kind: RecordKind, id: &str) -> Result<RecordLock, StoreError> {
        let path = self.dir(kind).join(format!("{id}.lock"));
        RecordLock::acquire(&path, id, self.options.lock_timeout)
    }

    fn archive_path(&self, kind: RecordKind, id: &str) -> PathBuf {
        let sub = match kind {
            RecordKind::Agent => "agents",
            RecordKind::Task => "tasks",
        };
        self.layout.archive_dir.join(sub).join(format!("{id}.json"))
    }

    /// Write a brand-new record, failing with `DuplicateId` if the id is taken.
    fn insert<T: Serialize>(&self, kind: RecordKind, id: &str, record: &T) -> Result<(), StoreError> {
        let _lock = self.lock(kind, id)?;
        if self.id_taken(kind, id) {
            return Err(StoreError::DuplicateId { id: id.to_string() });
        }
        self.write(kind, id, record)
    }

    /// An id stays taken after archiving, and an agent id stays taken while
    /// its log or result directory is on disk.
    fn id_taken(&self, kind: RecordKind, id: &str) -> bool {
        if self.record_path(kind, id).exists() || self.archive_path(kind, id).exists() {
            return true;
        }
        match kind {
            RecordKind::Agent => {
                self.layout.logs_dir.join(format!("{id}.log")).exists()
                    || self.layout.results_dir.join(id).exists()
            }
            RecordKind::Task => false,
        }
    }

    fn read<T: DeserializeOwned>(&self, kind: RecordKind, id: &str) -> Result<T, StoreError> {
        let path = self.record_path(kind, id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    kind,
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupted { path, source })
    }

    /// Temp file + fsync + rename. Caller holds the record lock.
    fn write<T: Serialize>(&self, kind: RecordKind, id: &str, record: &T) -> Result<(), StoreError> {
        let path = self.record_path(kind, id);
        let tmp = self
            .dir(kind)
            .join(format!("{id}.tmp-{}", short_uuid()));
        let bytes = serde_json::to_vec_pretty(record).map_err(StoreError::Serialize)?;

        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
            fs::rename(&tmp, &path)
        })();
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp);
            return Err(StoreError::io(&path, e));
        }
        Ok(())
    }

    fn record_ids(&self, kind: RecordKind) -> Result<Vec<String>, StoreError> {
        let dir = self.dir(kind);
        let entries = fs::read_dir(dir).map_err(|e| StoreError::io(dir, e))?;
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(dir, e))?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json")
                && let Some(stem) = path.file_stem().and_then(|s| s.to_str())
            {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    fn read_all<T: DeserializeOwned>(&self, kind: RecordKind) -> Result<Vec<T>, StoreError> {
        let mut records = Vec::new();
        for id in self.record_ids(kind)? {
            match self.read(kind, &id) {
                Ok(record) => records.push(record),
                // Archived between listing and reading.
                Err(StoreError::NotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    fn archive(&self, kind: RecordKind, id: &str) -> Result<(), StoreError> {
        let from = self.record_path(kind, id);
        let to = self.archive_path(kind, id);
        fs::rename(&from, &to).map_err(|e| StoreError::io(&from, e))?;
        let lock_path = self.dir(kind).join(format!("{id}.lock"));
        if let Err(e) = fs::remove_file(&lock_path) {
            warn!(path = %lock_path.display(), error = %e, "could not remove lock of archived record");
        }
        Ok(())
    }
}

fn short_uuid() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Timestamp helper for metadata values.
pub fn timestamp_value(at: DateTime<Utc>) -> serde_json::Value {
    serde_json::Value::String(at.to_rfc3339())
}
