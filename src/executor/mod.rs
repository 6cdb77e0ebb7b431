//! Process executor: launches one external worker per agent and supervises it
//! until it reaches a terminal status.
//!
//! The worker reads its task text on stdin; stdout and stderr are appended
//! to the agent's log file. Each worker runs in its own process group so
//! stop requests reach anything it spawned.

pub mod process;
pub mod supervisor;

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, instrument, warn};

use crate::errors::{ExecutorError, StoreError};
use crate::profile::WorkerProfile;
use crate::store::{Agent, AgentFilter, AgentStatus, StateStore, timestamp_value};
use process::Signal;
use supervisor::{FORCED_MESSAGE, GRACEFUL_MESSAGE, STOP_FORCED, STOP_REQUESTED_AT, Supervision};

/// Environment variables exported to every worker.
pub const ENV_AGENT_ID: &str = "FOREMAN_AGENT_ID";
pub const ENV_RESULT_DIR: &str = "FOREMAN_RESULT_DIR";
pub const ENV_LOG_PATH: &str = "FOREMAN_LOG_PATH";

const PROCESS_NOT_FOUND: &str = "process not found";
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const STORE_POLL_INTERVAL: Duration = Duration::from_millis(200);

pub(crate) type RunningMap = Arc<Mutex<HashMap<String, watch::Receiver<Option<AgentOutcome>>>>>;

/// How the external worker executable is invoked.
///
/// The final argv is `args.. <profile_flag> <agent-config> [non_interactive]
/// [auto_approve]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: String,
    pub args: Vec<String>,
    pub profile_flag: String,
    pub non_interactive_flag: Option<String>,
    pub auto_approve_flag: Option<String>,
}

impl WorkerCommand {
    pub fn argv(&self, profile: WorkerProfile, auto_approve: bool) -> Vec<String> {
        let mut argv = self.args.clone();
        argv.push(self.profile_flag.clone());
        argv.push(profile.capability().agent_config.to_string());
        if let Some(flag) = &self.non_interactive_flag {
            argv.push(flag.clone());
        }
        if auto_approve && let Some(flag) = &self.auto_approve_flag {
            argv.push(flag.clone());
        }
        argv
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self {
            program: "q".to_string(),
            args: vec!["chat".to_string()],
            profile_flag: "--agent".to_string(),
            non_interactive_flag: Some("--no-interactive".to_string()),
            auto_approve_flag: Some("--trust-all-tools".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub worker: WorkerCommand,
    /// Directory workers run in.
    pub working_dir: PathBuf,
    /// How long a graceful stop waits before reporting `StillRunning`.
    pub grace_period: Duration,
    pub heartbeat_interval: Duration,
    /// Applied to agents that are not keep-alive, unless overridden per spawn.
    pub default_timeout: Option<Duration>,
}

impl ExecutorConfig {
    pub fn new(worker: WorkerCommand, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            worker,
            working_dir: working_dir.into(),
            grace_period: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(30),
            default_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }

    pub fn with_grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = grace;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }
}

/// Per-spawn options.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnOptions {
    /// Pass the auto-approve flag so the worker never blocks on confirmation.
    pub auto_approve: bool,
    /// Long-running agent: heartbeats are logged and no timeout applies.
    pub keep_alive: bool,
    /// Overrides `ExecutorConfig::default_timeout` when not keep-alive.
    pub timeout: Option<Duration>,
}

/// Terminal result of one agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentOutcome {
    pub agent_id: String,
    pub status: AgentStatus,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
}

impl AgentOutcome {
    fn from_agent(agent: &Agent) -> Self {
        Self {
            agent_id: agent.id.clone(),
            status: agent.status,
            exit_code: agent
                .metadata
                .get(supervisor::EXIT_CODE)
                .and_then(|v| v.as_i64())
                .map(|c| c as i32),
            error_message: agent.error_message.clone(),
        }
    }
}

/// Result of a stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The agent is now `cancelled`.
    Cancelled { forced: bool },
    /// SIGTERM was sent but the worker outlived the grace period. Stopping
    /// again escalates to SIGKILL.
    StillRunning,
    /// The agent had already reached this terminal status.
    AlreadyFinished(AgentStatus),
}

/// Launches and supervises workers. Cheap to clone.
#[derive(Clone)]
pub struct Executor {
    store: StateStore,
    config: Arc<ExecutorConfig>,
    running: RunningMap,
}

impl Executor {
    pub fn new(store: StateStore, config: ExecutorConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Launch the worker for a `pending` agent.
    ///
    /// On success the agent is `running` with its pid recorded and a
    /// supervisor task owns the process. If the launch fails the agent is
    /// marked `failed` and `SpawnFailed` is returned.
    #[instrument(skip(self, task_text, options), fields(keep_alive = options.keep_alive))]
    pub async fn spawn(
        &self,
        agent_id: &str,
        task_text: &str,
        options: SpawnOptions,
    ) -> Result<Agent, ExecutorError> {
        let agent = self.store.get_agent(agent_id)?;
        if agent.status != AgentStatus::Pending {
            return Err(ExecutorError::InvalidState {
                agent_id: agent_id.to_string(),
                status: agent.status,
                expected: AgentStatus::Pending,
            });
        }

        let mut child = match self.launch(&agent, options.auto_approve) {
            Ok(child) => child,
            Err(source) => {
                warn!(agent_id, error = %source, "failed to launch worker");
                self.store.finish_agent(
                    agent_id,
                    AgentStatus::Failed,
                    Some(format!("failed to launch worker: {source}")),
                )?;
                return Err(ExecutorError::SpawnFailed {
                    agent_id: agent_id.to_string(),
                    source,
                });
            }
        };

        let Some(pid) = child.id() else {
            // Exited and reaped before we could look.
            let _ = child.wait().await;
            self.store.finish_agent(
                agent_id,
                AgentStatus::Failed,
                Some(PROCESS_NOT_FOUND.to_string()),
            )?;
            return Err(ExecutorError::SpawnFailed {
                agent_id: agent_id.to_string(),
                source: std::io::Error::other("worker exited before its pid was recorded"),
            });
        };

        if let Some(mut stdin) = child.stdin.take() {
            let text = task_text.to_string();
            let id = agent_id.to_string();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(text.as_bytes()).await {
                    debug!(agent_id = %id, error = %e, "worker closed stdin early");
                }
                let _ = stdin.shutdown().await;
            });
        }

        self.release_reused_pid(agent_id, pid)?;

        let running = self.store.update_agent(agent_id, |a| {
            if a.status == AgentStatus::Pending {
                a.status = AgentStatus::Running;
                a.process_handle = Some(pid);
                a.metadata
                    .insert("keep_alive".to_string(), options.keep_alive.into());
                a.metadata
                    .insert("auto_approve".to_string(), options.auto_approve.into());
            }
        });
        let agent = match running {
            Ok(agent) if agent.status == AgentStatus::Running => agent,
            Ok(agent) => {
                // Stopped between creation and launch.
                let _ = process::signal_group(pid, Signal::Kill);
                let _ = child.wait().await;
                return Err(ExecutorError::InvalidState {
                    agent_id: agent_id.to_string(),
                    status: agent.status,
                    expected: AgentStatus::Pending,
                });
            }
            Err(e) => {
                let _ = process::signal_group(pid, Signal::Kill);
                let _ = child.wait().await;
                return Err(e.into());
            }
        };

        info!(agent_id, pid, profile = %agent.worker_profile, "worker launched");

        let (tx, rx) = watch::channel(None);
        self.running.lock().await.insert(agent_id.to_string(), rx);

        let timeout = if options.keep_alive {
            None
        } else {
            options.timeout.or(self.config.default_timeout)
        };
        tokio::spawn(supervisor::supervise(Supervision {
            store: self.store.clone(),
            agent_id: agent_id.to_string(),
            child,
            pid,
            keep_alive: options.keep_alive,
            timeout,
            heartbeat: self.config.heartbeat_interval,
            outcome_tx: tx,
            running: self.running.clone(),
        }));

        Ok(agent)
    }

    fn launch(&self, agent: &Agent, auto_approve: bool) -> std::io::Result<tokio::process::Child> {
        let argv = self.config.worker.argv(agent.worker_profile, auto_approve);

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&agent.log_path)?;
        let log_err = log.try_clone()?;

        let mut cmd = Command::new(&self.config.worker.program);
        cmd.args(&argv)
            .current_dir(&self.config.working_dir)
            .env(ENV_AGENT_ID, &agent.id)
            .env(ENV_RESULT_DIR, &agent.result_dir)
            .env(ENV_LOG_PATH, &agent.log_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            agent_id = %agent.id,
            command = %format!("{} {}", self.config.worker.program, argv.join(" ")),
            "spawning worker"
        );
        cmd.spawn()
    }

    /// The OS may hand a dead agent's pid to a new worker. Any other live
    /// record still claiming `pid` is stale and is failed.
    fn release_reused_pid(&self, agent_id: &str, pid: u32) -> Result<(), StoreError> {
        let filter = AgentFilter {
            statuses: vec![AgentStatus::Pending, AgentStatus::Running],
            ..Default::default()
        };
        for stale in self.store.list_agents(&filter, None)? {
            if stale.id != agent_id && stale.process_handle == Some(pid) {
                warn!(agent_id = %stale.id, pid, "pid reused by a new worker, failing stale record");
                self.store.finish_agent(
                    &stale.id,
                    AgentStatus::Failed,
                    Some(PROCESS_NOT_FOUND.to_string()),
                )?;
            }
        }
        Ok(())
    }

    /// Wait until the agent reaches a terminal status.
    pub async fn wait(&self, agent_id: &str) -> Result<AgentOutcome, ExecutorError> {
        let receiver = self.running.lock().await.get(agent_id).cloned();
        if let Some(mut rx) = receiver {
            let outcome = rx
                .wait_for(|o| o.is_some())
                .await
                .ok()
                .and_then(|seen| seen.clone());
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
        }

        loop {
            let agent = self.store.get_agent(agent_id)?;
            if agent.is_terminal() {
                return Ok(AgentOutcome::from_agent(&agent));
            }
            if self.reconcile_one(&agent).await? {
                continue;
            }
            tokio::time::sleep(STORE_POLL_INTERVAL).await;
        }
    }

    /// Stop an agent.
    ///
    /// The first request sends SIGTERM and waits out the grace period. A
    /// second request, or `force`, sends SIGKILL. Stopping a terminal agent
    /// is a no-op.
    #[instrument(skip(self))]
    pub async fn stop(&self, agent_id: &str, force: bool) -> Result<StopOutcome, ExecutorError> {
        let agent = self.store.get_agent(agent_id)?;
        if agent.is_terminal() {
            return Ok(StopOutcome::AlreadyFinished(agent.status));
        }

        let Some(pid) = agent.process_handle else {
            let agent = self.store.finish_agent(
                agent_id,
                AgentStatus::Cancelled,
                Some("cancelled before launch".to_string()),
            )?;
            return Ok(Self::stop_result(&agent, false));
        };

        let escalate = force || agent.metadata.contains_key(STOP_REQUESTED_AT);
        let signal = if escalate { Signal::Kill } else { Signal::Terminate };

        let flagged = self.store.update_agent(agent_id, |a| {
            if a.status.is_terminal() {
                return;
            }
            a.metadata
                .entry(STOP_REQUESTED_AT.to_string())
                .or_insert_with(|| timestamp_value(Utc::now()));
            if escalate {
                a.metadata.insert(STOP_FORCED.to_string(), true.into());
            }
        })?;
        if flagged.is_terminal() {
            return Ok(StopOutcome::AlreadyFinished(flagged.status));
        }

        info!(agent_id, pid, signal = signal.name(), "stopping agent");
        process::signal_group(pid, signal)?;

        let exited = self.wait_for_exit(agent_id, pid, self.config.grace_period).await;
        if !exited && !escalate {
            info!(agent_id, pid, "worker still running after grace period");
            return Ok(StopOutcome::StillRunning);
        }
        if !exited {
            warn!(agent_id, pid, "worker did not exit after SIGKILL");
        }

        let message = if escalate { FORCED_MESSAGE } else { GRACEFUL_MESSAGE };
        let agent = self.store.finish_agent(
            agent_id,
            AgentStatus::Cancelled,
            Some(message.to_string()),
        )?;
        Ok(Self::stop_result(&agent, escalate))
    }

    fn stop_result(agent: &Agent, forced: bool) -> StopOutcome {
        if agent.status == AgentStatus::Cancelled {
            StopOutcome::Cancelled { forced }
        } else {
            StopOutcome::AlreadyFinished(agent.status)
        }
    }

    /// Whether the worker exits within `limit`. Supervised workers are
    /// observed through their supervisor; others by probing the pid.
    async fn wait_for_exit(&self, agent_id: &str, pid: u32, limit: Duration) -> bool {
        let receiver = self.running.lock().await.get(agent_id).cloned();
        if let Some(mut rx) = receiver {
            let waited = tokio::time::timeout(limit, async {
                rx.wait_for(|o| o.is_some()).await.map(|_| ())
            })
            .await;
            match waited {
                Ok(Ok(())) => return true,
                Err(_) => return false,
                // Supervisor gone; fall back to probing.
                Ok(Err(_)) => {}
            }
        }

        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if !process::is_process_alive(pid) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Fail every `running` agent whose process is gone and which no live
    /// supervisor in this process owns. Returns the ids that were failed.
    pub async fn reconcile_stale(&self) -> Result<Vec<String>, ExecutorError> {
        let mut failed = Vec::new();
        for agent in self
            .store
            .list_agents(&AgentFilter::status(AgentStatus::Running), None)?
        {
            if self.reconcile_one(&agent).await? {
                failed.push(agent.id);
            }
        }
        if !failed.is_empty() {
            info!(count = failed.len(), "reconciled stale agents");
        }
        Ok(failed)
    }

    async fn reconcile_one(&self, agent: &Agent) -> Result<bool, ExecutorError> {
        if agent.status != AgentStatus::Running || self.running.lock().await.contains_key(&agent.id)
        {
            return Ok(false);
        }
        let alive = agent.process_handle.is_some_and(process::is_process_alive);
        if alive {
            return Ok(false);
        }
        warn!(agent_id = %agent.id, pid = ?agent.process_handle, "worker process not found");
        let updated = self.store.finish_agent(
            &agent.id,
            AgentStatus::Failed,
            Some(PROCESS_NOT_FOUND.to_string()),
        )?;
        Ok(updated.status == AgentStatus::Failed)
    }

    /// Read an agent's log, optionally only the last `tail_lines` lines.
    /// A log that does not exist yet reads as empty.
    pub fn read_log(
        &self,
        agent_id: &str,
        tail_lines: Option<usize>,
    ) -> Result<String, ExecutorError> {
        let agent = self.store.get_agent(agent_id)?;
        let content = match std::fs::read(&agent.log_path) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(StoreError::io(&agent.log_path, e).into()),
        };
        Ok(match tail_lines {
            Some(n) => tail(&content, n),
            None => content,
        })
    }
}

/// Last `n` lines of `text`.
pub fn tail(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().collect();
    lines[lines.len().saturating_sub(n)..].join("\n")
}
