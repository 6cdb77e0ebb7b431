//! The caller-facing session API: `submit`, `execute`, `status`, `cancel`.
//!
//! A session bundles one store, one executor and one pipeline. CLI commands
//! and embedders go through it rather than wiring the pieces themselves.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use super::{
    EventSink, LogScanVerifier, Pipeline, PipelineConfig, PipelineEvent, PlanReport, Verifier,
};
use crate::config::Config;
use crate::errors::{ExecutorError, PipelineError, StoreError};
use crate::executor::{AgentOutcome, Executor, SpawnOptions, StopOutcome};
use crate::planner::{ExecutionPlan, Planner, ProjectContext};
use crate::profile::WorkerProfile;
use crate::store::{
    Agent, AgentFilter, AgentStatus, NewAgent, NewTask, StateStore, TASK_OUTCOME, Task,
    TaskStatus,
};

/// Point-in-time view of a task or an agent.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusSnapshot {
    Task { task: Task, agents: Vec<Agent> },
    Agent(Agent),
}

/// What a `cancel` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelReport {
    pub id: String,
    /// Set when `id` named a task that was not yet terminal.
    pub task_cancelled: bool,
    pub agents: Vec<(String, StopOutcome)>,
}

/// A one-off agent started through `submit_agent`.
#[derive(Debug, Clone)]
pub struct SubmittedAgent {
    pub task: Task,
    pub agent: Agent,
    /// Present when the caller waited for the agent to finish.
    pub outcome: Option<AgentOutcome>,
}

pub struct Session {
    store: StateStore,
    executor: Executor,
    pipeline: Pipeline,
    planner: Planner,
    context: ProjectContext,
    active_plan: Option<ExecutionPlan>,
}

impl Session {
    pub fn new(
        executor: Executor,
        verifier: Arc<dyn Verifier>,
        context: ProjectContext,
        planner: Planner,
        config: PipelineConfig,
    ) -> Self {
        let pipeline = Pipeline::new(executor.clone(), verifier, context.clone(), config);
        Self {
            store: executor.store().clone(),
            executor,
            pipeline,
            planner,
            context,
            active_plan: None,
        }
    }

    /// Session for a project, wired from its runtime configuration.
    pub fn open(config: &Config) -> Result<Self> {
        let settings = config.settings();
        let store = StateStore::open(config.state_root(), settings.store_options())
            .context("Failed to open state store")?;
        let executor = Executor::new(store, settings.executor_config(&config.project_dir));
        let context = ProjectContext::load(&config.context_dir)?;
        let verifier: Arc<dyn Verifier> = Arc::new(LogScanVerifier::new(settings.verify.clone()));
        let planner =
            Planner::default().with_max_increment_lines(settings.pipeline.max_increment_lines);

        Ok(Self::new(
            executor,
            verifier,
            context,
            planner,
            settings.pipeline_config(),
        ))
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn context(&self) -> &ProjectContext {
        &self.context
    }

    /// Plan `description` and keep the plan as the session's active plan.
    pub fn submit(&mut self, description: &str) -> ExecutionPlan {
        let plan = self.planner.plan(description, &self.context);
        info!(increments = plan.len(), shape = %plan.shape(), "plan submitted");
        self.active_plan = Some(plan.clone());
        plan
    }

    pub fn active_plan(&self) -> Option<&ExecutionPlan> {
        self.active_plan.as_ref()
    }

    /// Start executing `plan` in the background.
    ///
    /// Progress arrives on the returned receiver; the handle resolves to the
    /// final report once the plan completes or halts.
    pub fn execute(
        &self,
        plan: ExecutionPlan,
    ) -> (
        mpsc::UnboundedReceiver<PipelineEvent>,
        JoinHandle<Result<PlanReport, PipelineError>>,
    ) {
        let (sink, rx) = EventSink::channel();
        (rx, self.spawn_pipeline(plan, sink))
    }

    /// Like [`Session::execute`], also calling `observer` inline at every
    /// transition.
    pub fn execute_observed(
        &self,
        plan: ExecutionPlan,
        observer: impl Fn(&PipelineEvent) + Send + Sync + 'static,
    ) -> (
        mpsc::UnboundedReceiver<PipelineEvent>,
        JoinHandle<Result<PlanReport, PipelineError>>,
    ) {
        let (sink, rx) = EventSink::channel();
        (rx, self.spawn_pipeline(plan, sink.with_observer(observer)))
    }

    fn spawn_pipeline(
        &self,
        plan: ExecutionPlan,
        sink: EventSink,
    ) -> JoinHandle<Result<PlanReport, PipelineError>> {
        let pipeline = self.pipeline.clone();
        tokio::spawn(async move { pipeline.execute(&plan, &sink).await })
    }

    /// Snapshot of a task (with its agents) or of a single agent.
    pub fn status(&self, id: &str) -> Result<StatusSnapshot, StoreError> {
        match self.store.get_task(id) {
            Ok(task) => {
                let agents = self.store.list_agents(&AgentFilter::task(&task.id), None)?;
                Ok(StatusSnapshot::Task { task, agents })
            }
            Err(StoreError::NotFound { .. }) => Ok(StatusSnapshot::Agent(self.store.get_agent(id)?)),
            Err(e) => Err(e),
        }
    }

    /// Cancel a task or an agent.
    ///
    /// Cancelling a task stops every agent still working on it. Agents are
    /// asked to stop gracefully first and killed if they outlive the grace
    /// period.
    #[instrument(skip(self))]
    pub async fn cancel(&self, id: &str) -> Result<CancelReport, ExecutorError> {
        let task = match self.store.get_task(id) {
            Ok(task) => Some(task),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(task) = task else {
            let outcome = self.stop_agent(id).await?;
            return Ok(CancelReport {
                id: id.to_string(),
                task_cancelled: false,
                agents: vec![(id.to_string(), outcome)],
            });
        };

        let mut task_cancelled = false;
        self.store.update_task(&task.id, |t| {
            if !t.status.is_terminal() {
                t.status = TaskStatus::Cancelled;
                t.metadata
                    .entry(TASK_OUTCOME.to_string())
                    .or_insert_with(|| "cancelled".into());
                task_cancelled = true;
            }
        })?;

        let filter = AgentFilter {
            statuses: vec![AgentStatus::Pending, AgentStatus::Running],
            ..AgentFilter::task(&task.id)
        };
        let mut agents = Vec::new();
        for agent in self.store.list_agents(&filter, None)? {
            let outcome = self.stop_agent(&agent.id).await?;
            agents.push((agent.id, outcome));
        }
        info!(task_id = %task.id, stopped = agents.len(), "task cancelled");

        Ok(CancelReport {
            id: task.id,
            task_cancelled,
            agents,
        })
    }

    async fn stop_agent(&self, agent_id: &str) -> Result<StopOutcome, ExecutorError> {
        match self.executor.stop(agent_id, false).await? {
            StopOutcome::StillRunning => self.executor.stop(agent_id, true).await,
            outcome => Ok(outcome),
        }
    }

    /// Start a single agent for `description` outside any plan.
    ///
    /// A medium-priority task is created to own it. With `wait`, the call
    /// returns once the agent is terminal and the task is closed.
    #[instrument(skip(self, description))]
    pub async fn submit_agent(
        &self,
        profile: WorkerProfile,
        description: &str,
        custom_name: Option<&str>,
        wait: bool,
    ) -> Result<SubmittedAgent, ExecutorError> {
        let task = self.store.create_task(
            NewTask::new(description).with_metadata("worker_profile", profile.as_str().into()),
        )?;
        let mut new_agent = NewAgent::new(profile, description).for_task(&task.id);
        if let Some(name) = custom_name {
            new_agent = new_agent.with_custom_name(name);
        }
        let agent = self.store.create_agent(new_agent)?;
        self.store.update_task(&task.id, |t| t.status = TaskStatus::Running)?;

        let options = SpawnOptions {
            auto_approve: true,
            keep_alive: false,
            timeout: None,
        };
        if let Err(e) = self.executor.spawn(&agent.id, description, options).await {
            self.close_task(&task.id, AgentStatus::Failed, Some(e.to_string()))?;
            return Err(e);
        }

        let outcome = if wait {
            let outcome = self.executor.wait(&agent.id).await?;
            self.close_task(&task.id, outcome.status, outcome.error_message.clone())?;
            Some(outcome)
        } else {
            None
        };

        Ok(SubmittedAgent {
            task: self.store.get_task(&task.id)?,
            agent: self.store.get_agent(&agent.id)?,
            outcome,
        })
    }

    /// Close an ad hoc task according to how its agent ended.
    fn close_task(
        &self,
        task_id: &str,
        status: AgentStatus,
        reason: Option<String>,
    ) -> Result<(), StoreError> {
        self.store.update_task(task_id, |t| {
            if t.status.is_terminal() {
                return;
            }
            t.status = if status == AgentStatus::Completed {
                TaskStatus::Completed
            } else {
                TaskStatus::Cancelled
            };
            t.metadata
                .insert(TASK_OUTCOME.to_string(), status.to_string().into());
            if let Some(reason) = reason {
                t.metadata.insert("reason".to_string(), reason.into());
            }
        })?;
        Ok(())
    }
}
