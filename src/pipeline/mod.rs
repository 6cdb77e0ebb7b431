//! Execution pipeline.
//!
//! Drives each increment of a plan through
//! `pending -> in_progress -> verifying -> completed`, retrying with
//! feedback on failure. Increments run one at a time in index order, and
//! the first increment that cannot be completed halts the plan.
//!
//! Every attempt is a fresh agent; retries link to the previous attempt
//! through `parent_id`.

pub mod events;
pub mod prompt;
pub mod session;
pub mod verify;

pub use events::{EventObserver, EventSink, PipelineEvent};
pub use session::{CancelReport, Session, StatusSnapshot, SubmittedAgent};
pub use verify::{LogScanVerifier, Verdict, Verifier, VerifyConfig};

use std::fmt::Write;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::errors::{ExecutorError, PipelineError};
use crate::executor::{Executor, SpawnOptions};
use crate::planner::{ExecutionPlan, Increment, IncrementStatus, ProjectContext};
use crate::store::{
    AgentStatus, NewAgent, NewTask, StateStore, TASK_OUTCOME, TaskPriority, TaskStatus,
};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Total attempts per increment, first try included.
    pub max_attempts: u32,
    /// Log lines quoted in retry feedback when a worker fails.
    pub feedback_log_lines: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            feedback_log_lines: 20,
        }
    }
}

/// How a plan execution ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PlanOutcome {
    Completed,
    /// An increment exhausted its attempts.
    Failed {
        index: usize,
        reason: String,
        feedback: Option<String>,
    },
    /// An agent or task was cancelled from outside.
    Cancelled { index: usize, reason: String },
}

/// Final state of every increment after a plan run. Partial progress is
/// always reported.
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub outcome: PlanOutcome,
    pub increments: Vec<Increment>,
    /// Task created for each increment, by index.
    pub task_ids: Vec<String>,
}

impl PlanReport {
    pub fn is_success(&self) -> bool {
        self.outcome == PlanOutcome::Completed
    }

    fn indices_with(&self, status: IncrementStatus) -> Vec<usize> {
        self.increments
            .iter()
            .filter(|i| i.status == status)
            .map(|i| i.index)
            .collect()
    }

    pub fn completed(&self) -> Vec<usize> {
        self.indices_with(IncrementStatus::Completed)
    }

    pub fn failed(&self) -> Vec<usize> {
        self.indices_with(IncrementStatus::Failed)
    }

    pub fn pending(&self) -> Vec<usize> {
        self.indices_with(IncrementStatus::Pending)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let total = self.increments.len();
        let _ = match &self.outcome {
            PlanOutcome::Completed => writeln!(out, "All {total} increments completed"),
            PlanOutcome::Failed { index, reason, .. } => writeln!(
                out,
                "Halted: increment {} failed after retries ({reason})",
                index + 1
            ),
            PlanOutcome::Cancelled { index, reason } => {
                writeln!(out, "Halted: increment {} cancelled ({reason})", index + 1)
            }
        };
        let _ = writeln!(
            out,
            "Completed {}/{total}, failed {}, not started {}",
            self.completed().len(),
            self.failed().len(),
            self.pending().len()
        );
        if let PlanOutcome::Failed {
            feedback: Some(feedback),
            ..
        } = &self.outcome
        {
            let _ = writeln!(out, "Last feedback:\n{feedback}");
        }
        out
    }
}

/// Result of driving one increment.
enum IncrementResult {
    Completed,
    Failed { reason: String },
    Cancelled { reason: String },
}

/// Runs plans against a store and executor. Cheap to clone.
#[derive(Clone)]
pub struct Pipeline {
    store: StateStore,
    executor: Executor,
    verifier: Arc<dyn Verifier>,
    context: ProjectContext,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        executor: Executor,
        verifier: Arc<dyn Verifier>,
        context: ProjectContext,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store: executor.store().clone(),
            executor,
            verifier,
            context,
            config,
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Execute `plan` to completion or to the first increment that halts it.
    #[instrument(skip_all, fields(increments = plan.len()))]
    pub async fn execute(
        &self,
        plan: &ExecutionPlan,
        events: &EventSink,
    ) -> Result<PlanReport, PipelineError> {
        let task_ids = self.create_tasks(plan)?;
        let mut increments = plan.increments().to_vec();
        let mut outcome = PlanOutcome::Completed;

        for index in 0..increments.len() {
            if let Some(&dependency) = increments[index]
                .dependencies
                .iter()
                .find(|&&d| increments[d].status != IncrementStatus::Completed)
            {
                return Err(PipelineError::DependencyNotMet { index, dependency });
            }

            let result = self
                .run_increment(&mut increments[index], plan.request(), &task_ids[index], events)
                .await?;

            match result {
                IncrementResult::Completed => {
                    self.store.update_task(&task_ids[index], |t| {
                        if !t.status.is_terminal() {
                            t.status = TaskStatus::Completed;
                        }
                    })?;
                }
                IncrementResult::Failed { reason } => {
                    self.close_task(&task_ids[index], "failed", &reason)?;
                    outcome = PlanOutcome::Failed {
                        index,
                        reason,
                        feedback: increments[index].verification_feedback.clone(),
                    };
                    break;
                }
                IncrementResult::Cancelled { reason } => {
                    self.close_task(&task_ids[index], "cancelled", &reason)?;
                    outcome = PlanOutcome::Cancelled { index, reason };
                    break;
                }
            }
        }

        for inc in increments.iter().filter(|i| i.status == IncrementStatus::Pending) {
            self.close_task(&task_ids[inc.index], "not_started", "plan halted")?;
        }

        let report = PlanReport {
            outcome,
            increments,
            task_ids,
        };
        info!(
            completed = report.completed().len(),
            failed = report.failed().len(),
            pending = report.pending().len(),
            "plan finished"
        );
        Ok(report)
    }

    /// One high-priority task per increment; dependency edges carry over.
    fn create_tasks(&self, plan: &ExecutionPlan) -> Result<Vec<String>, PipelineError> {
        let mut task_ids: Vec<String> = Vec::with_capacity(plan.len());
        for inc in plan.increments() {
            let task = self.store.create_task(
                NewTask::new(&inc.description)
                    .with_priority(TaskPriority::High)
                    .with_dependencies(
                        inc.dependencies.iter().map(|d| task_ids[*d].clone()).collect(),
                    )
                    .with_metadata("increment_index", inc.index.into())
                    .with_metadata("request", plan.request().into()),
            )?;
            task_ids.push(task.id);
        }
        Ok(task_ids)
    }

    /// Cancel a task that did not complete, recording why.
    fn close_task(&self, task_id: &str, outcome: &str, reason: &str) -> Result<(), PipelineError> {
        self.store.update_task(task_id, |t| {
            if !t.status.is_terminal() {
                t.status = TaskStatus::Cancelled;
            }
            t.metadata
                .entry(TASK_OUTCOME.to_string())
                .or_insert_with(|| outcome.into());
            t.metadata
                .entry("reason".to_string())
                .or_insert_with(|| reason.into());
        })?;
        Ok(())
    }

    async fn run_increment(
        &self,
        inc: &mut Increment,
        request: &str,
        task_id: &str,
        events: &EventSink,
    ) -> Result<IncrementResult, PipelineError> {
        let mut parent: Option<String> = None;

        loop {
            let attempt = inc.retry_count + 1;
            let emit = |inc: &Increment, detail: String, agent_id: Option<&str>| {
                events.emit(PipelineEvent {
                    increment_index: inc.index,
                    status: inc.status,
                    detail,
                    attempt,
                    agent_id: agent_id.map(str::to_string),
                });
            };

            let task = self.store.get_task(task_id)?;
            if task.status == TaskStatus::Cancelled {
                inc.status = IncrementStatus::Failed;
                let reason = "task cancelled".to_string();
                emit(inc, reason.clone(), None);
                return Ok(IncrementResult::Cancelled { reason });
            }
            self.store.update_task(task_id, |t| {
                if t.status == TaskStatus::Pending {
                    t.status = TaskStatus::Running;
                }
            })?;

            let agent = self.store.create_agent(
                NewAgent::new(inc.worker_profile, &inc.description)
                    .for_task(task_id)
                    .with_parent(parent.clone())
                    .with_metadata("increment_index", inc.index.into())
                    .with_metadata("attempt", attempt.into()),
            )?;
            inc.status = IncrementStatus::InProgress;
            emit(inc, format!("agent {} started", agent.id), Some(&agent.id));

            let text = prompt::build_task_text(
                inc,
                request,
                &self.context,
                inc.verification_feedback.as_deref(),
                attempt,
            );
            let options = SpawnOptions {
                auto_approve: true,
                keep_alive: true,
                timeout: None,
            };

            let failure = match self.executor.spawn(&agent.id, &text, options).await {
                Err(ExecutorError::SpawnFailed { source, .. }) => {
                    format!("Worker could not be launched: {source}")
                }
                Err(ExecutorError::InvalidState {
                    status: AgentStatus::Cancelled,
                    ..
                }) => {
                    // Cancelled between creation and launch.
                    let cancelled = self.store.get_agent(&agent.id)?;
                    inc.status = IncrementStatus::Failed;
                    let reason = cancelled_reason(&agent.id, cancelled.error_message.as_deref());
                    emit(inc, reason.clone(), Some(&agent.id));
                    return Ok(IncrementResult::Cancelled { reason });
                }
                Err(e) => return Err(e.into()),
                Ok(_) => {
                    let outcome = self.executor.wait(&agent.id).await?;
                    match outcome.status {
                        AgentStatus::Completed => {
                            inc.status = IncrementStatus::Verifying;
                            emit(inc, "verifying".to_string(), Some(&agent.id));

                            let finished = self.store.get_agent(&agent.id)?;
                            match self.verifier.verify(inc, &finished).await? {
                                Verdict::Pass => {
                                    inc.status = IncrementStatus::Completed;
                                    inc.verification_feedback = None;
                                    emit(inc, "verified".to_string(), Some(&agent.id));
                                    return Ok(IncrementResult::Completed);
                                }
                                Verdict::Fail { feedback } => feedback,
                            }
                        }
                        AgentStatus::Cancelled => {
                            inc.status = IncrementStatus::Failed;
                            let reason =
                                cancelled_reason(&agent.id, outcome.error_message.as_deref());
                            emit(inc, reason.clone(), Some(&agent.id));
                            return Ok(IncrementResult::Cancelled { reason });
                        }
                        status => self.failure_feedback(&agent.id, status, outcome.error_message),
                    }
                }
            };

            inc.retry_count += 1;
            inc.verification_feedback = Some(failure.clone());
            if inc.retry_count >= self.config.max_attempts {
                inc.status = IncrementStatus::Failed;
                let reason = format!("gave up after {} attempts", inc.retry_count);
                warn!(increment = inc.index, %reason, "increment failed");
                emit(inc, format!("{reason}: {failure}"), Some(&agent.id));
                return Ok(IncrementResult::Failed { reason });
            }

            inc.status = IncrementStatus::Pending;
            emit(inc, format!("retrying: {failure}"), Some(&agent.id));
            parent = Some(agent.id);
        }
    }

    /// Feedback for a worker that ended without completing.
    fn failure_feedback(
        &self,
        agent_id: &str,
        status: AgentStatus,
        error_message: Option<String>,
    ) -> String {
        let mut feedback = format!(
            "Worker {status}: {}",
            error_message.as_deref().unwrap_or("no error message")
        );
        let log_tail = self
            .executor
            .read_log(agent_id, Some(self.config.feedback_log_lines))
            .unwrap_or_default();
        if !log_tail.trim().is_empty() {
            feedback.push_str("\nLast log lines:\n");
            feedback.push_str(&log_tail);
        }
        feedback
    }
}

fn cancelled_reason(agent_id: &str, message: Option<&str>) -> String {
    format!(
        "agent {agent_id} was cancelled: {}",
        message.unwrap_or("no reason given")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::WorkerProfile;

    fn report(statuses: &[IncrementStatus], outcome: PlanOutcome) -> PlanReport {
        let increments = statuses
            .iter()
            .enumerate()
            .map(|(i, status)| {
                let mut inc = Increment::new(
                    i,
                    format!("step {i}"),
                    WorkerProfile::Backend,
                    crate::planner::Layer::General,
                    30,
                );
                inc.status = *status;
                inc
            })
            .collect();
        PlanReport {
            outcome,
            increments,
            task_ids: Vec::new(),
        }
    }

    #[test]
    fn test_report_partitions_increments() {
        let r = report(
            &[
                IncrementStatus::Completed,
                IncrementStatus::Failed,
                IncrementStatus::Pending,
            ],
            PlanOutcome::Failed {
                index: 1,
                reason: "gave up after 3 attempts".into(),
                feedback: Some("Worker failed: exited with code 1".into()),
            },
        );
        assert!(!r.is_success());
        assert_eq!(r.completed(), vec![0]);
        assert_eq!(r.failed(), vec![1]);
        assert_eq!(r.pending(), vec![2]);

        let text = r.render();
        assert!(text.contains("increment 2 failed"));
        assert!(text.contains("Completed 1/3, failed 1, not started 1"));
        assert!(text.contains("exited with code 1"));
    }

    #[test]
    fn test_successful_report_renders_total() {
        let r = report(
            &[IncrementStatus::Completed, IncrementStatus::Completed],
            PlanOutcome::Completed,
        );
        assert!(r.is_success());
        assert!(r.render().starts_with("All 2 increments completed"));
    }
}
