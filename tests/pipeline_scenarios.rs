//! End-to-end pipeline scenarios against real worker processes.
//!
//! Workers are `/bin/sh -c <script>`; the script sees the task text on stdin
//! and the agent's result directory in `$FOREMAN_RESULT_DIR`.
#![cfg(unix)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use foreman::errors::PipelineError;
use foreman::executor::{Executor, ExecutorConfig, SpawnOptions, StopOutcome, WorkerCommand};
use foreman::pipeline::{
    LogScanVerifier, PipelineConfig, PipelineEvent, PlanOutcome, Session, Verdict, Verifier,
};
use foreman::planner::{Increment, IncrementStatus, Planner, ProjectContext};
use foreman::profile::WorkerProfile;
use foreman::store::{
    Agent, AgentFilter, AgentStatus, NewAgent, StateStore, StoreOptions, TaskStatus,
};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

struct Harness {
    session: Session,
    _dir: TempDir,
}

fn harness(script: &str, verifier: Arc<dyn Verifier>, max_attempts: u32) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = StateStore::open(dir.path().join(".foreman"), StoreOptions::default()).unwrap();
    let worker = WorkerCommand {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        ..Default::default()
    };
    let config = ExecutorConfig::new(worker, dir.path())
        .with_grace_period(Duration::from_millis(300))
        .with_heartbeat_interval(Duration::from_millis(100));
    let session = Session::new(
        Executor::new(store, config),
        verifier,
        ProjectContext::default(),
        Planner::default(),
        PipelineConfig {
            max_attempts,
            ..Default::default()
        },
    );
    Harness { session, _dir: dir }
}

fn log_scan() -> Arc<dyn Verifier> {
    Arc::new(LogScanVerifier::default())
}

async fn drain(mut rx: UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn attempt_of(agent: &Agent) -> u64 {
    agent.metadata["attempt"].as_u64().unwrap()
}

#[tokio::test]
async fn test_failing_worker_is_retried_with_feedback_until_budget() {
    let mut h = harness(
        r#"cat > "$FOREMAN_RESULT_DIR/task.txt"; echo "attempt output"; exit 1"#,
        log_scan(),
        3,
    );
    let plan = h.session.submit("Write tests for the login module");
    assert_eq!(plan.len(), 1);
    assert_eq!(plan.increments()[0].worker_profile, WorkerProfile::Test);

    let (rx, handle) = h.session.execute(plan);
    let events = drain(rx).await;
    let report = handle.await.unwrap().unwrap();

    match &report.outcome {
        PlanOutcome::Failed {
            index,
            reason,
            feedback,
        } => {
            assert_eq!(*index, 0);
            assert_eq!(reason, "gave up after 3 attempts");
            let feedback = feedback.as_deref().unwrap();
            assert!(feedback.contains("exited with code 1"));
            assert!(feedback.contains("attempt output"));
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(report.increments[0].status, IncrementStatus::Failed);
    assert_eq!(report.increments[0].retry_count, 3);
    assert_eq!(report.failed(), vec![0]);

    let store = h.session.store();
    let mut agents = store
        .list_agents(&AgentFilter::task(&report.task_ids[0]), None)
        .unwrap();
    agents.sort_by_key(attempt_of);
    assert_eq!(agents.len(), 3);
    assert!(agents.iter().all(|a| a.status == AgentStatus::Failed));

    // Each retry links to the attempt before it.
    assert_eq!(agents[0].parent_id, None);
    assert_eq!(agents[1].parent_id.as_deref(), Some(agents[0].id.as_str()));
    assert_eq!(agents[2].parent_id.as_deref(), Some(agents[1].id.as_str()));

    let first = std::fs::read_to_string(agents[0].result_dir.join("task.txt")).unwrap();
    assert!(first.contains("## INCREMENT 1"));
    assert!(!first.contains("PREVIOUS ATTEMPT FAILED"));
    let second = std::fs::read_to_string(agents[1].result_dir.join("task.txt")).unwrap();
    assert!(second.contains("PREVIOUS ATTEMPT FAILED (this is attempt 2)"));
    assert!(second.contains("exited with code 1"));
    let third = std::fs::read_to_string(agents[2].result_dir.join("task.txt")).unwrap();
    assert!(third.contains("(this is attempt 3)"));

    let task = store.get_task(&report.task_ids[0]).unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.metadata["outcome"], "failed");

    let retries = events
        .iter()
        .filter(|e| e.status == IncrementStatus::Pending && e.detail.starts_with("retrying"))
        .count();
    assert_eq!(retries, 2);
    assert_eq!(events.last().unwrap().status, IncrementStatus::Failed);
}

#[tokio::test]
async fn test_feature_plan_runs_in_dependency_order() {
    let mut h = harness("cat > /dev/null; echo done", log_scan(), 3);
    let plan = h
        .session
        .submit("Add user authentication with login UI, API, and tests");
    assert!(plan.len() >= 3);
    let dependencies: Vec<Vec<usize>> = plan
        .increments()
        .iter()
        .map(|i| i.dependencies.clone())
        .collect();

    let (rx, handle) = h.session.execute(plan);
    let events = drain(rx).await;
    let report = handle.await.unwrap().unwrap();

    assert!(report.is_success(), "{}", report.render());
    assert_eq!(report.completed().len(), dependencies.len());

    let position = |index: usize, status: IncrementStatus| {
        events
            .iter()
            .position(|e| e.increment_index == index && e.status == status)
            .unwrap()
    };
    for (index, deps) in dependencies.iter().enumerate() {
        let started = position(index, IncrementStatus::InProgress);
        for &dep in deps {
            assert!(position(dep, IncrementStatus::Completed) < started);
        }
        assert!(position(index, IncrementStatus::Verifying) > started);
    }

    for task_id in &report.task_ids {
        let task = h.session.store().get_task(task_id).unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }
}

#[tokio::test]
async fn test_error_markers_fail_verification() {
    let mut h = harness(
        "cat > /dev/null; echo 'error: build broke'; exit 0",
        log_scan(),
        2,
    );
    let plan = h.session.submit("Write tests for the login module");
    let (rx, handle) = h.session.execute(plan);
    drain(rx).await;
    let report = handle.await.unwrap().unwrap();

    match report.outcome {
        PlanOutcome::Failed { feedback, .. } => {
            let feedback = feedback.unwrap();
            assert!(feedback.contains("Errors detected in agent log"));
            assert!(feedback.contains("error: build broke"));
        }
        other => panic!("expected failure, got {other:?}"),
    }

    // The agents themselves completed; only verification rejected them.
    let agents = h
        .session
        .store()
        .list_agents(&AgentFilter::task(&report.task_ids[0]), None)
        .unwrap();
    assert_eq!(agents.len(), 2);
    assert!(agents.iter().all(|a| a.status == AgentStatus::Completed));
}

/// Rejects the first verification and accepts every later one.
struct SecondTimeLucky {
    calls: AtomicUsize,
}

#[async_trait]
impl Verifier for SecondTimeLucky {
    async fn verify(&self, _increment: &Increment, _agent: &Agent) -> Result<Verdict, PipelineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
            Ok(Verdict::fail("missing docstrings"))
        } else {
            Ok(Verdict::Pass)
        }
    }
}

#[tokio::test]
async fn test_custom_verifier_drives_retry() {
    let verifier = Arc::new(SecondTimeLucky {
        calls: AtomicUsize::new(0),
    });
    let mut h = harness(
        r#"cat > "$FOREMAN_RESULT_DIR/task.txt""#,
        verifier.clone(),
        3,
    );
    let plan = h.session.submit("Update the README");
    let (rx, handle) = h.session.execute(plan);
    drain(rx).await;
    let report = handle.await.unwrap().unwrap();

    assert!(report.is_success());
    assert_eq!(report.increments[0].retry_count, 1);
    assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);

    let agents = h
        .session
        .store()
        .list_agents(&AgentFilter::task(&report.task_ids[0]), None)
        .unwrap();
    let retry = agents.iter().find(|a| attempt_of(a) == 2).unwrap();
    let text = std::fs::read_to_string(retry.result_dir.join("task.txt")).unwrap();
    assert!(text.contains("missing docstrings"));
}

#[tokio::test]
async fn test_cancelling_agent_halts_plan() {
    let mut h = harness("sleep 30", log_scan(), 3);
    let plan = h.session.submit("Refactor the billing service");
    assert_eq!(plan.len(), 2);

    let (rx, handle) = h.session.execute(plan);
    let store = h.session.store().clone();
    let running = loop {
        let agents = store
            .list_agents(&AgentFilter::status(AgentStatus::Running), None)
            .unwrap();
        if let Some(agent) = agents.into_iter().next() {
            break agent;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    let cancelled = h.session.cancel(&running.id).await.unwrap();
    assert!(matches!(
        cancelled.agents[0].1,
        StopOutcome::Cancelled { .. }
    ));

    drain(rx).await;
    let report = handle.await.unwrap().unwrap();
    assert!(matches!(report.outcome, PlanOutcome::Cancelled { index: 0, .. }));
    assert_eq!(report.increments[0].retry_count, 0);
    assert_eq!(report.pending(), vec![1]);

    let skipped = store.get_task(&report.task_ids[1]).unwrap();
    assert_eq!(skipped.status, TaskStatus::Cancelled);
    assert_eq!(skipped.metadata["outcome"], "not_started");
}

#[tokio::test]
async fn test_cancel_before_launch_halts_plan_with_report() {
    let mut h = harness("exit 0", log_scan(), 3);
    let plan = h.session.submit("Refactor the billing service");
    assert_eq!(plan.len(), 2);

    // Cancel the agent the moment it is created, before the worker launches.
    let store = h.session.store().clone();
    let canceller = store.clone();
    let (rx, handle) = h.session.execute_observed(plan, move |event| {
        if event.status == IncrementStatus::InProgress
            && let Some(agent_id) = &event.agent_id
        {
            canceller
                .finish_agent(
                    agent_id,
                    AgentStatus::Cancelled,
                    Some("cancelled before launch".to_string()),
                )
                .unwrap();
        }
    });

    let events = drain(rx).await;
    let report = handle.await.unwrap().unwrap();
    match &report.outcome {
        PlanOutcome::Cancelled { index, reason } => {
            assert_eq!(*index, 0);
            assert!(reason.contains("cancelled before launch"));
        }
        other => panic!("expected cancellation, got {other:?}"),
    }
    assert_eq!(report.increments[0].status, IncrementStatus::Failed);
    assert_eq!(report.increments[0].retry_count, 0);
    assert_eq!(report.pending(), vec![1]);
    assert_eq!(events.last().unwrap().status, IncrementStatus::Failed);

    let current = store.get_task(&report.task_ids[0]).unwrap();
    assert_eq!(current.status, TaskStatus::Cancelled);
    assert_eq!(current.metadata["outcome"], "cancelled");
    let skipped = store.get_task(&report.task_ids[1]).unwrap();
    assert_eq!(skipped.status, TaskStatus::Cancelled);
    assert_eq!(skipped.metadata["outcome"], "not_started");

    let agents = store
        .list_agents(&AgentFilter::task(&report.task_ids[0]), None)
        .unwrap();
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].status, AgentStatus::Cancelled);
    assert!(agents[0].process_handle.is_none());
}

#[tokio::test]
async fn test_stop_then_force_stop_cancels_stubborn_agent() {
    let h = harness("trap '' TERM; while :; do sleep 1; done", log_scan(), 3);
    let executor = h.session.executor();
    let agent = h
        .session
        .store()
        .create_agent(NewAgent::new(WorkerProfile::Backend, "ignore every signal"))
        .unwrap();
    executor
        .spawn(&agent.id, "ignore every signal", SpawnOptions::default())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        executor.stop(&agent.id, false).await.unwrap(),
        StopOutcome::StillRunning
    );
    assert_eq!(
        h.session.store().get_agent(&agent.id).unwrap().status,
        AgentStatus::Running
    );

    assert_eq!(
        executor.stop(&agent.id, true).await.unwrap(),
        StopOutcome::Cancelled { forced: true }
    );
    let outcome = executor.wait(&agent.id).await.unwrap();
    assert_eq!(outcome.status, AgentStatus::Cancelled);

    let stopped = h.session.store().get_agent(&agent.id).unwrap();
    assert_eq!(stopped.status, AgentStatus::Cancelled);
    assert!(stopped.error_message.unwrap().contains("forcefully terminated"));
    assert_eq!(stopped.process_handle, None);
}
