//! Per-agent supervision task.
//!
//! One tokio task per live worker waits for the process to exit, emits
//! heartbeats while it runs, enforces the timeout for non-keep-alive agents,
//! and records the terminal status exactly once.

use std::process::ExitStatus;
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::process::{self, Signal};
use super::{AgentOutcome, RunningMap};
use crate::store::{AgentStatus, Metadata, StateStore};

/// Metadata key set when a graceful stop was requested.
pub const STOP_REQUESTED_AT: &str = "stop_requested_at";
/// Metadata key set when a stop escalated to SIGKILL.
pub const STOP_FORCED: &str = "stop_forced";
/// Metadata key holding the worker's exit code.
pub const EXIT_CODE: &str = "exit_code";

pub(crate) const FORCED_MESSAGE: &str = "forcefully terminated (SIGKILL)";
pub(crate) const GRACEFUL_MESSAGE: &str = "terminated gracefully (SIGTERM)";

/// How the worker process ended, as observed by the supervisor.
#[derive(Debug)]
pub(crate) enum ExitObservation {
    Exited(ExitStatus),
    TimedOut(Duration),
    WaitFailed(String),
}

pub(crate) struct Supervision {
    pub store: StateStore,
    pub agent_id: String,
    pub child: Child,
    pub pid: u32,
    pub keep_alive: bool,
    pub timeout: Option<Duration>,
    pub heartbeat: Duration,
    pub outcome_tx: watch::Sender<Option<AgentOutcome>>,
    pub running: RunningMap,
}

pub(crate) async fn supervise(mut s: Supervision) {
    let agent_id = s.agent_id.clone();
    let deadline = if s.keep_alive { None } else { s.timeout };

    let sleep = async {
        match deadline {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(sleep);

    let mut heartbeat = tokio::time::interval(s.heartbeat);
    heartbeat.tick().await;
    let started = tokio::time::Instant::now();

    let observation = loop {
        tokio::select! {
            status = s.child.wait() => {
                break match status {
                    Ok(status) => ExitObservation::Exited(status),
                    Err(e) => ExitObservation::WaitFailed(e.to_string()),
                };
            }
            _ = heartbeat.tick() => {
                let elapsed = started.elapsed().as_secs();
                if s.keep_alive {
                    info!(agent_id = %agent_id, pid = s.pid, elapsed_secs = elapsed, "agent heartbeat");
                } else {
                    debug!(agent_id = %agent_id, pid = s.pid, elapsed_secs = elapsed, "agent heartbeat");
                }
            }
            _ = &mut sleep => {
                let limit = deadline.unwrap_or_default();
                warn!(agent_id = %agent_id, pid = s.pid, timeout_secs = limit.as_secs(), "agent timed out, killing");
                if let Err(e) = process::signal_group(s.pid, Signal::Kill) {
                    warn!(agent_id = %agent_id, error = %e, "failed to kill timed-out worker");
                }
                let _ = s.child.wait().await;
                break ExitObservation::TimedOut(limit);
            }
        }
    };

    let outcome = finalize(&s.store, &agent_id, &observation).await;
    let _ = s.outcome_tx.send(Some(outcome));
    s.running.lock().await.remove(&agent_id);
}

const FINALIZE_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const FINALIZE_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Record the terminal status. The first writer wins: if a stop already
/// finalized the record it is left untouched.
///
/// Lock contention is retried until the write lands, so the agent stays in
/// the running map and its watchers wait until the record is terminal.
async fn finalize(
    store: &StateStore,
    agent_id: &str,
    observation: &ExitObservation,
) -> AgentOutcome {
    let exit_code = match observation {
        ExitObservation::Exited(status) => status.code(),
        _ => None,
    };
    let mut backoff = FINALIZE_INITIAL_BACKOFF;

    loop {
        // Classified inside the write so stop flags set meanwhile are seen.
        let result = store.update_agent(agent_id, |agent| {
            if agent.status.is_terminal() {
                return;
            }
            let (status, message) = classify(observation, &agent.metadata);
            agent.status = status;
            agent.process_handle = None;
            agent.error_message = message;
            if let Some(code) = exit_code {
                agent.metadata.insert(EXIT_CODE.into(), code.into());
            }
        });

        match result {
            Ok(agent) => {
                info!(agent_id, status = %agent.status, "agent finished");
                return AgentOutcome {
                    agent_id: agent.id,
                    status: agent.status,
                    exit_code,
                    error_message: agent.error_message,
                };
            }
            Err(e) if e.is_transient() => {
                warn!(agent_id, error = %e, retry_in_ms = backoff.as_millis() as u64, "could not record agent exit, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(FINALIZE_MAX_BACKOFF);
            }
            Err(e) => {
                error!(agent_id, error = %e, "failed to record agent exit");
                let (status, message) = classify(observation, &Metadata::new());
                return AgentOutcome {
                    agent_id: agent_id.to_string(),
                    status,
                    exit_code,
                    error_message: message,
                };
            }
        }
    }
}

/// Map an exit observation plus the stop flags to a terminal status.
pub(crate) fn classify(
    observation: &ExitObservation,
    metadata: &Metadata,
) -> (AgentStatus, Option<String>) {
    if metadata.contains_key(STOP_FORCED) {
        return (AgentStatus::Cancelled, Some(FORCED_MESSAGE.to_string()));
    }
    if metadata.contains_key(STOP_REQUESTED_AT) {
        return (AgentStatus::Cancelled, Some(GRACEFUL_MESSAGE.to_string()));
    }

    match observation {
        ExitObservation::TimedOut(limit) => (
            AgentStatus::Failed,
            Some(format!("timed out after {}s", limit.as_secs())),
        ),
        ExitObservation::WaitFailed(e) => (
            AgentStatus::Failed,
            Some(format!("could not determine exit status: {e}")),
        ),
        ExitObservation::Exited(status) if status.success() => (AgentStatus::Completed, None),
        ExitObservation::Exited(status) => (AgentStatus::Failed, Some(describe_exit(status))),
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exited with code {code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("terminated by signal {signal}");
        }
    }
    "exited abnormally".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn exited(code: i32) -> ExitObservation {
        ExitObservation::Exited(ExitStatus::from_raw(code << 8))
    }

    #[test]
    fn test_clean_exit_completes() {
        let (status, message) = classify(&exited(0), &Metadata::new());
        assert_eq!(status, AgentStatus::Completed);
        assert!(message.is_none());
    }

    #[test]
    fn test_nonzero_exit_fails_with_code() {
        let (status, message) = classify(&exited(3), &Metadata::new());
        assert_eq!(status, AgentStatus::Failed);
        assert_eq!(message.as_deref(), Some("exited with code 3"));
    }

    #[test]
    fn test_signal_death_is_described() {
        let observation = ExitObservation::Exited(ExitStatus::from_raw(libc::SIGSEGV));
        let (status, message) = classify(&observation, &Metadata::new());
        assert_eq!(status, AgentStatus::Failed);
        assert_eq!(
            message,
            Some(format!("terminated by signal {}", libc::SIGSEGV))
        );
    }

    #[test]
    fn test_stop_flags_take_precedence() {
        let mut metadata = Metadata::new();
        metadata.insert(STOP_REQUESTED_AT.into(), serde_json::json!("2026-01-01T00:00:00Z"));
        let (status, message) = classify(&exited(143), &metadata);
        assert_eq!(status, AgentStatus::Cancelled);
        assert_eq!(message.as_deref(), Some(GRACEFUL_MESSAGE));

        metadata.insert(STOP_FORCED.into(), serde_json::json!(true));
        let (status, message) = classify(&exited(0), &metadata);
        assert_eq!(status, AgentStatus::Cancelled);
        assert_eq!(message.as_deref(), Some(FORCED_MESSAGE));
    }

    #[test]
    fn test_timeout_fails() {
        let (status, message) = classify(
            &ExitObservation::TimedOut(Duration::from_secs(90)),
            &Metadata::new(),
        );
        assert_eq!(status, AgentStatus::Failed);
        assert_eq!(message.as_deref(), Some("timed out after 90s"));
    }

    #[tokio::test]
    async fn test_exit_is_recorded_once_the_record_lock_frees_up() {
        use crate::store::{NewAgent, RecordLock, StoreOptions};
        use crate::profile::WorkerProfile;
        use std::collections::HashMap;
        use std::sync::Arc;
        use tokio::sync::Mutex;

        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(
            dir.path().join(".foreman"),
            StoreOptions {
                lock_timeout: Duration::from_millis(50),
            },
        )
        .unwrap();
        let agent = store
            .create_agent(NewAgent::new(WorkerProfile::Backend, "contended exit"))
            .unwrap();

        let child = tokio::process::Command::new("/bin/sh")
            .args(["-c", "exit 3"])
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        store
            .update_agent(&agent.id, |a| {
                a.status = AgentStatus::Running;
                a.process_handle = Some(pid);
            })
            .unwrap();

        let lock_path = store
            .root()
            .join("state/agents")
            .join(format!("{}.lock", agent.id));
        let held = RecordLock::acquire(&lock_path, &agent.id, Duration::from_secs(1)).unwrap();

        let (tx, rx) = watch::channel(None);
        let running: RunningMap = Arc::new(Mutex::new(HashMap::new()));
        running.lock().await.insert(agent.id.clone(), rx.clone());
        let handle = tokio::spawn(supervise(Supervision {
            store: store.clone(),
            agent_id: agent.id.clone(),
            child,
            pid,
            keep_alive: true,
            timeout: None,
            heartbeat: Duration::from_secs(30),
            outcome_tx: tx,
            running: Arc::clone(&running),
        }));

        // The worker is gone but the write keeps timing out on the lock.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(running.lock().await.contains_key(&agent.id));
        assert!(rx.borrow().is_none());
        assert_eq!(store.get_agent(&agent.id).unwrap().status, AgentStatus::Running);

        drop(held);
        tokio::time::timeout(Duration::from_secs(10), handle)
            .await
            .unwrap()
            .unwrap();

        let finished = store.get_agent(&agent.id).unwrap();
        assert_eq!(finished.status, AgentStatus::Failed);
        assert_eq!(finished.error_message.as_deref(), Some("exited with code 3"));
        assert_eq!(finished.metadata[EXIT_CODE], 3);
        assert!(finished.process_handle.is_none());
        assert!(!running.lock().await.contains_key(&agent.id));
        let outcome = rx.borrow().clone().unwrap();
        assert_eq!(outcome.status, AgentStatus::Failed);
        assert_eq!(outcome.exit_code, Some(3));
    }

    #[test]
    fn test_wait_failure_fails() {
        let (status, message) = classify(
            &ExitObservation::WaitFailed("ECHILD".into()),
            &Metadata::new(),
        );
        assert_eq!(status, AgentStatus::Failed);
        assert!(message.unwrap().starts_with("could not determine exit status"));
    }
}
