//! Typed error hierarchy for foreman.
//!
//! Four top-level enums cover the four subsystems:
//! - `StoreError`: persistence and locking failures
//! - `ExecutorError`: worker process launch and supervision failures
//! - `PlanError`: malformed execution plans
//! - `PipelineError`: increment execution failures
//!
//! Lock timeouts are transient and retried by callers; `NotFound` and
//! `Corrupted` are integrity failures and are always surfaced.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::store::AgentStatus;

/// Which kind of record a store error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Agent,
    Task,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKind::Agent => write!(f, "agent"),
            RecordKind::Task => write!(f, "task"),
        }
    }
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: RecordKind, id: String },

    #[error("Timed out after {waited:?} waiting for the lock on {id}")]
    LockTimeout { id: String, waited: Duration },

    #[error("Record id {id} already exists")]
    DuplicateId { id: String },

    #[error("Corrupted record at {path}: {source}")]
    Corrupted {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Field '{field}' of {id} cannot be changed once set")]
    ImmutableField { id: String, field: &'static str },

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize record: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout { .. })
    }
}

/// Errors from the process executor.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("Failed to launch worker for agent {agent_id}: {source}")]
    SpawnFailed {
        agent_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Agent {agent_id} is {status}, expected {expected}")]
    InvalidState {
        agent_id: String,
        status: AgentStatus,
        expected: AgentStatus,
    },

    #[error("Failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from building an execution plan.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Increment {index} depends on increment {dependency}, which is not earlier in the plan")]
    InvalidDependency { index: usize, dependency: usize },

    #[error("Increment at position {position} carries index {index}")]
    OutOfOrder { position: usize, index: usize },
}

/// Errors from the execution pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Increment {index} started before dependency {dependency} completed")]
    DependencyNotMet { index: usize, dependency: usize },

    #[error("Verification of increment {index} could not run: {message}")]
    Verification { index: usize, message: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Plan(#[from] PlanError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_not_found_carries_kind_and_id() {
        let err = StoreError::NotFound {
            kind: RecordKind::Agent,
            id: "backend-add-login".into(),
        };
        assert_eq!(err.to_string(), "agent backend-add-login not found");
        assert!(!err.is_transient());
    }

    #[test]
    fn test_lock_timeout_is_transient() {
        let err = StoreError::LockTimeout {
            id: "task-1".into(),
            waited: Duration::from_millis(250),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("task-1"));
    }

    #[test]
    fn test_executor_error_converts_from_store_error() {
        let inner = StoreError::NotFound {
            kind: RecordKind::Task,
            id: "task-9".into(),
        };
        let err: ExecutorError = inner.into();
        match &err {
            ExecutorError::Store(StoreError::NotFound { kind, id }) => {
                assert_eq!(*kind, RecordKind::Task);
                assert_eq!(id, "task-9");
            }
            _ => panic!("Expected ExecutorError::Store(NotFound)"),
        }
    }

    #[test]
    fn test_spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "q not found");
        let err = ExecutorError::SpawnFailed {
            agent_id: "test-login".into(),
            source: io_err,
        };
        match &err {
            ExecutorError::SpawnFailed { source, .. } => {
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn test_pipeline_error_wraps_plan_error() {
        let err: PipelineError = PlanError::InvalidDependency {
            index: 1,
            dependency: 3,
        }
        .into();
        assert!(matches!(
            err,
            PipelineError::Plan(PlanError::InvalidDependency { index: 1, dependency: 3 })
        ));
    }

    #[test]
    fn test_all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoreError::DuplicateId { id: "x".into() });
        assert_std_error(&PlanError::OutOfOrder {
            position: 0,
            index: 2,
        });
        assert_std_error(&PipelineError::Verification {
            index: 0,
            message: "log unreadable".into(),
        });
    }
}
