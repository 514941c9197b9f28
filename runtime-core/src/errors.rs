use crate::ids::{Did, TaskId, WorkerId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Wire-transmissible mirror of `RuntimeError`'s classification, carried
/// on `ReportTaskResult` so the dispatcher's retry decision doesn't have to
/// collapse every worker-side failure into a bare `bool` (spec §7).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    /// No classification supplied by the reporting worker; treated as
    /// retriable since most unclassified task errors are transient
    /// user-code/process faults rather than structural ones.
    #[default]
    Unspecified,
    Transfer,
    WorkerUnreachable,
    TaskFailure,
    Timeout,
    StreamClose,
    StorageBackend,
    NoSources,
    Submission,
    UnknownData,
    CorruptState,
}

impl FailureKind {
    pub fn retriable(self) -> bool {
        match self {
            FailureKind::Unspecified
            | FailureKind::Transfer
            | FailureKind::WorkerUnreachable
            | FailureKind::TaskFailure
            | FailureKind::Timeout
            | FailureKind::StreamClose => true,
            FailureKind::StorageBackend
            | FailureKind::NoSources
            | FailureKind::Submission
            | FailureKind::UnknownData
            | FailureKind::CorruptState => false,
        }
    }
}

/// Error kinds surfaced at the runtime's public boundary, matching the
/// classification in the error-handling design: each variant knows
/// whether the dispatcher may retry it.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("malformed task submission: {0}")]
    Submission(String),

    #[error("access on unknown data id {0}")]
    UnknownData(Did),

    #[error("transient data transfer failure for {renaming}: {reason}")]
    Transfer { renaming: String, reason: String },

    #[error("worker {0} unreachable")]
    WorkerUnreachable(WorkerId),

    #[error("task {task} failed: {message}")]
    TaskFailure { task: TaskId, message: String },

    #[error("task {0} exceeded its implementation timeout")]
    Timeout(TaskId),

    #[error("scheduler invariant violated: {0}")]
    CorruptSchedulerState(String),

    #[error("stdio finalization failed for task {0}")]
    StreamClose(TaskId),

    #[error("storage backend error: {0}")]
    StorageBackend(String),

    #[error("no live source remains for renaming {0}")]
    NoSources(String),

    #[error("load error for renaming {0}: {1}")]
    Load(String, String),
}

impl RuntimeError {
    /// Classifies this error into its wire-transmissible `FailureKind`.
    pub fn kind(&self) -> FailureKind {
        match self {
            RuntimeError::Submission(_) => FailureKind::Submission,
            RuntimeError::UnknownData(_) => FailureKind::UnknownData,
            RuntimeError::Transfer { .. } => FailureKind::Transfer,
            RuntimeError::WorkerUnreachable(_) => FailureKind::WorkerUnreachable,
            RuntimeError::TaskFailure { .. } => FailureKind::TaskFailure,
            RuntimeError::Timeout(_) => FailureKind::Timeout,
            RuntimeError::CorruptSchedulerState(_) => FailureKind::CorruptState,
            RuntimeError::StreamClose(_) => FailureKind::StreamClose,
            RuntimeError::StorageBackend(_) => FailureKind::StorageBackend,
            RuntimeError::NoSources(_) => FailureKind::NoSources,
            RuntimeError::Load(_, _) => FailureKind::StorageBackend,
        }
    }

    /// Whether the scheduler may requeue the owning task after this error,
    /// per the retry policy in spec §4.3 / §7.
    pub fn retriable(&self) -> bool {
        self.kind().retriable()
    }

    /// Whether this error must stop the dispatcher entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuntimeError::CorruptSchedulerState(_))
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
