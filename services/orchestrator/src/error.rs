use metastore::{Kind, MetaError};
use modelops::{BackendError, DatasetError};
use thiserror::Error;

use crate::queue::QueueError;

/// Failures of one task execution. The variant name (see [`kind_name`])
/// becomes `history.error.type` on the failed task.
///
/// [`kind_name`]: ExecutionError::kind_name
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error(transparent)]
    Metadata(#[from] MetaError),

    #[error("{kind} referenced by the task does not exist: {id}")]
    MissingReference { kind: Kind, id: String },

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Blocking worker failed: {0}")]
    Join(String),

    #[error("Task {0} was interrupted before it finished")]
    Interrupted(String),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

impl ExecutionError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExecutionError::TaskNotFound(_) => "TaskNotFound",
            ExecutionError::Metadata(e) => e.kind_name(),
            ExecutionError::MissingReference { .. } => "MissingReference",
            ExecutionError::Backend(_) => "BackendError",
            ExecutionError::Dataset(_) => "DatasetError",
            ExecutionError::Join(_) => "WorkerPanic",
            ExecutionError::Interrupted(_) => "Interrupted",
            ExecutionError::Queue(_) => "QueueError",
        }
    }
}

impl From<tokio::task::JoinError> for ExecutionError {
    fn from(e: tokio::task::JoinError) -> Self {
        ExecutionError::Join(e.to_string())
    }
}

/// Errors of the request-side service. Mostly metadata errors; storage
/// and queue failures are carried through.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Metadata(#[from] MetaError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Blocking worker failed: {0}")]
    Join(String),
}

impl ServiceError {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ServiceError::Metadata(e) => e.kind_name(),
            ServiceError::Dataset(_) => "DatasetError",
            ServiceError::Queue(_) => "QueueError",
            ServiceError::Join(_) => "WorkerPanic",
        }
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Join(e.to_string())
    }
}
