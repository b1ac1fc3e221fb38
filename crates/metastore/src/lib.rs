//! Metadata store for datasets, architectures, models and tasks.
//!
//! Records are persisted through a [`DocumentStore`] backend. Every read
//! that a caller can observe goes through a visibility [`Predicate`], and
//! every mutation goes through a [`SaveContext`].

mod context;
mod input;
mod query;
mod repository;
mod schema;
mod storage;
mod task;

pub use context::SaveContext;
pub use input::{
    ArchitecturePatch, DatasetPatch, ModelPatch, NewArchitecture, NewDataset, NewModel,
};
pub use query::{owned_by, visible_by_id, visible_to, Caller, Field, Literal, Page, Predicate};
pub use repository::MetadataRepository;
pub use schema::{
    Architecture, Dataset, DatasetCategory, DatasetStatus, Kind, Model, ModelStatus, Record,
    ResourceBase,
};
pub use storage::{DocumentStore, FileBackedStore, InMemoryStore, StoredDocument};
pub use task::{ErrorRecord, Operation, Task, TaskConfig, TaskStatus};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetaError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: Kind, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: Kind,
        id: String,
        from: String,
        to: String,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl MetaError {
    pub fn not_found(kind: Kind, id: impl Into<String>) -> Self {
        MetaError::NotFound { kind, id: id.into() }
    }

    /// Stable name of the error variant, used when errors are transcribed
    /// into task history.
    pub fn kind_name(&self) -> &'static str {
        match self {
            MetaError::NotFound { .. } => "NotFound",
            MetaError::Validation(_) => "ValidationError",
            MetaError::AccessDenied(_) => "AccessDenied",
            MetaError::Conflict(_) => "ConflictError",
            MetaError::InvalidTransition { .. } => "InvalidTransition",
            MetaError::Storage(_) => "StorageError",
            MetaError::Serialization(_) => "SerializationError",
        }
    }
}

impl From<serde_json::Error> for MetaError {
    fn from(e: serde_json::Error) -> Self {
        MetaError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MetaError>;

/// Current time as unix seconds.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
