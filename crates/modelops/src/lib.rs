//! Contracts the orchestrator needs from the model backend and the dataset
//! store, with a subprocess backend and a filesystem store.

pub mod backend;
pub mod datasets;
pub mod process;

pub use backend::{
    metrics_from_value, Artifact, BackendError, FitData, FitOutcome, Metrics, ModelBackend,
    SplitRef, TrainConfig,
};
pub use datasets::{
    DatasetError, DatasetSource, DatasetStorage, FsDatasetStorage, Staged, StoredContent,
    MAX_DATASET_SIZE, REQUIRED_SPLITS,
};
pub use process::ProcessBackend;
