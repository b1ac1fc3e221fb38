use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("failed to spawn backend worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("backend I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend worker reported: {0}")]
    Worker(String),

    #[error("backend worker exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("backend protocol error: {0}")]
    Protocol(String),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),
}

pub type Result<T> = std::result::Result<T, BackendError>;

/// Metric name -> value.
pub type Metrics = BTreeMap<String, f64>;

/// A constructed model as the backend knows it. `handle` is opaque to the
/// orchestrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub handle: JsonValue,
    pub input_shape: Vec<u32>,
}

/// Compile and fit parameters handed to the backend.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: u32,
    pub epochs: u32,
    pub optimizer: Option<String>,
    pub loss: Option<String>,
    pub learning_rate: Option<f64>,
    pub metrics: Vec<String>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            epochs: 1,
            optimizer: None,
            loss: None,
            learning_rate: None,
            metrics: Vec::new(),
        }
    }
}

/// A named split of a stored dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitRef {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitData {
    pub train: SplitRef,
    pub validation: Option<SplitRef>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitOutcome {
    pub artifact: Artifact,
    /// Per-epoch history as reported by the backend.
    pub history: JsonValue,
    /// Final metrics, if the backend reports them.
    #[serde(default)]
    pub metrics: Metrics,
}

/// Numeric model capability.
///
/// All calls block for their full duration; fit in particular can run for
/// hours. Callers on an async runtime must move them to a blocking thread.
pub trait ModelBackend: Send + Sync {
    fn construct(&self, architecture: &JsonValue, input_shape: &[u32]) -> Result<Artifact>;

    fn configure(&self, artifact: &mut Artifact, config: &TrainConfig) -> Result<()>;

    fn fit(&self, artifact: &Artifact, data: &FitData, config: &TrainConfig) -> Result<FitOutcome>;

    fn evaluate(&self, artifact: &Artifact, data: &SplitRef) -> Result<Metrics>;

    fn predict(&self, artifact: &Artifact, input: &JsonValue) -> Result<JsonValue>;

    fn save(&self, artifact: &Artifact, location: &Path) -> Result<()>;

    fn load(&self, location: &Path) -> Result<Artifact>;
}

/// Turns a backend evaluation result into named metrics.
///
/// A map is taken as is; a bare number is the loss; a list is zipped with
/// `names` (falling back to `metric_<i>`).
pub fn metrics_from_value(value: &JsonValue, names: &[String]) -> Result<Metrics> {
    match value {
        JsonValue::Number(n) => {
            let loss = n
                .as_f64()
                .ok_or_else(|| BackendError::Protocol(format!("non-finite loss: {n}")))?;
            Ok(Metrics::from([("loss".to_string(), loss)]))
        }
        JsonValue::Array(values) => values
            .iter()
            .enumerate()
            .map(|(i, v)| {
                let name = names.get(i).cloned().unwrap_or_else(|| format!("metric_{i}"));
                v.as_f64()
                    .map(|f| (name.clone(), f))
                    .ok_or_else(|| BackendError::Protocol(format!("metric {name} is not a number")))
            })
            .collect(),
        JsonValue::Object(map) => map
            .iter()
            .map(|(k, v)| {
                v.as_f64()
                    .map(|f| (k.clone(), f))
                    .ok_or_else(|| BackendError::Protocol(format!("metric {k} is not a number")))
            })
            .collect(),
        other => Err(BackendError::Protocol(format!("unexpected metrics payload: {other}"))),
    }
}
