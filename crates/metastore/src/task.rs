use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::schema::{Kind, Record};
use crate::{MetaError, Result};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Train,
    Test,
    Predict,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Train => "train",
            Operation::Test => "test",
            Operation::Predict => "predict",
        }
    }

    /// Train and test read a dataset; predict runs on inline input.
    pub fn needs_dataset(&self) -> bool {
        matches!(self, Operation::Train | Operation::Test)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Started,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }

    /// Pending -> Started -> Success | Failure, nothing else.
    pub fn can_advance_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Started) | (Started, Success) | (Started, Failure)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Started => "STARTED",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
        }
    }
}

fn default_batch_size() -> u32 {
    32
}

fn default_epochs() -> u32 {
    1
}

/// Operation parameters. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskConfig {
    /// Overrides the model's dataset reference.
    #[serde(default)]
    pub dataset: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
    #[serde(default = "default_epochs")]
    pub epochs: u32,
    #[serde(default)]
    pub optimizer: Option<String>,
    #[serde(default)]
    pub loss: Option<String>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Inline inference input, predict only.
    #[serde(default)]
    pub input: Option<JsonValue>,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            dataset: None,
            batch_size: default_batch_size(),
            epochs: default_epochs(),
            optimizer: None,
            loss: None,
            learning_rate: None,
            metrics: Vec::new(),
            input: None,
        }
    }
}

impl TaskConfig {
    pub fn from_json(value: JsonValue) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| MetaError::Validation(e.to_string()))
    }

    pub fn validate(&self, op: Operation) -> Result<()> {
        if self.batch_size == 0 {
            return Err(MetaError::Validation("batch_size must be greater than 0".into()));
        }
        if self.epochs == 0 {
            return Err(MetaError::Validation("epochs must be greater than 0".into()));
        }
        if let Some(lr) = self.learning_rate {
            if !(lr.is_finite() && lr > 0.0) {
                return Err(MetaError::Validation("learning_rate must be positive".into()));
            }
        }
        if op == Operation::Predict && self.input.is_none() {
            return Err(MetaError::Validation("predict requires an input".into()));
        }
        Ok(())
    }
}

/// Structured failure written to `history.error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub trace: String,
}

impl ErrorRecord {
    /// Builds a record from an error, rendering its `source()` chain as the trace.
    pub fn from_error(kind: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = err.to_string();
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\ncaused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        Self {
            kind: kind.into(),
            message: err.to_string(),
            trace,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub owner: String,
    pub is_public: bool,
    pub model: String,
    pub operation: Operation,
    pub config: TaskConfig,
    #[serde(default)]
    pub history: Map<String, JsonValue>,
    pub status: TaskStatus,

    pub created_at: i64,
    #[serde(default)]
    pub started_at: Option<i64>,
    #[serde(default)]
    pub finished_at: Option<i64>,
}

impl Task {
    pub fn new(
        owner: impl Into<String>,
        model: impl Into<String>,
        operation: Operation,
        config: TaskConfig,
    ) -> Self {
        Self {
            id: String::new(),
            owner: owner.into(),
            is_public: false,
            model: model.into(),
            operation,
            config,
            history: Map::new(),
            status: TaskStatus::Pending,
            created_at: crate::now_ts(),
            started_at: None,
            finished_at: None,
        }
    }

    fn advance(&mut self, next: TaskStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(MetaError::InvalidTransition {
                kind: Kind::Task,
                id: self.id.clone(),
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Worker picked the task up.
    pub fn start(&mut self, now_ts: i64) -> Result<()> {
        self.advance(TaskStatus::Started)?;
        self.started_at = Some(now_ts);
        Ok(())
    }

    /// Merges `result` into history and moves to Success.
    pub fn complete(&mut self, result: Map<String, JsonValue>, now_ts: i64) -> Result<()> {
        self.advance(TaskStatus::Success)?;
        self.history.extend(result);
        self.finished_at = Some(now_ts);
        Ok(())
    }

    pub fn fail(&mut self, error: ErrorRecord, now_ts: i64) -> Result<()> {
        self.advance(TaskStatus::Failure)?;
        let error = serde_json::to_value(error)?;
        self.history.insert("error".to_string(), error);
        self.finished_at = Some(now_ts);
        Ok(())
    }

    pub fn error(&self) -> Option<ErrorRecord> {
        self.history
            .get("error")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl Record for Task {
    const KIND: Kind = Kind::Task;

    fn id(&self) -> &str {
        &self.id
    }

    fn set_id(&mut self, id: String) {
        self.id = id;
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn is_public(&self) -> bool {
        self.is_public
    }
}
